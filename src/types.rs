use clap::ValueEnum;
use serde::Serialize;
use std::fmt;

/// How deep a verification pass looks into archive content.
#[derive(Debug, Clone, Copy, Serialize, ValueEnum, PartialEq, Eq, Hash, Default)]
pub enum Fidelity {
    /// CRC32 and size from the archive directory only.
    #[default]
    #[serde(rename = "fast")]
    Fast,
    /// Additionally decompress and compare SHA1.
    #[serde(rename = "slow")]
    Slow,
}

impl Fidelity {
    pub fn wants_sha1(&self) -> bool {
        matches!(self, Fidelity::Slow)
    }
}

/// Physical organisation of parent/clone content in a romset folder.
#[derive(Debug, Clone, Copy, Serialize, ValueEnum, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Clones live inside their parent's archive under `<clone>/`.
    #[serde(rename = "merged")]
    Merged,
    /// Every set has its own archive holding only its exclusive files.
    #[serde(rename = "split")]
    Split,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Merged => write!(f, "merged"),
            Layout::Split => write!(f, "split"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reason {
    #[serde(rename = "missing_file")]
    MissingFile,
    #[serde(rename = "bad_hash")]
    BadHash,
    #[serde(rename = "archive_access")]
    ArchiveAccess,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::MissingFile => write!(f, "missing"),
            Reason::BadHash => write!(f, "bad hash"),
            Reason::ArchiveAccess => write!(f, "archive unreadable"),
        }
    }
}
