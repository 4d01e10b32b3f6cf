use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::{CatalogEntry, Finding, FindingScope};
use crate::types::{Fidelity, Layout, Reason};

/// Outcome for one processed catalog entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntryStatus {
    pub name: String,
    pub passed: bool,
    pub findings: Vec<Finding>,
    /// Files rebuilt from the secondary folder during this run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repaired: Vec<String>,
}

impl EntryStatus {
    pub fn from_entry(entry: &CatalogEntry, repaired: Vec<String>) -> Self {
        Self {
            name: entry.name.clone(),
            passed: !entry.has_error(),
            findings: entry.findings().to_vec(),
            repaired,
        }
    }

    /// True when the whole set was missing or unreadable.
    pub fn is_whole_entry_miss(&self) -> bool {
        self.findings.iter().any(|f| f.scope == FindingScope::Entry)
    }

    pub fn has_finding(&self, reason: Reason, target: Option<&str>) -> bool {
        self.findings
            .iter()
            .any(|f| f.reason == reason && f.target.as_deref() == target)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum RunStatus {
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "cancelled")]
    Cancelled,
}

/// Content present in the folder that the catalog does not describe.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Extraneous {
    pub archive: PathBuf,
    /// `None` when the whole archive is unknown.
    pub entry: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LayoutChange {
    pub entry: String,
    pub to: Layout,
    pub archive: PathBuf,
    pub files_moved: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunStats {
    pub entries_total: usize,
    pub entries_processed: usize,
    pub archives_opened: usize,
    /// Decompressed content streams opened while verifying.
    pub streams_opened: usize,
    pub bytes_hashed: u64,
}

impl RunStats {
    pub(crate) fn absorb(&mut self, other: &RunStats) {
        self.archives_opened += other.archives_opened;
        self.streams_opened += other.streams_opened;
        self.bytes_hashed = self.bytes_hashed.saturating_add(other.bytes_hashed);
    }
}

/// Result of one verification run. Built once at the end of the run.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub generated_at: DateTime<Utc>,
    pub status: RunStatus,
    pub fidelity: Fidelity,
    pub romset: PathBuf,
    pub result_folder: PathBuf,
    pub processed: Vec<EntryStatus>,
    pub failed: Vec<EntryStatus>,
    pub extraneous: Vec<Extraneous>,
    pub conversions: Vec<LayoutChange>,
    pub stats: RunStats,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.status == RunStatus::Done && self.failed.is_empty()
    }

    pub fn failed_entry(&self, name: &str) -> Option<&EntryStatus> {
        self.failed.iter().find(|s| s.name == name)
    }

    pub fn processed_entry(&self, name: &str) -> Option<&EntryStatus> {
        self.processed.iter().find(|s| s.name == name)
    }

    /// Every processed entry, passing or failing, by name.
    pub fn entry(&self, name: &str) -> Option<&EntryStatus> {
        self.processed_entry(name).or_else(|| self.failed_entry(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FileSpec;

    #[test]
    fn status_mirrors_entry_findings() {
        let mut entry = CatalogEntry::new("g").with_file(FileSpec::new("a", 1, "00000000"));
        let clean = EntryStatus::from_entry(&entry, Vec::new());
        assert!(clean.passed);

        entry.mark(Reason::BadHash, Some("a"));
        let failed = EntryStatus::from_entry(&entry, Vec::new());
        assert!(!failed.passed);
        assert!(failed.has_finding(Reason::BadHash, Some("a")));
        assert!(!failed.is_whole_entry_miss());
    }

    #[test]
    fn serializes_reasons_in_snake_case() {
        let mut entry = CatalogEntry::new("g");
        entry.mark(Reason::MissingFile, None);
        let json = serde_json::to_value(EntryStatus::from_entry(&entry, Vec::new())).unwrap();
        assert_eq!(json["findings"][0]["reason"], "missing_file");
        assert_eq!(json["findings"][0]["scope"], "entry");
        assert!(json["findings"][0]["target"].is_null());
    }
}
