use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::types::{Fidelity, Layout};

#[derive(Parser, Debug, serde::Serialize)]
#[command(
    name = "romset",
    version,
    about = "Verify and repair a folder of zipped sets against a DAT catalog"
)]
pub struct Cli {
    /// DAT catalog describing the expected sets
    #[arg(short = 'd', long = "dat", value_name = "PATH")]
    pub dat: PathBuf,

    /// Folder holding one zip archive per set
    #[arg(short = 'i', long = "input", value_name = "PATH")]
    pub input: PathBuf,

    /// fast compares stored CRC32 and size; slow also decompresses and compares SHA1
    #[arg(long = "fidelity", value_enum, default_value_t = Fidelity::Fast)]
    pub fidelity: Fidelity,

    /// Rearrange parent/clone archives into the given layout after verification
    #[arg(long = "convert", value_enum, value_name = "LAYOUT")]
    pub convert: Option<Layout>,

    /// Folder receiving repaired or converted archives (defaults to --input)
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Folder of archives to copy missing or bad files from
    #[arg(long = "rebuild-from", value_name = "PATH")]
    pub rebuild_from: Option<PathBuf>,

    /// Only process sets whose name matches (repeatable, globs allowed)
    #[arg(short = 'f', long = "filter", value_name = "NAME", action = ArgAction::Append)]
    pub filter: Vec<String>,

    /// Also report archives and archive entries the DAT does not describe
    #[arg(long = "report-all")]
    pub report_all: bool,

    /// Number of worker threads (defaults to logical CPU count)
    #[arg(short = 'j', long = "jobs", value_name = "N")]
    pub jobs: Option<usize>,

    /// Write the JSON report to this file instead of stdout
    #[arg(long = "report", value_name = "PATH")]
    pub report: Option<PathBuf>,

    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    pub quiet: u8,
}
