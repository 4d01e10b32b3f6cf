#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use romset::checksum::digest_bytes;
use romset::config::Config;
use romset::progress::ProgressSink;
use romset::report::EntryStatus;

pub fn write_zip(path: &Path, files: &[(&str, &[u8])]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut zipw = ZipWriter::new(File::create(path)?);
    for (name, data) in files {
        zipw.start_file(*name, SimpleFileOptions::default())?;
        zipw.write_all(data)?;
    }
    zipw.finish()?;
    Ok(())
}

pub fn zip_names(path: &Path) -> Result<Vec<String>> {
    let archive = zip::ZipArchive::new(File::open(path)?)?;
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    Ok(names)
}

/// `<rom>` element describing `data`.
pub fn rom(name: &str, data: &[u8]) -> String {
    let digest = digest_bytes(data, true);
    format!(
        r#"<rom name="{name}" size="{}" crc="{}" sha1="{}"/>"#,
        digest.size,
        digest.crc32,
        digest.sha1.unwrap_or_default()
    )
}

pub fn game(name: &str, attrs: &str, roms: &[String]) -> String {
    format!(r#"<game name="{name}" {attrs}>{}</game>"#, roms.concat())
}

pub fn write_dat(dir: &Path, games: &[String]) -> Result<PathBuf> {
    let path = dir.join("catalog.dat");
    let xml = format!(
        "<?xml version=\"1.0\"?>\n<datafile><header><name>Test Set</name></header>{}</datafile>",
        games.concat()
    );
    fs::write(&path, xml)?;
    Ok(path)
}

pub fn config(dat: &Path, input: &Path) -> Config {
    Config {
        dat: dat.to_path_buf(),
        input: input.to_path_buf(),
        jobs: Some(1),
        ..Config::default()
    }
}

/// Sink recording every call, optionally requesting cancellation after a
/// number of completed entries.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<String>,
    pub progress: Vec<(String, usize, usize)>,
    pub errors: Vec<String>,
    pub processed: Vec<EntryStatus>,
    pub failed: Vec<EntryStatus>,
    pub cancel_after: Option<usize>,
    cancel: bool,
}

impl RecordingSink {
    pub fn cancelling_after(count: usize) -> Self {
        Self {
            cancel_after: Some(count),
            ..Self::default()
        }
    }

    pub fn last_event(&self) -> Option<&str> {
        self.events.last().map(String::as_str)
    }
}

impl ProgressSink for RecordingSink {
    fn init(&mut self, label: &str) {
        self.events.push(format!("init:{label}"));
    }

    fn progress(&mut self, label: &str, total: usize, current: usize) {
        self.progress.push((label.to_string(), total, current));
        if self.cancel_after == Some(current) {
            self.cancel = true;
        }
    }

    fn done(&mut self, label: &str, _result_folder: &Path) {
        self.events.push(format!("done:{label}"));
    }

    fn cancelled(&mut self, label: &str) {
        self.events.push(format!("cancelled:{label}"));
    }

    fn error(&mut self, err: &anyhow::Error) {
        self.errors.push(format!("{err:#}"));
        self.events.push("error".to_string());
    }

    fn set_processed(&mut self, entries: &[EntryStatus]) {
        self.processed = entries.to_vec();
    }

    fn set_errors(&mut self, entries: &[EntryStatus]) {
        self.failed = entries.to_vec();
    }

    fn must_cancel(&self) -> bool {
        self.cancel
    }

    fn set_must_cancel(&mut self, flag: bool) {
        self.cancel = flag;
    }
}
