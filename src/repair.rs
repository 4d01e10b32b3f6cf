//! Rebuild missing or bad files from a secondary folder of archives.
//!
//! Candidates are looked up by set name first (`<rebuild>/<set>.zip`, then the
//! parent's archive), falling back to a checksum index over every archive in
//! the folder. Candidate bytes are re-hashed before anything is written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::archive::{Archive, ArchiveMode};
use crate::catalog::{CatalogEntry, FileSpec, FindingScope};
use crate::checksum::digest_bytes;
use crate::types::Reason;
use crate::verify::{EntryOutcome, FolderIndex, RunContext, SetLocation, archive_file_name};

type ChecksumKey = (String, u64);

/// Secondary archive folder used as the source of replacement content.
pub struct RebuildSource {
    index: FolderIndex,
    by_checksum: Option<HashMap<ChecksumKey, Vec<(PathBuf, String)>>>,
    verbose: u8,
}

impl RebuildSource {
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        let index = FolderIndex::scan(root)
            .with_context(|| format!("scanning rebuild folder {}", root.display()))?;
        Ok(Self {
            index,
            by_checksum: None,
            verbose: 0,
        })
    }

    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn root(&self) -> &Path {
        self.index.root()
    }

    fn checksum_index(&mut self) -> &HashMap<ChecksumKey, Vec<(PathBuf, String)>> {
        let index = &self.index;
        let verbose = self.verbose;
        self.by_checksum.get_or_insert_with(|| {
            let mut map: HashMap<ChecksumKey, Vec<(PathBuf, String)>> = HashMap::new();
            for (_, path) in index.iter() {
                let archive = match Archive::open(path, ArchiveMode::Read) {
                    Ok(archive) => archive,
                    Err(err) => {
                        vprintln!(verbose, 2, "skipping rebuild source: {err}");
                        continue;
                    }
                };
                for entry in archive.list_entries() {
                    map.entry((entry.crc32.clone(), entry.size))
                        .or_default()
                        .push((path.to_path_buf(), entry.name.clone()));
                }
            }
            map
        })
    }

    /// Content matching `spec`, verified by CRC32 and size, and by SHA1 when
    /// `with_sha1` is set and the catalog records one.
    pub fn find(&mut self, entry: &CatalogEntry, spec: &FileSpec, with_sha1: bool) -> Option<Vec<u8>> {
        let mut candidates: Vec<(PathBuf, String)> = Vec::new();
        if let Some(path) = self.index.get(&entry.name) {
            candidates.push((path.to_path_buf(), spec.archive_path(None)));
        }
        if let Some(path) = entry.parent_name.as_deref().and_then(|p| self.index.get(p)) {
            candidates.push((path.to_path_buf(), spec.shared_path()));
        }
        if let Some(bytes) = candidates
            .iter()
            .find_map(|(path, name)| read_matching(path, name, spec, with_sha1))
        {
            return Some(bytes);
        }

        let key = (spec.crc32.clone(), spec.size);
        let by_checksum = self.checksum_index().get(&key).cloned().unwrap_or_default();
        by_checksum
            .iter()
            .find_map(|(path, name)| read_matching(path, name, spec, with_sha1))
    }
}

fn read_matching(path: &Path, name: &str, spec: &FileSpec, with_sha1: bool) -> Option<Vec<u8>> {
    let mut archive = Archive::open(path, ArchiveMode::Read).ok()?;
    let listed = archive.find(name)?;
    if listed.size != spec.size || listed.crc32 != spec.crc32 {
        return None;
    }
    let bytes = archive.read_entry(name).ok()?;
    let expected_sha1 = spec.sha1.as_deref().filter(|_| with_sha1);
    let digest = digest_bytes(&bytes, expected_sha1.is_some());
    let sha1_ok = expected_sha1.is_none_or(|sha1| digest.sha1.as_deref() == Some(sha1));
    (digest.crc32 == spec.crc32 && digest.size == spec.size && sha1_ok).then_some(bytes)
}

/// Try to clear the findings of one failed entry. Failures to repair are
/// logged and leave the findings in place.
pub(crate) fn repair_entry(ctx: &RunContext<'_>, rebuild: &mut RebuildSource, outcome: &mut EntryOutcome) {
    let verbose = ctx.config.verbose;
    let with_sha1 = ctx.config.fidelity.wants_sha1();

    let whole_entry: Vec<Reason> = outcome
        .entry
        .findings()
        .iter()
        .filter(|f| f.scope == FindingScope::Entry)
        .map(|f| f.reason)
        .collect();
    if !whole_entry.is_empty() {
        if outcome.location.is_none() && whole_entry.iter().all(|r| *r == Reason::MissingFile) {
            if let Err(err) = rebuild_set(ctx, rebuild, outcome, with_sha1) {
                if ctx.config.quiet == 0 {
                    eprintln!("{}: rebuild failed: {err:#}", outcome.entry.name);
                }
            }
        }
        return;
    }

    let broken: Vec<FileSpec> = outcome
        .entry
        .files
        .iter()
        .filter(|f| f.has_error())
        .cloned()
        .collect();
    let mut found = Vec::new();
    for spec in broken {
        match rebuild.find(&outcome.entry, &spec, with_sha1) {
            Some(bytes) => found.push((spec, bytes)),
            None => vprintln!(
                verbose,
                2,
                "{}: no replacement for {} in {}",
                outcome.entry.name,
                spec.archive_path(None),
                rebuild.root().display()
            ),
        }
    }
    if found.is_empty() {
        return;
    }

    let Some(location) = outcome.location.clone() else {
        return;
    };
    let prefix = outcome.prefix().map(str::to_string);
    match write_files(ctx, &location, prefix.as_deref(), &found) {
        Ok(()) => {
            for (spec, _) in &found {
                outcome
                    .entry
                    .resolve_file(&spec.name, spec.sub_path.as_deref());
                outcome.repaired.push(spec.archive_path(None));
            }
            vprintln!(
                verbose,
                1,
                "{}: repaired {} file(s)",
                outcome.entry.name,
                found.len()
            );
        }
        Err(err) => {
            if ctx.config.quiet == 0 {
                eprintln!("{}: repair failed: {err:#}", outcome.entry.name);
            }
        }
    }
}

fn write_files(
    ctx: &RunContext<'_>,
    location: &SetLocation,
    prefix: Option<&str>,
    files: &[(FileSpec, Vec<u8>)],
) -> anyhow::Result<()> {
    let file_name = location
        .archive()
        .file_name()
        .and_then(|n| n.to_str())
        .context("archive path has no file name")?;
    let target = ctx.working_copy(file_name)?;
    let mode = if target.exists() {
        ArchiveMode::Update
    } else {
        ArchiveMode::Create
    };
    let mut archive = Archive::open(&target, mode)?;
    for (spec, bytes) in files {
        archive.create_entry(&spec.archive_path(prefix), bytes.clone())?;
    }
    archive.close()?;
    Ok(())
}

/// Rebuild a set with no archive at all. Only written when every file is
/// available from the rebuild folder.
fn rebuild_set(
    ctx: &RunContext<'_>,
    rebuild: &mut RebuildSource,
    outcome: &mut EntryOutcome,
    with_sha1: bool,
) -> anyhow::Result<()> {
    let verbose = ctx.config.verbose;
    let wanted: Vec<&FileSpec> = outcome.entry.files.iter().filter(|f| !f.nodump).collect();
    if wanted.is_empty() {
        return Ok(());
    }

    let mut found = Vec::with_capacity(wanted.len());
    for spec in wanted {
        let Some(bytes) = rebuild.find(&outcome.entry, spec, with_sha1) else {
            vprintln!(
                verbose,
                2,
                "{}: cannot rebuild, {} unavailable",
                outcome.entry.name,
                spec.archive_path(None)
            );
            return Ok(());
        };
        found.push((spec.archive_path(None), bytes));
    }

    let target = ctx.target.join(archive_file_name(&outcome.entry.name));
    let mut archive = Archive::open(&target, ArchiveMode::Create)?;
    let mut repaired = Vec::with_capacity(found.len());
    for (name, bytes) in found {
        archive.create_entry(&name, bytes)?;
        repaired.push(name);
    }
    archive.close()?;

    vprintln!(verbose, 1, "{}: rebuilt into {}", outcome.entry.name, target.display());
    outcome.entry.resolve_entry();
    outcome.location = Some(SetLocation::Own(target));
    outcome.repaired = repaired;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let mut zipw = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in files {
            zipw.start_file(*name, SimpleFileOptions::default()).unwrap();
            zipw.write_all(data).unwrap();
        }
        zipw.finish().unwrap();
    }

    fn spec(name: &str, data: &[u8]) -> FileSpec {
        let digest = digest_bytes(data, true);
        FileSpec::new(name, digest.size, digest.crc32).with_sha1(digest.sha1.unwrap())
    }

    #[test]
    fn finds_by_set_name_first() {
        let dir = tempdir().unwrap();
        write_zip(&dir.path().join("game.zip"), &[("a.bin", b"alpha")]);
        let mut source = RebuildSource::open(dir.path()).unwrap();
        let entry = CatalogEntry::new("game").with_file(spec("a.bin", b"alpha"));

        let bytes = source.find(&entry, &spec("a.bin", b"alpha"), true).unwrap();
        assert_eq!(bytes, b"alpha");
        assert!(source.by_checksum.is_none());
    }

    #[test]
    fn falls_back_to_checksum_index() {
        let dir = tempdir().unwrap();
        write_zip(&dir.path().join("misc.zip"), &[("renamed.bin", b"alpha")]);
        let mut source = RebuildSource::open(dir.path()).unwrap();
        let entry = CatalogEntry::new("game");

        let bytes = source.find(&entry, &spec("a.bin", b"alpha"), false).unwrap();
        assert_eq!(bytes, b"alpha");
        assert!(source.by_checksum.is_some());
    }

    #[test]
    fn unreadable_archives_are_left_out_of_the_checksum_index() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("broken.zip"), b"not a zip").unwrap();
        write_zip(&dir.path().join("misc.zip"), &[("renamed.bin", b"alpha")]);
        let mut source = RebuildSource::open(dir.path()).unwrap().with_verbosity(2);
        let entry = CatalogEntry::new("game");

        let bytes = source.find(&entry, &spec("a.bin", b"alpha"), false).unwrap();
        assert_eq!(bytes, b"alpha");
        let indexed: usize = source.by_checksum.as_ref().unwrap().values().map(Vec::len).sum();
        assert_eq!(indexed, 1);
    }

    #[test]
    fn sha1_mismatch_is_rejected_under_slow() {
        let dir = tempdir().unwrap();
        write_zip(&dir.path().join("game.zip"), &[("a.bin", b"alpha")]);
        let mut source = RebuildSource::open(dir.path()).unwrap();
        let entry = CatalogEntry::new("game");
        let wrong = spec("a.bin", b"alpha").with_sha1("0000000000000000000000000000000000000000");

        assert!(source.find(&entry, &wrong, true).is_none());
        assert!(source.find(&entry, &wrong, false).is_some());
    }
}
