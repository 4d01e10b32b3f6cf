//! Verification engine.
//!
//! A run walks the catalog once. Each selected entry is checked on its own
//! (optionally across a worker pool) against the archives in the romset
//! folder, producing a fresh copy of the entry carrying its findings. Repair
//! and layout conversion follow as sequential phases because they write to
//! archives that several entries can share.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use anyhow::Context;
use chrono::Utc;
use globset::GlobSet;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::archive::{Archive, ArchiveMode};
use crate::catalog::{Catalog, CatalogEntry, FileSpec};
use crate::config::Config;
use crate::error::EngineError;
use crate::progress::ProgressSink;
use crate::report::{EntryStatus, Extraneous, RunStats, RunStatus, VerifyReport};
use crate::types::Reason;

/// Zip archives found directly inside a folder, keyed by file stem.
#[derive(Debug, Clone, Default)]
pub struct FolderIndex {
    root: PathBuf,
    archives: BTreeMap<String, PathBuf>,
}

impl FolderIndex {
    pub fn scan(root: &Path) -> anyhow::Result<Self> {
        let mut archives = BTreeMap::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("reading folder {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            let is_zip = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
            if !is_zip {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                archives.insert(stem.to_string(), path.clone());
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            archives,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.archives.get(name).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.archives.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }
}

pub(crate) fn archive_file_name(set: &str) -> String {
    format!("{set}.zip")
}

/// Where a set's own files were found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SetLocation {
    Own(PathBuf),
    /// Merged into the parent's archive under `<set>/`.
    InParent { parent: String, archive: PathBuf },
}

impl SetLocation {
    pub(crate) fn archive(&self) -> &Path {
        match self {
            SetLocation::Own(path) => path,
            SetLocation::InParent { archive, .. } => archive,
        }
    }
}

pub(crate) struct EntryOutcome {
    pub order: usize,
    pub entry: CatalogEntry,
    pub location: Option<SetLocation>,
    pub extraneous: Vec<Extraneous>,
    pub repaired: Vec<String>,
    pub stats: RunStats,
}

impl EntryOutcome {
    /// Prefix of the set's files inside its located archive.
    pub(crate) fn prefix(&self) -> Option<&str> {
        match &self.location {
            Some(SetLocation::InParent { .. }) => Some(self.entry.name.as_str()),
            _ => None,
        }
    }
}

/// Shared, read-only state of one run.
pub(crate) struct RunContext<'a> {
    pub catalog: &'a Catalog,
    pub config: &'a Config,
    pub index: FolderIndex,
    pub target: PathBuf,
}

impl RunContext<'_> {
    /// Path of `file_name` in the target folder, seeded from the input folder
    /// when the run writes elsewhere. Input archives are never written then.
    pub(crate) fn working_copy(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        let target = self.target.join(file_name);
        if self.config.writes_elsewhere() && !target.exists() {
            let source = self.index.root().join(file_name);
            if source.exists() {
                std::fs::copy(&source, &target).with_context(|| {
                    format!("seeding {} from {}", target.display(), source.display())
                })?;
            }
        }
        Ok(target)
    }

    /// Current on-disk copy of an archive: the target's when present.
    pub(crate) fn current_copy(&self, file_name: &str) -> PathBuf {
        let target = self.target.join(file_name);
        if target.exists() {
            target
        } else {
            self.index.root().join(file_name)
        }
    }
}

/// One archive consulted while checking an entry.
struct Source {
    archive: Archive,
    /// `Some(prefix)` when this archive holds the set's own files.
    own: Option<Option<String>>,
    /// Whether files borrowed from a parent or BIOS live at its root.
    shared: bool,
}

impl Source {
    fn path_for(&self, spec: &FileSpec) -> Option<String> {
        if let Some(prefix) = &self.own {
            let path = spec.archive_path(prefix.as_deref());
            if self.archive.find(&path).is_some() {
                return Some(path);
            }
        }
        if self.shared {
            let path = spec.shared_path();
            if self.archive.find(&path).is_some() {
                return Some(path);
            }
        }
        None
    }
}

fn open_read(path: &Path, stats: &mut RunStats) -> crate::error::Result<Archive> {
    let archive = Archive::open(path, ArchiveMode::Read)?;
    stats.archives_opened += 1;
    Ok(archive)
}

fn retire(sources: Vec<Source>, stats: &mut RunStats) {
    for source in sources {
        stats.streams_opened += source.archive.streams_opened();
        stats.bytes_hashed = stats
            .bytes_hashed
            .saturating_add(source.archive.bytes_read());
    }
}

/// Find the archive holding the set's own files.
fn locate_set(
    ctx: &RunContext<'_>,
    entry: &CatalogEntry,
    stats: &mut RunStats,
) -> Option<(SetLocation, Option<Archive>)> {
    if let Some(path) = ctx.index.get(&entry.name) {
        return Some((SetLocation::Own(path.to_path_buf()), None));
    }
    let parent = entry.parent_name.as_deref()?;
    let path = ctx.index.get(parent)?;
    let archive = open_read(path, stats).ok()?;
    if archive.entries_under(&entry.name).is_empty() {
        return None;
    }
    let location = SetLocation::InParent {
        parent: parent.to_string(),
        archive: path.to_path_buf(),
    };
    Some((location, Some(archive)))
}

pub(crate) fn verify_entry(ctx: &RunContext<'_>, order: usize, source: &CatalogEntry) -> EntryOutcome {
    let verbose = ctx.config.verbose;
    let mut entry = source.clone();
    let mut stats = RunStats::default();
    let mut extraneous = Vec::new();

    let Some((location, preopened)) = locate_set(ctx, &entry, &mut stats) else {
        vprintln!(verbose, 2, "{}: no archive found", entry.name);
        entry.mark(Reason::MissingFile, None);
        return EntryOutcome {
            order,
            entry,
            location: None,
            extraneous,
            repaired: Vec::new(),
            stats,
        };
    };

    let own_archive = match preopened {
        Some(archive) => archive,
        None => match open_read(location.archive(), &mut stats) {
            Ok(archive) => archive,
            Err(err) => {
                vprintln!(verbose, 1, "{}: {err}", entry.name);
                entry.mark(Reason::ArchiveAccess, None);
                return EntryOutcome {
                    order,
                    entry,
                    location: Some(location),
                    extraneous,
                    repaired: Vec::new(),
                    stats,
                };
            }
        },
    };
    let prefix = match &location {
        SetLocation::InParent { parent, .. } => {
            vprintln!(verbose, 2, "{}: merged into {parent}", entry.name);
            Some(entry.name.clone())
        }
        SetLocation::Own(_) => None,
    };

    if ctx.config.report_all && prefix.is_none() {
        extraneous = unclaimed_entries(ctx.catalog, &entry, &own_archive);
    }

    let mut sources = vec![Source {
        archive: own_archive,
        own: Some(prefix),
        shared: false,
    }];

    if let Some(parent) = entry.parent_name.as_deref() {
        if let Some(path) = ctx.index.get(parent) {
            match open_read(path, &mut stats) {
                Ok(archive) => sources.push(Source {
                    archive,
                    own: None,
                    shared: true,
                }),
                Err(err) => vprintln!(verbose, 2, "{}: parent unavailable: {err}", entry.name),
            }
        }
    }

    let required_bios = entry.bios.as_ref().map(|b| b.name.clone());
    if let Some(bios) = &required_bios {
        if ctx.index.get(bios).is_none() {
            vprintln!(verbose, 2, "{}: BIOS {bios} not found", entry.name);
            entry.mark(Reason::MissingFile, Some(bios));
        }
    }
    if let Some(bios) = ctx.catalog.effective_bios(source) {
        if let Some(path) = ctx.index.get(bios).filter(|_| bios != source.name) {
            match open_read(path, &mut stats) {
                Ok(archive) => sources.push(Source {
                    archive,
                    own: None,
                    shared: true,
                }),
                Err(err) => {
                    vprintln!(verbose, 1, "{}: BIOS {bios} unreadable: {err}", entry.name);
                    if required_bios.as_deref() == Some(bios) {
                        entry.mark(Reason::ArchiveAccess, Some(bios));
                    }
                }
            }
        }
    }

    let with_sha1 = ctx.config.fidelity.wants_sha1();
    for spec in source.files.iter().filter(|f| !f.nodump) {
        let hit = sources
            .iter()
            .enumerate()
            .find_map(|(idx, s)| s.path_for(spec).map(|path| (idx, path)));
        let Some((idx, path)) = hit else {
            vprintln!(verbose, 2, "{}: {} missing", entry.name, spec.archive_path(None));
            entry.mark_file(Reason::MissingFile, &spec.name, spec.sub_path.as_deref());
            continue;
        };

        let archive = &mut sources[idx].archive;
        let matches_directory = archive
            .find(&path)
            .is_some_and(|stored| stored.size == spec.size && stored.crc32 == spec.crc32);
        if !matches_directory {
            vprintln!(verbose, 2, "{}: {} size/crc mismatch", entry.name, path);
            entry.mark_file(Reason::BadHash, &spec.name, spec.sub_path.as_deref());
            continue;
        }

        if let (true, Some(expected)) = (with_sha1, spec.sha1.as_deref()) {
            let sha1_ok = match archive.compute_sha1(&path) {
                Ok(actual) => actual == expected,
                Err(err) => {
                    vprintln!(verbose, 1, "{}: {err}", entry.name);
                    false
                }
            };
            if !sha1_ok {
                vprintln!(verbose, 2, "{}: {} sha1 mismatch", entry.name, path);
                entry.mark_file(Reason::BadHash, &spec.name, spec.sub_path.as_deref());
            }
        }
    }

    retire(sources, &mut stats);
    vprintln!(
        verbose,
        1,
        "{}: {}",
        entry.name,
        if entry.has_error() { "FAILED" } else { "ok" }
    );

    EntryOutcome {
        order,
        entry,
        location: Some(location),
        extraneous,
        repaired: Vec::new(),
        stats,
    }
}

/// Entries of a set's own archive that no file of the set, nor a merged
/// clone, accounts for.
fn unclaimed_entries(catalog: &Catalog, entry: &CatalogEntry, archive: &Archive) -> Vec<Extraneous> {
    let claimed: HashSet<String> = entry.files.iter().map(|f| f.archive_path(None)).collect();
    let clone_dirs: Vec<String> = catalog
        .clones_of(&entry.name)
        .into_iter()
        .map(|c| format!("{c}/"))
        .collect();
    archive
        .list_entries()
        .iter()
        .filter(|e| !claimed.contains(&e.name))
        .filter(|e| !clone_dirs.iter().any(|d| e.name.starts_with(d)))
        .map(|e| Extraneous {
            archive: archive.path().to_path_buf(),
            entry: Some(e.name.clone()),
        })
        .collect()
}

fn run_label(catalog: &Catalog, config: &Config) -> String {
    catalog
        .header
        .name
        .clone()
        .or_else(|| {
            config
                .dat
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "romset".to_string())
}

fn select_entries<'a>(
    catalog: &'a Catalog,
    filter: Option<&GlobSet>,
) -> Vec<(usize, &'a CatalogEntry)> {
    catalog
        .entries()
        .iter()
        .enumerate()
        .filter(|(_, e)| filter.is_none_or(|set| set.is_match(&e.name)))
        .collect()
}

/// Check every selected entry, polling for cancellation before each one.
/// Returns the outcomes in catalog order and whether the run was cancelled.
fn verify_entries(
    ctx: &RunContext<'_>,
    selected: &[(usize, &CatalogEntry)],
    sink: &mut dyn ProgressSink,
) -> anyhow::Result<(Vec<EntryOutcome>, bool)> {
    let total = selected.len();
    let jobs = ctx.config.job_count();
    let mut outcomes = Vec::with_capacity(total);

    if jobs <= 1 {
        for (position, (order, entry)) in selected.iter().enumerate() {
            if sink.must_cancel() {
                return Ok((outcomes, true));
            }
            let outcome = verify_entry(ctx, *order, entry);
            sink.progress(entry.label(), total, position + 1);
            outcomes.push(outcome);
        }
        return Ok((outcomes, false));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("starting verification workers")?;
    let stop = AtomicBool::new(sink.must_cancel());
    let (tx, rx) = mpsc::channel::<EntryOutcome>();

    thread::scope(|scope| {
        let stop = &stop;
        let pool = &pool;
        scope.spawn(move || {
            pool.install(|| {
                selected
                    .par_iter()
                    .for_each_with(tx, |tx, (order, entry)| {
                        if stop.load(Ordering::SeqCst) {
                            return;
                        }
                        let _ = tx.send(verify_entry(ctx, *order, entry));
                    });
            });
        });

        for outcome in rx.iter() {
            outcomes.push(outcome);
            let label = outcomes.last().map(|o| o.entry.name.clone()).unwrap_or_default();
            sink.progress(&label, total, outcomes.len());
            if sink.must_cancel() {
                stop.store(true, Ordering::SeqCst);
            }
        }
    });

    outcomes.sort_by_key(|o| o.order);
    let cancelled = stop.load(Ordering::SeqCst) && outcomes.len() < total;
    Ok((outcomes, cancelled))
}

fn fail(sink: &mut dyn ProgressSink, err: anyhow::Error) -> anyhow::Error {
    sink.error(&err);
    err
}

/// Load the DAT named by `config` and verify the romset folder against it.
pub fn run(config: &Config, sink: &mut dyn ProgressSink) -> anyhow::Result<VerifyReport> {
    if let Err(err) = config.validate() {
        return Err(fail(sink, err));
    }
    let catalog = match crate::dat::load_catalog(&config.dat) {
        Ok(catalog) => catalog,
        Err(err) => {
            let err = anyhow::Error::new(err)
                .context(format!("loading DAT {}", config.dat.display()));
            return Err(fail(sink, err));
        }
    };
    vprintln!(
        config.verbose,
        1,
        "Loaded {} sets from {}",
        catalog.len(),
        config.dat.display()
    );
    verify(&catalog, config, sink)
}

/// Verify the romset folder against an already loaded catalog. The catalog
/// is not modified; findings are carried by per-run copies of its entries.
pub fn verify(
    catalog: &Catalog,
    config: &Config,
    sink: &mut dyn ProgressSink,
) -> anyhow::Result<VerifyReport> {
    let label = run_label(catalog, config);
    sink.init(&label);

    let filter = crate::build_globset(&config.filter).map_err(|e| fail(sink, e))?;
    let index = FolderIndex::scan(&config.input).map_err(|e| fail(sink, e))?;
    let target = config.target_folder();
    let writes = config.writes_elsewhere() || config.rebuild_from.is_some() || config.convert.is_some();
    if writes {
        if let Err(source) = std::fs::create_dir_all(&target) {
            let err = EngineError::TargetSetup {
                path: target.clone(),
                source,
            };
            return Err(fail(sink, err.into()));
        }
    }
    let mut rebuild = match &config.rebuild_from {
        Some(root) => Some(
            crate::repair::RebuildSource::open(root)
                .map_err(|e| fail(sink, e))?
                .with_verbosity(config.verbose),
        ),
        None => None,
    };

    let ctx = RunContext {
        catalog,
        config,
        index,
        target,
    };

    let selected = select_entries(catalog, filter.as_ref());
    let (mut outcomes, cancelled) =
        verify_entries(&ctx, &selected, sink).map_err(|e| fail(sink, e))?;

    let mut conversions = Vec::new();
    if !cancelled {
        if let Some(rebuild) = rebuild.as_mut() {
            for outcome in outcomes.iter_mut().filter(|o| o.entry.has_error()) {
                crate::repair::repair_entry(&ctx, rebuild, outcome);
            }
        }
        if let Some(layout) = config.convert {
            conversions = crate::layout::convert(&ctx, &mut outcomes, layout);
        }
    }

    let mut extraneous: Vec<Extraneous> = Vec::new();
    if config.report_all {
        if filter.is_none() {
            extraneous.extend(
                ctx.index
                    .iter()
                    .filter(|(name, _)| !catalog.contains(name))
                    .map(|(_, path)| Extraneous {
                        archive: path.to_path_buf(),
                        entry: None,
                    }),
            );
        }
        for outcome in &outcomes {
            extraneous.extend(outcome.extraneous.iter().cloned());
        }
        extraneous.sort();
    }

    let mut stats = RunStats {
        entries_total: selected.len(),
        entries_processed: outcomes.len(),
        ..RunStats::default()
    };
    let mut processed = Vec::new();
    let mut failed = Vec::new();
    for outcome in outcomes {
        stats.absorb(&outcome.stats);
        let status = EntryStatus::from_entry(&outcome.entry, outcome.repaired);
        if status.passed {
            processed.push(status);
        } else {
            failed.push(status);
        }
    }

    let status = if cancelled {
        RunStatus::Cancelled
    } else {
        RunStatus::Done
    };
    let report = VerifyReport {
        generated_at: Utc::now(),
        status,
        fidelity: config.fidelity,
        romset: config.input.clone(),
        result_folder: ctx.target.clone(),
        processed,
        failed,
        extraneous,
        conversions,
        stats,
    };

    sink.set_processed(&report.processed);
    sink.set_errors(&report.failed);
    match report.status {
        RunStatus::Done => sink.done(&label, &report.result_folder),
        RunStatus::Cancelled => sink.cancelled(&label),
    }
    Ok(report)
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

    fn crc(data: &[u8]) -> String {
        crate::checksum::digest_bytes(data, false).crc32
    }

    #[test]
    fn folder_index_lists_zip_stems_only() {
        let dir = tempdir().unwrap();
        write_zip(&dir.path().join("a.zip"), &[("x", b"x")]);
        write_zip(&dir.path().join("B.ZIP"), &[("x", b"x")]);
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        std::fs::create_dir(dir.path().join("c.zip")).unwrap();

        let index = FolderIndex::scan(dir.path()).unwrap();
        let names: Vec<&str> = index.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["B", "a"]);
    }

    #[test]
    fn missing_folder_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(FolderIndex::scan(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn merged_clone_is_located_in_parent() {
        let dir = tempdir().unwrap();
        write_zip(
            &dir.path().join("parent.zip"),
            &[("p.bin", b"parent"), ("clone/c.bin", b"clone")],
        );
        let mut catalog = Catalog::default();
        catalog
            .insert(CatalogEntry::new("parent").with_file(FileSpec::new("p.bin", 6, crc(b"parent"))))
            .unwrap();
        catalog
            .insert(
                CatalogEntry::new("clone")
                    .with_parent("parent")
                    .with_file(FileSpec::new("c.bin", 5, crc(b"clone")))
                    .with_file(FileSpec::new("p.bin", 6, crc(b"parent"))),
            )
            .unwrap();
        let config = Config {
            input: dir.path().to_path_buf(),
            ..Config::default()
        };
        let ctx = RunContext {
            catalog: &catalog,
            config: &config,
            index: FolderIndex::scan(dir.path()).unwrap(),
            target: dir.path().to_path_buf(),
        };

        let outcome = verify_entry(&ctx, 1, catalog.get("clone").unwrap());
        assert!(!outcome.entry.has_error(), "{:?}", outcome.entry.findings());
        assert_eq!(outcome.prefix(), Some("clone"));
        assert!(matches!(outcome.location, Some(SetLocation::InParent { .. })));
    }

    #[test]
    fn select_entries_honours_globs() {
        let mut catalog = Catalog::default();
        for name in ["mslug", "mslug2", "kof98"] {
            catalog.insert(CatalogEntry::new(name)).unwrap();
        }
        let filter = crate::build_globset(&["mslug*".to_string()]).unwrap();
        let names: Vec<&str> = select_entries(&catalog, filter.as_ref())
            .into_iter()
            .map(|(_, e)| e.name.as_str())
            .collect();
        assert_eq!(names, vec!["mslug", "mslug2"]);
        assert_eq!(select_entries(&catalog, None).len(), 3);
    }
}
