//! Merged/split conversion of parent, clone and BIOS archives.
//!
//! Runs after verification and repair, one entry at a time. An entry is only
//! touched when it and the related archive were located in the folder.
//!
//! Parent and clone: `split` moves `<clone>/...` out of the parent archive,
//! `merged` folds the clone's exclusive files into it. BIOS: both layouts keep
//! BIOS-owned files out of a game's own archive. `merged` also lifts files the
//! BIOS declares but its archive lacks into the BIOS archive before dropping
//! them from the game.

use crate::archive::{Archive, ArchiveMode};
use crate::catalog::{CatalogEntry, FileSpec, FindingScope};
use crate::report::LayoutChange;
use crate::types::Layout;
use crate::verify::{EntryOutcome, RunContext, SetLocation, archive_file_name};

pub(crate) fn convert(ctx: &RunContext<'_>, outcomes: &mut [EntryOutcome], to: Layout) -> Vec<LayoutChange> {
    let mut changes = Vec::new();

    for outcome in outcomes.iter_mut() {
        if outcome.entry.is_bios
            || outcome
                .entry
                .findings()
                .iter()
                .any(|f| f.scope == FindingScope::Entry)
        {
            continue;
        }
        let name = outcome.entry.name.clone();
        let clone_step = convert_clone(ctx, outcome, to);
        changes.extend(logged(ctx, &name, to, clone_step));
        let bios_step = convert_bios_files(ctx, outcome, to);
        changes.extend(logged(ctx, &name, to, bios_step));
    }
    changes
}

fn logged(
    ctx: &RunContext<'_>,
    name: &str,
    to: Layout,
    step: anyhow::Result<Option<LayoutChange>>,
) -> Option<LayoutChange> {
    match step {
        Ok(Some(change)) => {
            vprintln!(
                ctx.config.verbose,
                1,
                "{name}: {} file(s) moved to {} layout",
                change.files_moved,
                change.to
            );
            Some(change)
        }
        Ok(None) => None,
        Err(err) => {
            if ctx.config.quiet == 0 {
                eprintln!("{name}: conversion to {to} failed: {err:#}");
            }
            None
        }
    }
}

fn convert_clone(
    ctx: &RunContext<'_>,
    outcome: &mut EntryOutcome,
    to: Layout,
) -> anyhow::Result<Option<LayoutChange>> {
    let Some(parent) = outcome.entry.parent_name.clone() else {
        return Ok(None);
    };
    if !ctx.catalog.contains(&parent) {
        return Ok(None);
    }
    let change = match (&outcome.location, to) {
        (Some(SetLocation::InParent { .. }), Layout::Split) => split_out(ctx, &outcome.entry.name, &parent)?,
        (Some(SetLocation::Own(_)), Layout::Merged) => merge_in(ctx, &outcome.entry, &parent)?,
        _ => None,
    };
    if let Some(change) = &change {
        outcome.location = Some(match to {
            Layout::Split => SetLocation::Own(change.archive.clone()),
            Layout::Merged => SetLocation::InParent {
                parent,
                archive: change.archive.clone(),
            },
        });
    }
    Ok(change)
}

/// Move `<clone>/...` out of the parent archive into `<clone>.zip`.
fn split_out(ctx: &RunContext<'_>, clone: &str, parent: &str) -> anyhow::Result<Option<LayoutChange>> {
    let parent_path = ctx.working_copy(&archive_file_name(parent))?;
    if !parent_path.exists() {
        return Ok(None);
    }
    let mut parent_archive = Archive::open(&parent_path, ArchiveMode::Update)?;
    let dir = format!("{clone}/");
    let names: Vec<String> = parent_archive
        .entries_under(clone)
        .iter()
        .map(|e| e.name.clone())
        .collect();
    if names.is_empty() {
        return Ok(None);
    }

    let clone_path = ctx.target.join(archive_file_name(clone));
    let mut clone_archive = Archive::open(&clone_path, ArchiveMode::Create)?;
    for name in &names {
        let bytes = parent_archive.read_entry(name)?;
        let inner = name.strip_prefix(&dir).unwrap_or(name);
        clone_archive.create_entry(inner, bytes)?;
        parent_archive.delete_entry(name)?;
    }
    // The clone archive must exist before its content leaves the parent.
    clone_archive.close()?;
    parent_archive.close()?;

    Ok(Some(LayoutChange {
        entry: clone.to_string(),
        to: Layout::Split,
        archive: clone_path,
        files_moved: names.len(),
    }))
}

/// True when `archive` holds `spec` at its root under the shared name.
fn held_at_root(archive: &Archive, spec: &FileSpec) -> bool {
    archive
        .find(&spec.shared_path())
        .is_some_and(|e| e.size == spec.size && e.crc32 == spec.crc32)
}

/// Move the clone's exclusive files into the parent archive under
/// `<clone>/`. Files the parent or BIOS already hold at their root are
/// dropped with the clone archive.
fn merge_in(ctx: &RunContext<'_>, clone: &CatalogEntry, parent: &str) -> anyhow::Result<Option<LayoutChange>> {
    let clone_file = archive_file_name(&clone.name);
    let parent_file = archive_file_name(parent);
    if !ctx.current_copy(&parent_file).exists() {
        return Ok(None);
    }

    let mut clone_archive = Archive::open(&ctx.current_copy(&clone_file), ArchiveMode::Read)?;
    let parent_archive = Archive::open(&ctx.current_copy(&parent_file), ArchiveMode::Read)?;
    let bios_archive = ctx
        .catalog
        .effective_bios(clone)
        .map(|bios| ctx.current_copy(&archive_file_name(bios)))
        .filter(|path| path.exists())
        .and_then(|path| Archive::open(&path, ArchiveMode::Read).ok());

    let shared_elsewhere = |name: &str| {
        clone
            .files
            .iter()
            .filter(|spec| spec.archive_path(None) == name)
            .any(|spec| {
                held_at_root(&parent_archive, spec)
                    || bios_archive.as_ref().is_some_and(|b| held_at_root(b, spec))
            })
    };
    let exclusive: Vec<String> = clone_archive
        .list_entries()
        .iter()
        .map(|e| e.name.clone())
        .filter(|name| !shared_elsewhere(name.as_str()))
        .collect();
    drop(parent_archive);
    // Nothing would remain to locate the clone by.
    if exclusive.is_empty() {
        return Ok(None);
    }

    let parent_path = ctx.working_copy(&parent_file)?;
    let mut parent_update = Archive::open(&parent_path, ArchiveMode::Update)?;
    for name in &exclusive {
        let bytes = clone_archive.read_entry(name)?;
        parent_update.create_entry(&format!("{}/{name}", clone.name), bytes)?;
    }
    parent_update.close()?;
    drop(clone_archive);

    let leftover = ctx.target.join(&clone_file);
    if leftover.exists() {
        std::fs::remove_file(&leftover)?;
    }

    Ok(Some(LayoutChange {
        entry: clone.name.clone(),
        to: Layout::Merged,
        archive: parent_path,
        files_moved: exclusive.len(),
    }))
}

fn declared_by(bios: Option<&CatalogEntry>, path: &str, spec: &FileSpec) -> bool {
    bios.is_some_and(|entry| {
        entry
            .files
            .iter()
            .any(|f| f.archive_path(None) == path && f.size == spec.size && f.crc32 == spec.crc32)
    })
}

/// Take BIOS-owned files out of a game's own archive.
fn convert_bios_files(
    ctx: &RunContext<'_>,
    outcome: &EntryOutcome,
    to: Layout,
) -> anyhow::Result<Option<LayoutChange>> {
    let entry = &outcome.entry;
    let Some(bios) = entry.bios.as_ref().map(|b| b.name.as_str()) else {
        return Ok(None);
    };
    if !matches!(outcome.location, Some(SetLocation::Own(_))) {
        return Ok(None);
    }
    let bios_file = archive_file_name(bios);
    let game_file = archive_file_name(&entry.name);
    let bios_source = ctx.current_copy(&bios_file);
    if !bios_source.exists() {
        return Ok(None);
    }
    // An unreadable BIOS was already reported by verification.
    let Ok(bios_archive) = Archive::open(&bios_source, ArchiveMode::Read) else {
        return Ok(None);
    };
    let mut game_archive = Archive::open(&ctx.current_copy(&game_file), ArchiveMode::Read)?;
    let bios_entry = ctx.catalog.get(bios);

    let mut already_held: Vec<String> = Vec::new();
    let mut to_lift: Vec<(String, String)> = Vec::new();
    for spec in entry.files.iter().filter(|f| !f.nodump) {
        let own = spec.archive_path(None);
        let matches_spec = game_archive
            .find(&own)
            .is_some_and(|e| e.size == spec.size && e.crc32 == spec.crc32);
        if !matches_spec || already_held.contains(&own) {
            continue;
        }
        let shared = spec.shared_path();
        match bios_archive.find(&shared) {
            Some(_) if held_at_root(&bios_archive, spec) => already_held.push(own),
            Some(_) => {}
            None if to == Layout::Merged && declared_by(bios_entry, &shared, spec) => {
                to_lift.push((own, shared))
            }
            None => {}
        }
    }
    drop(bios_archive);

    let moved = already_held.len() + to_lift.len();
    if moved == 0 {
        return Ok(None);
    }
    if moved >= game_archive.list_entries().len() {
        vprintln!(
            ctx.config.verbose,
            2,
            "{}: BIOS files kept, the archive holds nothing else",
            entry.name
        );
        return Ok(None);
    }

    if !to_lift.is_empty() {
        let bios_path = ctx.working_copy(&bios_file)?;
        let mut bios_update = Archive::open(&bios_path, ArchiveMode::Update)?;
        for (own, shared) in &to_lift {
            let bytes = game_archive.read_entry(own)?;
            bios_update.create_entry(shared, bytes)?;
        }
        bios_update.close()?;
    }
    drop(game_archive);

    let game_path = ctx.working_copy(&game_file)?;
    let mut game_update = Archive::open(&game_path, ArchiveMode::Update)?;
    for own in already_held.iter().chain(to_lift.iter().map(|(own, _)| own)) {
        game_update.delete_entry(own)?;
    }
    game_update.close()?;

    let archive = match to {
        Layout::Merged => ctx.target.join(&bios_file),
        Layout::Split => game_path,
    };
    Ok(Some(LayoutChange {
        entry: entry.name.clone(),
        to,
        archive,
        files_moved: moved,
    }))
}
