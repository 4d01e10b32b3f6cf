//! In-memory catalog of expected sets.
//!
//! A [`Catalog`] is built once per run by [`crate::dat`] and is read-only
//! afterwards, except for findings recorded on entries by the verification
//! engine. Parent, clone and BIOS relationships are plain names resolved by
//! lookup; a dangling reference is a normal condition.

use std::collections::HashMap;

use serde::Serialize;

use crate::types::Reason;

/// One expected file inside a set.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileSpec {
    pub name: String,
    /// Directory inside the set; `None` is the set root.
    pub sub_path: Option<String>,
    pub size: u64,
    /// Lower-case, zero-padded 8 digit hex. Empty for `nodump` files.
    pub crc32: String,
    pub sha1: Option<String>,
    /// Name of the same file in the parent or BIOS set.
    pub merge: Option<String>,
    pub nodump: bool,
    error: Option<Reason>,
}

impl FileSpec {
    pub fn new(name: impl Into<String>, size: u64, crc32: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sub_path: None,
            size,
            crc32: crc32.into(),
            sha1: None,
            merge: None,
            nodump: false,
            error: None,
        }
    }

    pub fn with_sub_path(mut self, sub_path: impl Into<String>) -> Self {
        let sub_path = sub_path.into();
        let trimmed = sub_path.trim_matches('/');
        self.sub_path = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    pub fn with_sha1(mut self, sha1: impl Into<String>) -> Self {
        self.sha1 = Some(sha1.into());
        self
    }

    pub fn with_merge(mut self, merge: impl Into<String>) -> Self {
        self.merge = Some(merge.into());
        self
    }

    /// Placeholder describing a required BIOS set; it carries no checksum.
    pub fn bios_requirement(name: impl Into<String>) -> Self {
        Self::new(name, 0, String::new())
    }

    /// Path of this file inside an archive, optionally below `prefix`.
    pub fn archive_path(&self, prefix: Option<&str>) -> String {
        join_archive_path(prefix, self.sub_path.as_deref(), &self.name)
    }

    /// Path used when the file is borrowed from a parent or BIOS archive.
    pub fn shared_path(&self) -> String {
        let name = self.merge.as_deref().unwrap_or(&self.name);
        join_archive_path(None, self.sub_path.as_deref(), name)
    }

    pub fn matches_key(&self, name: &str, sub_path: Option<&str>) -> bool {
        self.name == name && self.sub_path.as_deref() == sub_path
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<Reason> {
        self.error
    }

    // The first reason sticks.
    fn mark(&mut self, reason: Reason) {
        if self.error.is_none() {
            self.error = Some(reason);
        }
    }
}

pub(crate) fn join_archive_path(prefix: Option<&str>, sub_path: Option<&str>, name: &str) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(3);
    parts.extend(prefix.filter(|p| !p.is_empty()));
    parts.extend(sub_path.filter(|p| !p.is_empty()));
    parts.push(name);
    parts.join("/")
}

/// Ordered file collection keyed by `(name, sub_path)`. Names alone are not
/// unique.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FileSet {
    files: Vec<FileSpec>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, spec: FileSpec) {
        self.files.push(spec);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileSpec> {
        self.files.iter()
    }

    pub fn get(&self, name: &str, sub_path: Option<&str>) -> Option<&FileSpec> {
        self.files.iter().find(|f| f.matches_key(name, sub_path))
    }

    /// First file with this name, preferring the one at the set root.
    pub fn get_by_name(&self, name: &str) -> Option<&FileSpec> {
        self.position_by_name(name).map(|idx| &self.files[idx])
    }

    /// Remove the file matching both name and sub-path.
    pub fn remove(&mut self, name: &str, sub_path: Option<&str>) -> Option<FileSpec> {
        let idx = self.files.iter().position(|f| f.matches_key(name, sub_path))?;
        Some(self.files.remove(idx))
    }

    pub fn has_error(&self) -> bool {
        self.files.iter().any(FileSpec::has_error)
    }

    fn position_by_name(&self, name: &str) -> Option<usize> {
        self.files
            .iter()
            .position(|f| f.name == name && f.sub_path.is_none())
            .or_else(|| self.files.iter().position(|f| f.name == name))
    }

    fn get_mut(&mut self, name: &str, sub_path: Option<&str>) -> Option<&mut FileSpec> {
        self.files.iter_mut().find(|f| f.matches_key(name, sub_path))
    }
}

impl<'a> IntoIterator for &'a FileSet {
    type Item = &'a FileSpec;
    type IntoIter = std::slice::Iter<'a, FileSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.iter()
    }
}

impl FromIterator<FileSpec> for FileSet {
    fn from_iter<I: IntoIterator<Item = FileSpec>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

/// What a finding is attached to. A `None` target covers the whole entry, the
/// BIOS name covers the BIOS requirement, anything else names a file.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FindingScope {
    #[serde(rename = "entry")]
    Entry,
    #[serde(rename = "bios")]
    Bios,
    #[serde(rename = "file")]
    File,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Finding {
    pub reason: Reason,
    pub scope: FindingScope,
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// One expected game or machine.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub description: Option<String>,
    pub manufacturer: Option<String>,
    pub year: Option<String>,
    pub category: Option<String>,
    pub source_file: Option<String>,
    pub parent_name: Option<String>,
    pub rom_of: Option<String>,
    pub bios_requirement: Option<String>,
    pub is_bios: bool,
    pub is_device: bool,
    pub runnable: bool,
    pub files: FileSet,
    pub bios: Option<FileSpec>,
    findings: Vec<Finding>,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            manufacturer: None,
            year: None,
            category: None,
            source_file: None,
            parent_name: None,
            rom_of: None,
            bios_requirement: None,
            is_bios: false,
            is_device: false,
            runnable: true,
            files: FileSet::new(),
            bios: None,
            findings: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_name = Some(parent.into());
        self
    }

    pub fn with_bios(mut self, bios: impl Into<String>) -> Self {
        let bios = bios.into();
        self.bios = Some(FileSpec::bios_requirement(bios.clone()));
        self.bios_requirement = Some(bios);
        self
    }

    pub fn with_file(mut self, spec: FileSpec) -> Self {
        self.files.push(spec);
        self
    }

    /// Label shown in progress output.
    pub fn label(&self) -> &str {
        &self.name
    }

    pub fn has_error(&self) -> bool {
        !self.findings.is_empty()
            || self.bios.as_ref().is_some_and(FileSpec::has_error)
            || self.files.has_error()
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Record a finding.
    ///
    /// `None` flags the entry as a whole. A target equal to the BIOS name
    /// flags the BIOS requirement; any other target must name a known file,
    /// which is flagged. The entry itself is flagged in every case.
    ///
    /// # Panics
    ///
    /// Panics when `target` names neither the BIOS nor a known file.
    pub fn mark(&mut self, reason: Reason, target: Option<&str>) {
        let Some(target) = target else {
            self.push_finding(reason, FindingScope::Entry, None, None);
            return;
        };
        if let Some(bios) = self.bios.as_mut().filter(|b| b.name == target) {
            bios.mark(reason);
            self.push_finding(reason, FindingScope::Bios, Some(target), None);
            return;
        }
        let Some(idx) = self.files.position_by_name(target) else {
            panic!("{target} is neither the BIOS nor a file of {}", self.name);
        };
        let sub_path = self.files.files[idx].sub_path.clone();
        self.files.files[idx].mark(reason);
        self.push_finding(reason, FindingScope::File, Some(target), sub_path.as_deref());
    }

    /// Record a finding against the file keyed by `(name, sub_path)`.
    ///
    /// # Panics
    ///
    /// Panics when no such file exists.
    pub fn mark_file(&mut self, reason: Reason, name: &str, sub_path: Option<&str>) {
        let Some(spec) = self.files.get_mut(name, sub_path) else {
            panic!("{name} is not a file of {}", self.name);
        };
        spec.mark(reason);
        self.push_finding(reason, FindingScope::File, Some(name), sub_path);
    }

    /// Clear a file finding after its content was rebuilt from another source.
    pub(crate) fn resolve_file(&mut self, name: &str, sub_path: Option<&str>) {
        if let Some(spec) = self.files.get_mut(name, sub_path) {
            spec.error = None;
        }
        self.findings.retain(|f| {
            !(f.scope == FindingScope::File
                && f.target.as_deref() == Some(name)
                && f.sub_path.as_deref() == sub_path)
        });
    }

    /// Clear a whole-entry finding after the set was rebuilt.
    pub(crate) fn resolve_entry(&mut self) {
        self.findings.retain(|f| f.scope != FindingScope::Entry);
    }

    fn push_finding(
        &mut self,
        reason: Reason,
        scope: FindingScope,
        target: Option<&str>,
        sub_path: Option<&str>,
    ) {
        let finding = Finding {
            reason,
            scope,
            target: target.map(str::to_string),
            sub_path: sub_path.map(str::to_string),
        };
        if !self.findings.contains(&finding) {
            self.findings.push(finding);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DatHeader {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
    pub date: Option<String>,
    pub homepage: Option<String>,
}

/// Entries keyed by name, in document order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub header: DatHeader,
    entries: Vec<CatalogEntry>,
    by_name: HashMap<String, usize>,
}

impl Catalog {
    pub fn new(header: DatHeader) -> Self {
        Self {
            header,
            ..Self::default()
        }
    }

    /// Insert an entry, handing it back if its name is already taken.
    pub fn insert(&mut self, entry: CatalogEntry) -> Result<(), CatalogEntry> {
        if self.by_name.contains_key(&entry.name) {
            return Err(entry);
        }
        self.by_name.insert(entry.name.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.by_name.get(name).map(|&idx| &self.entries[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn parent_of(&self, entry: &CatalogEntry) -> Option<&CatalogEntry> {
        entry.parent_name.as_deref().and_then(|p| self.get(p))
    }

    /// BIOS set used for file fallback: the entry's own requirement, else its
    /// parent's.
    pub fn effective_bios<'a>(&'a self, entry: &'a CatalogEntry) -> Option<&'a str> {
        entry.bios_requirement.as_deref().or_else(|| {
            self.parent_of(entry)
                .and_then(|p| p.bios_requirement.as_deref())
        })
    }

    /// Names of the entries that declare `parent` as their parent.
    pub fn clones_of(&self, parent: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.parent_name.as_deref() == Some(parent))
            .map(|e| e.name.as_str())
            .collect()
    }
}
