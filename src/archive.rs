//! Zip container access.
//!
//! Listing reads the central directory only: names, sizes and stored CRC32s
//! come for free. Content is decompressed only through [`Archive::open_entry`]
//! and the helpers built on it, and every such open is counted.
//!
//! Writes are staged in memory and applied by [`Archive::close`], which
//! rewrites the container next to the original and renames it into place.
//! Dropping an archive without closing it releases the file handle and
//! discards staged writes.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::checksum::{StreamDigest, digest_bytes, digest_stream};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    Read,
    /// Start an empty container, replacing any file at the path on close.
    Create,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Stored(usize),
    Added(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    /// Lower-case 8 digit hex, as recorded in the container.
    pub crc32: String,
    origin: Origin,
}

pub struct Archive {
    path: PathBuf,
    mode: ArchiveMode,
    reader: Option<ZipArchive<File>>,
    entries: Vec<ArchiveEntry>,
    added: Vec<Vec<u8>>,
    dirty: bool,
    streams_opened: usize,
    bytes_read: u64,
}

impl Archive {
    pub fn open(path: &Path, mode: ArchiveMode) -> Result<Self> {
        let mut archive = Archive {
            path: path.to_path_buf(),
            mode,
            reader: None,
            entries: Vec::new(),
            added: Vec::new(),
            dirty: mode == ArchiveMode::Create,
            streams_opened: 0,
            bytes_read: 0,
        };
        if mode == ArchiveMode::Create {
            return Ok(archive);
        }

        let file = File::open(path).map_err(|e| EngineError::archive(path, e))?;
        let mut zip = ZipArchive::new(file).map_err(|e| EngineError::archive(path, e))?;
        for i in 0..zip.len() {
            let entry = zip
                .by_index_raw(i)
                .map_err(|e| EngineError::archive(path, e))?;
            if entry.is_dir() {
                continue;
            }
            archive.entries.push(ArchiveEntry {
                name: entry.name().to_string(),
                size: entry.size(),
                crc32: crate::checksum::crc32_hex(entry.crc32()),
                origin: Origin::Stored(i),
            });
        }
        archive.reader = Some(zip);
        Ok(archive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list_entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Entries stored below `prefix/`.
    pub fn entries_under(&self, prefix: &str) -> Vec<&ArchiveEntry> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        self.entries
            .iter()
            .filter(|e| e.name.starts_with(&dir))
            .collect()
    }

    /// Number of decompressed content streams opened so far.
    pub fn streams_opened(&self) -> usize {
        self.streams_opened
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn open_entry(&mut self, name: &str) -> Result<Box<dyn Read + '_>> {
        let origin = self
            .find(name)
            .map(|e| e.origin)
            .ok_or_else(|| EngineError::archive(&self.path, format!("no entry named {name}")))?;
        self.streams_opened += 1;
        match origin {
            Origin::Added(idx) => Ok(Box::new(Cursor::new(self.added[idx].as_slice()))),
            Origin::Stored(idx) => {
                let path = &self.path;
                let reader = self
                    .reader
                    .as_mut()
                    .ok_or_else(|| EngineError::archive(path, "archive has no reader"))?;
                let file = reader
                    .by_index(idx)
                    .map_err(|e| EngineError::archive(path, e))?;
                Ok(Box::new(file))
            }
        }
    }

    /// Hash the full content of an entry. Never cached.
    pub fn digest_entry(&mut self, name: &str, with_sha1: bool) -> Result<StreamDigest> {
        let path = self.path.clone();
        let stream = self.open_entry(name)?;
        let digest = digest_stream(stream, with_sha1).map_err(|e| EngineError::archive(&path, e))?;
        self.bytes_read = self.bytes_read.saturating_add(digest.size);
        Ok(digest)
    }

    pub fn compute_sha1(&mut self, name: &str) -> Result<String> {
        let digest = self.digest_entry(name, true)?;
        Ok(digest.sha1.unwrap_or_default())
    }

    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let path = self.path.clone();
        let mut stream = self.open_entry(name)?;
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .map_err(|e| EngineError::archive(&path, e))?;
        drop(stream);
        self.bytes_read = self.bytes_read.saturating_add(buf.len() as u64);
        Ok(buf)
    }

    /// Stage a new entry, replacing any entry with the same name.
    pub fn create_entry(&mut self, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.ensure_writable()?;
        self.entries.retain(|e| e.name != name);
        let digest = digest_bytes(&bytes, false);
        self.added.push(bytes);
        self.entries.push(ArchiveEntry {
            name: name.to_string(),
            size: digest.size,
            crc32: digest.crc32,
            origin: Origin::Added(self.added.len() - 1),
        });
        self.dirty = true;
        Ok(())
    }

    pub fn delete_entry(&mut self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        if self.entries.len() == before {
            return Err(EngineError::archive(
                &self.path,
                format!("no entry named {name}"),
            ));
        }
        self.dirty = true;
        Ok(())
    }

    /// Apply staged writes. An archive left without entries is removed.
    pub fn close(self) -> Result<()> {
        let Archive {
            path,
            mode,
            mut reader,
            entries,
            added,
            dirty,
            ..
        } = self;
        if mode == ArchiveMode::Read || !dirty {
            return Ok(());
        }

        if entries.is_empty() {
            drop(reader);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| EngineError::archive(&path, e))?;
            }
            return Ok(());
        }

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| EngineError::archive(&path, e))?;
        {
            let mut writer = ZipWriter::new(tmp.as_file_mut());
            for entry in &entries {
                match entry.origin {
                    Origin::Stored(idx) => {
                        let source = reader
                            .as_mut()
                            .ok_or_else(|| EngineError::archive(&path, "archive has no reader"))?;
                        let file = source
                            .by_index_raw(idx)
                            .map_err(|e| EngineError::archive(&path, e))?;
                        writer
                            .raw_copy_file(file)
                            .map_err(|e| EngineError::archive(&path, e))?;
                    }
                    Origin::Added(idx) => {
                        let options = SimpleFileOptions::default()
                            .compression_method(CompressionMethod::Deflated);
                        writer
                            .start_file(entry.name.as_str(), options)
                            .map_err(|e| EngineError::archive(&path, e))?;
                        writer
                            .write_all(&added[idx])
                            .map_err(|e| EngineError::archive(&path, e))?;
                    }
                }
            }
            writer.finish().map_err(|e| EngineError::archive(&path, e))?;
        }
        drop(reader);
        tmp.persist(&path)
            .map_err(|e| EngineError::archive(&path, e.error))?;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode == ArchiveMode::Read {
            return Err(EngineError::archive(&self.path, "archive was opened read-only"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let mut zipw = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in files {
            zipw.start_file(*name, SimpleFileOptions::default()).unwrap();
            zipw.write_all(data).unwrap();
        }
        zipw.finish().unwrap();
    }

    #[test]
    fn listing_does_not_open_streams() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.zip");
        write_zip(&path, &[("a.bin", b"abc"), ("sub/b.bin", b"hello")]);

        let archive = Archive::open(&path, ArchiveMode::Read).unwrap();
        let names: Vec<&str> = archive.list_entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.bin", "sub/b.bin"]);
        assert_eq!(archive.find("a.bin").unwrap().crc32, "352441c2");
        assert_eq!(archive.find("a.bin").unwrap().size, 3);
        assert_eq!(archive.entries_under("sub").len(), 1);
        assert_eq!(archive.streams_opened(), 0);
    }

    #[test]
    fn sha1_reads_the_stream_every_time() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.zip");
        write_zip(&path, &[("a.bin", b"abc")]);

        let mut archive = Archive::open(&path, ArchiveMode::Read).unwrap();
        let first = archive.compute_sha1("a.bin").unwrap();
        let second = archive.compute_sha1("a.bin").unwrap();
        assert_eq!(first, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(first, second);
        assert_eq!(archive.streams_opened(), 2);
        assert_eq!(archive.bytes_read(), 6);
    }

    #[test]
    fn read_only_archives_refuse_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.zip");
        write_zip(&path, &[("a.bin", b"abc")]);

        let mut archive = Archive::open(&path, ArchiveMode::Read).unwrap();
        assert!(archive.create_entry("b.bin", b"x".to_vec()).is_err());
        assert!(archive.delete_entry("a.bin").is_err());
    }

    #[test]
    fn update_applies_adds_and_deletes_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.zip");
        write_zip(&path, &[("a.bin", b"abc"), ("b.bin", b"bbb")]);

        let mut archive = Archive::open(&path, ArchiveMode::Update).unwrap();
        archive.delete_entry("b.bin").unwrap();
        archive.create_entry("c/d.bin", b"new".to_vec()).unwrap();
        archive.close().unwrap();

        let mut reopened = Archive::open(&path, ArchiveMode::Read).unwrap();
        let names: Vec<&str> = reopened.list_entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.bin", "c/d.bin"]);
        assert_eq!(reopened.read_entry("a.bin").unwrap(), b"abc");
        assert_eq!(reopened.read_entry("c/d.bin").unwrap(), b"new");
    }

    #[test]
    fn dropping_without_close_discards_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.zip");
        write_zip(&path, &[("a.bin", b"abc")]);

        {
            let mut archive = Archive::open(&path, ArchiveMode::Update).unwrap();
            archive.delete_entry("a.bin").unwrap();
        }
        let archive = Archive::open(&path, ArchiveMode::Read).unwrap();
        assert_eq!(archive.list_entries().len(), 1);
    }

    #[test]
    fn emptied_archive_is_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.zip");
        write_zip(&path, &[("a.bin", b"abc")]);

        let mut archive = Archive::open(&path, ArchiveMode::Update).unwrap();
        archive.delete_entry("a.bin").unwrap();
        archive.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn create_writes_a_fresh_container() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new.zip");
        let mut archive = Archive::open(&path, ArchiveMode::Create).unwrap();
        archive.create_entry("x.bin", b"abc".to_vec()).unwrap();
        assert_eq!(archive.find("x.bin").unwrap().crc32, "352441c2");
        archive.close().unwrap();

        let archive = Archive::open(&path, ArchiveMode::Read).unwrap();
        assert_eq!(archive.find("x.bin").unwrap().crc32, "352441c2");
    }

    #[test]
    fn missing_archive_is_an_access_error() {
        let dir = tempdir().unwrap();
        let err = Archive::open(&dir.path().join("nope.zip"), ArchiveMode::Read)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::ArchiveAccess { .. }));
    }
}
