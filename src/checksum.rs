use std::io::Read;

use crc32fast::Hasher as Crc32;
use sha1_smol::Sha1;

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Checksums gathered from one pass over a content stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDigest {
    pub crc32: String,
    pub sha1: Option<String>,
    pub size: u64,
}

/// Hash a stream in fixed chunks. SHA1 is only computed when requested.
pub fn digest_stream<R: Read>(mut reader: R, with_sha1: bool) -> std::io::Result<StreamDigest> {
    let mut crc32h = Crc32::new();
    let mut sha1h = with_sha1.then(Sha1::new);

    let mut processed: u64 = 0;
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        processed = processed.saturating_add(n as u64);
        let slice = &buf[..n];
        crc32h.update(slice);
        if let Some(h) = sha1h.as_mut() {
            h.update(slice);
        }
    }

    Ok(StreamDigest {
        crc32: crc32_hex(crc32h.finalize()),
        sha1: sha1h.map(|h| h.digest().to_string()),
        size: processed,
    })
}

pub fn digest_bytes(buf: &[u8], with_sha1: bool) -> StreamDigest {
    let mut crc32h = Crc32::new();
    crc32h.update(buf);
    StreamDigest {
        crc32: crc32_hex(crc32h.finalize()),
        sha1: with_sha1.then(|| Sha1::from(buf).digest().to_string()),
        size: buf.len() as u64,
    }
}

pub fn crc32_hex(value: u32) -> String {
    format!("{value:08x}")
}

/// Normalise a textual CRC32 to 8 lower-case hex digits. Returns `None` when
/// the input is not hex or is wider than 32 bits.
pub fn normalize_crc32(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if trimmed.is_empty() || trimmed.len() > 8 {
        return None;
    }
    u32::from_str_radix(trimmed, 16).ok().map(crc32_hex)
}

pub fn normalize_sha1(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.len() != 40 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}
