//! Checksum and ETag helpers for model delivery.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::DeliveryError;

/// Streamed SHA-256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String, DeliveryError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Normalize a hub ETag: strip a weak-validator prefix and outer quotes,
/// lowercase the rest.
#[must_use]
pub fn normalize_etag(raw: &str) -> String {
    let s = raw.trim();
    let s = s.strip_prefix("W/").unwrap_or(s);
    let s = s.trim_matches('"');
    s.to_ascii_lowercase()
}

/// Whether a normalized ETag is itself a SHA-256 digest.
#[must_use]
pub fn is_sha256(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}
