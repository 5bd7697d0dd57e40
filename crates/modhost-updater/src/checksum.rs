//! SHA-256 artifact verification.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, error};

use crate::error::UpdateError;

/// Buffer size for reading files during hashing.
const HASH_BUFFER_SIZE: usize = 8192;

/// Compute the SHA-256 hash of a file, reading it in chunks.
pub fn compute_hash(path: &Path) -> Result<[u8; 32], UpdateError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().into())
}

/// Hex-encoded SHA-256 of a file.
pub fn compute_hex(path: &Path) -> Result<String, UpdateError> {
    Ok(hex::encode(compute_hash(path)?))
}

/// Compare a file's digest with an expected hex digest in constant time.
///
/// Returns `Ok(false)` on mismatch and for an expected value that is not a
/// 32-byte hex string.
pub fn verify_file(path: &Path, expected_hex: &str) -> Result<bool, UpdateError> {
    let Ok(expected) = hex::decode(expected_hex.trim()) else {
        error!(expected = expected_hex, "Published checksum is not hex");
        return Ok(false);
    };
    if expected.len() != 32 {
        error!(expected = expected_hex, "Published checksum has the wrong length");
        return Ok(false);
    }

    let actual = compute_hash(path)?;
    let matches = actual[..].ct_eq(expected.as_slice()).unwrap_u8() == 1;
    if matches {
        debug!(hash = %hex::encode(actual), path = %path.display(), "Artifact hash verified");
    } else {
        error!(
            expected = %expected_hex.trim(),
            actual = %hex::encode(actual),
            path = %path.display(),
            "Artifact hash mismatch"
        );
    }
    Ok(matches)
}

/// Pull the digest for `asset_name` out of a checksum file.
///
/// Accepts `sha256sum` output (`<hash>  <name>`, optionally `*<name>`) and
/// a bare single-hash file.
pub fn parse_checksum_file(content: &str, asset_name: &str) -> Option<String> {
    let mut bare = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(hash) = parts.next() else {
            continue;
        };
        match parts.next() {
            Some(name) => {
                let name = name.trim_start_matches('*').trim_start_matches("./");
                if name == asset_name {
                    return Some(hash.to_ascii_lowercase());
                }
            }
            None if bare.is_none() => bare = Some(hash.to_ascii_lowercase()),
            None => {}
        }
    }
    bare
}
