//! SHA-256 hashing of repository files.
//!
//! The same streaming routine produces both per-file hashes and "combined"
//! hashes: a combined hash is the single SHA-256 of the concatenation of
//! several files in order (metadata first, then a rootfs), fed through one
//! hash state rather than hashing hashes.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

/// Hash the given files in order with a single SHA-256 state and return the
/// lowercase hex digest. An empty path list yields an empty string.
pub fn file_hash<P: AsRef<Path>>(paths: &[P]) -> Result<String> {
    if paths.is_empty() {
        return Ok(String::new());
    }

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];

    for path in paths {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);

        loop {
            let n = reader
                .read(&mut buf)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if n == 0 {
                break;
            }

            hasher.update(&buf[..n]);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Recompute the file's SHA-256 and compare it against the expected
/// lowercase hex digest.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = file_hash(&[path])?;
    if actual != expected {
        bail!(
            "Checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        );
    }

    Ok(())
}
