//! Streaming SHA-256 of executable contents.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{ProcInfoError, Result};

/// Buffer size for streaming file reads (64 KiB).
const BUF_SIZE: usize = 64 * 1024;

/// Compute the lowercase hex SHA-256 of a file without loading it into memory.
///
/// Fails with `ProcInfoError::Io` when the file cannot be opened or read,
/// which callers treat as "hash unavailable".
pub fn sha256_file(path: &Path) -> Result<String> {
    let path_str = path.display().to_string();
    let mut file = File::open(path).map_err(|e| ProcInfoError::io(&path_str, e))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| ProcInfoError::io(&path_str, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
