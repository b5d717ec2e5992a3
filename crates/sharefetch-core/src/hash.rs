//! MD5 helpers used for ETag validation and parameterized file names.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

/// Lowercase hex MD5 of an in-memory value.
#[must_use]
pub fn md5_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Md5::digest(data.as_ref()))
}

/// Compute the lowercase hex MD5 of a file, streaming it in 1MB chunks.
pub fn md5_file_blocking(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 1024 * 1024]; // 1MB chunks

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute a file's MD5 on the blocking pool.
pub async fn md5_file(path: PathBuf) -> io::Result<String> {
    tokio::task::spawn_blocking(move || md5_file_blocking(&path))
        .await
        .map_err(io::Error::other)?
}

/// Whether `value` looks like an MD5 digest (32 hex characters).
#[must_use]
pub fn is_md5_hex(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit())
}
