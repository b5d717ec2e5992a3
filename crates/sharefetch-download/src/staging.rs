//! Staging and final file helpers.

use std::io::{self, SeekFrom};
use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncSeekExt;
use tracing::{debug, warn};

/// Length of an existing staging file, 0 when absent.
pub(crate) async fn existing_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map_or(0, |m| m.len())
}

/// Whether `path` is an existing regular file.
pub(crate) async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

/// Open the staging file for writing at `offset`.
///
/// Anything past `offset` was never published and is cut off.
pub(crate) async fn open_at(path: &Path, offset: u64) -> io::Result<File> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

/// Open the staging file for reading at `offset`.
pub(crate) async fn open_reader(path: &Path, offset: u64) -> io::Result<File> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

/// Copy the staging file into place at `dest`.
///
/// The copy goes to a temp file beside `dest` that is renamed over it, so
/// readers never see a partial final file. The staging file stays in place
/// for followers that are still reading it.
pub(crate) async fn commit(staging: &Path, dest: &Path) -> io::Result<()> {
    let staging = staging.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || commit_blocking(&staging, &dest))
        .await
        .map_err(io::Error::other)?
}

fn commit_blocking(staging: &Path, dest: &Path) -> io::Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".commit")
        .tempfile_in(dir)?;
    std::fs::copy(staging, tmp.path())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    debug!(dest = %dest.display(), "Committed file");
    Ok(())
}

/// Remove a file, ignoring one that is already gone.
pub(crate) async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed staging file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staging file"),
    }
}
