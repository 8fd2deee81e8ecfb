//! Filesystem helpers for scratch and output directories.

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{MediaError, MediaResult};

/// Recreate `dir` empty so a re-executed encode never sees stale outputs.
pub async fn prepare_output_dir(dir: impl AsRef<Path>) -> MediaResult<()> {
    let dir = dir.as_ref();
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(MediaError::from(e)),
    }
    fs::create_dir_all(dir).await?;
    Ok(())
}

/// Regular files directly inside `dir`, sorted by name.
pub async fn list_files(dir: impl AsRef<Path>) -> MediaResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir.as_ref()).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Size of a file in bytes.
pub async fn file_size(path: impl AsRef<Path>) -> MediaResult<u64> {
    let path = path.as_ref();
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(MediaError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Move `src` over `dst`, falling back to copy+delete across filesystems.
pub async fn replace_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MediaResult<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device_error(&e) => {
            tracing::debug!(
                src = %src.display(),
                dst = %dst.display(),
                "cross-device rename, copying"
            );
            fs::copy(src, dst).await?;
            if let Err(e) = fs::remove_file(src).await {
                tracing::warn!(src = %src.display(), error = %e, "failed to remove moved file");
            }
            Ok(())
        }
        Err(e) => Err(MediaError::from(e)),
    }
}

/// Remove a directory tree, treating a missing directory as success.
pub async fn remove_dir_if_exists(dir: impl AsRef<Path>) -> MediaResult<()> {
    match fs::remove_dir_all(dir.as_ref()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// EXDEV is error code 18 on Linux/macOS
fn is_cross_device_error(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(18)
}
