//! File-system-related stuff: copying trees, measuring submissions and
//! managing scratch directories.

use std::{
    io,
    path::{Path, PathBuf},
};

use futures::{future::BoxFuture, FutureExt, TryStreamExt};
use path_absolutize::Absolutize;
use tempfile::TempDir;
use tokio_stream::wrappers::ReadDirStream;

/// List the entries of `dir`, sorted by file name so that every walk over a
/// directory is deterministic.
pub async fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let read_dir = tokio::fs::read_dir(dir).await?;
    let mut entries: Vec<PathBuf> = ReadDirStream::new(read_dir)
        .map_ok(|entry| entry.path())
        .try_collect()
        .await?;
    entries.sort();
    Ok(entries)
}

/// Join a `relative` path onto a `base` path and canonicalize the result.
/// Absolute `relative` paths are kept as they are.
pub fn canonical_join(base: &Path, relative: &Path) -> io::Result<PathBuf> {
    Ok(base.join(relative).absolutize()?.into_owned())
}

/// `path` as an absolute path, relative to the current directory.
pub fn absolute(path: &Path) -> io::Result<PathBuf> {
    Ok(path.absolutize()?.into_owned())
}

/// Every regular file under `root`, recursively, in name order.
pub fn list_files(root: &Path) -> BoxFuture<'_, io::Result<Vec<PathBuf>>> {
    async move {
        let mut files = vec![];
        for entry in sorted_entries(root).await? {
            let meta = tokio::fs::metadata(&entry).await?;
            if meta.is_dir() {
                files.extend(list_files(&entry).await?);
            } else if meta.is_file() {
                files.push(entry);
            }
        }
        Ok(files)
    }
    .boxed()
}

/// Copy `from` to `to`. Directories are copied recursively; missing parents
/// of `to` are created.
///
/// Only `from` itself may be a symbolic link. Links found inside a copied
/// directory are skipped, never followed.
pub fn copy_path<'a>(from: &'a Path, to: &'a Path) -> BoxFuture<'a, io::Result<()>> {
    async move {
        let meta = tokio::fs::metadata(from).await?;
        if meta.is_dir() {
            copy_dir(from, to).await
        } else {
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(from, to).await?;
            Ok(())
        }
    }
    .boxed()
}

fn copy_dir<'a>(from: &'a Path, to: &'a Path) -> BoxFuture<'a, io::Result<()>> {
    async move {
        tokio::fs::create_dir_all(to).await?;
        for entry in sorted_entries(from).await? {
            let name = entry.file_name().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "directory entry without a name")
            })?;
            let meta = tokio::fs::symlink_metadata(&entry).await?;
            if meta.file_type().is_symlink() {
                tracing::warn!(path = %entry.display(), "Skipping symbolic link");
            } else if meta.is_dir() {
                copy_dir(&entry, &to.join(name)).await?;
            } else if meta.is_file() {
                tokio::fs::copy(&entry, to.join(name)).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

/// Remove a file or a directory tree. Missing paths are not an error.
pub async fn remove_path(path: &Path) -> io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Number of regular files and their total size under a directory, plus
/// every symbolic link found. Links are listed, not followed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirStats {
    pub files: u64,
    pub bytes: u64,
    pub symlinks: Vec<PathBuf>,
}

pub fn dir_stats(path: &Path) -> BoxFuture<'_, io::Result<DirStats>> {
    async move {
        let mut stats = DirStats::default();
        for entry in sorted_entries(path).await? {
            let meta = tokio::fs::symlink_metadata(&entry).await?;
            if meta.file_type().is_symlink() {
                stats.symlinks.push(entry);
            } else if meta.is_dir() {
                let sub = dir_stats(&entry).await?;
                stats.files += sub.files;
                stats.bytes += sub.bytes;
                stats.symlinks.extend(sub.symlinks);
            } else if meta.is_file() {
                stats.files += 1;
                stats.bytes += meta.len();
            }
        }
        Ok(stats)
    }
    .boxed()
}

/// A temporary directory that is removed when dropped, unless it was created
/// with `retain` set. Dropping also happens when the owning task is cancelled
/// or panics, so nothing is left behind on any exit path.
#[derive(Debug)]
pub struct ScratchDir {
    dir: Option<TempDir>,
    path: PathBuf,
    retain: bool,
}

impl ScratchDir {
    pub fn create(root: &Path, prefix: &str, retain: bool) -> io::Result<ScratchDir> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(root)?;
        Ok(ScratchDir {
            path: dir.path().to_owned(),
            dir: Some(dir),
            retain,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if self.retain {
                let path = dir.into_path();
                tracing::info!(path = %path.display(), "Leaving behind temp dir");
            } else if let Err(e) = dir.close() {
                tracing::warn!("Failed to remove temp dir: {}", e);
            }
        }
    }
}
