//! Filesystem access for stores.
//!
//! This module centralizes the file operations the converter and the query
//! engine perform against a store root:
//!
//! - atomic file writes (write to a temporary sibling, sync, rename),
//! - whole-file reads with `NotFound` separated from other I/O failures,
//! - directory listings used to discover identity tables and axes,
//! - the staging directory a conversion is built in before it is published
//!   over the final output path.
//!
//! Only the local filesystem is supported. Every entry point matches on
//! [`StoreLocation`] so further backends can be added without touching the
//! callers.

mod error;
mod staging;

pub use error::StorageError;
use error::{NotFoundSnafu, ReadSnafu, WriteSnafu};
pub use staging::StagingDir;

use snafu::prelude::*;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Location of a store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    /// A store rooted at a local directory.
    Local(PathBuf),
}

impl StoreLocation {
    /// Creates a new `StoreLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StoreLocation::Local(root.into())
    }

    /// Root directory of a local store.
    pub fn root(&self) -> &Path {
        match self {
            StoreLocation::Local(root) => root,
        }
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreLocation::Local(root) => write!(f, "{}", root.display()),
        }
    }
}

/// Join a store location with a relative path into an absolute local path.
pub(crate) fn join_local(location: &StoreLocation, rel: &Path) -> PathBuf {
    match location {
        StoreLocation::Local(root) => root.join(rel),
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .context(WriteSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Call after a successful rename.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we are likely already handling another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `rel_path` inside `location` using an atomic write.
///
/// The payload goes to a temporary file next to the target, is synced, and
/// is then renamed into place. Parent directories are created as needed.
///
/// # Errors
///
/// Returns `StorageError::Write` when any filesystem step fails.
pub async fn write_atomic(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);

            create_parent_dir(&abs).await?;

            let tmp_path = abs.with_extension("tmp");
            let mut guard = TempFileGuard::new(tmp_path.clone());

            {
                let mut file = fs::File::create(&tmp_path)
                    .await
                    .context(WriteSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.write_all(contents)
                    .await
                    .context(WriteSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.sync_all()
                    .await
                    .context(WriteSnafu {
                        path: tmp_path.display().to_string(),
                    })?;
            }

            fs::rename(&tmp_path, &abs)
                .await
                .context(WriteSnafu {
                    path: abs.display().to_string(),
                })?;

            guard.disarm();

            Ok(())
        }
    }
}

/// Read the file at `rel_path` within `location` as UTF-8 text.
///
/// A missing file yields `StorageError::NotFound`; other failures yield
/// `StorageError::Read`.
pub async fn read_to_string(location: &StoreLocation, rel_path: &Path) -> StorageResult<String> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);

            match fs::read_to_string(&abs).await {
                Ok(s) => Ok(s),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e).context(NotFoundSnafu {
                    path: abs.display().to_string(),
                }),
                Err(e) => Err(e).context(ReadSnafu {
                    path: abs.display().to_string(),
                }),
            }
        }
    }
}

/// Read the full contents of the file at `rel_path` within `location`.
///
/// Errors:
/// - If the file does not exist this returns `StorageError::NotFound`.
/// - On any other I/O error this returns `StorageError::Read`.
pub async fn read_all_bytes(location: &StoreLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let path_str = abs.display().to_string();

            match fs::read(&abs).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(e).context(NotFoundSnafu { path: path_str })
                }
                Err(e) => Err(e).context(ReadSnafu { path: path_str }),
            }
        }
    }
}

/// List the regular files directly under `rel_dir` whose extension is
/// `extension`, returning their file stems in sorted order.
///
/// A missing directory lists as empty.
pub async fn list_files(
    location: &StoreLocation,
    rel_dir: &Path,
    extension: &str,
) -> StorageResult<Vec<String>> {
    match location {
        StoreLocation::Local(_) => {
            let abs = join_local(location, rel_dir);
            let path_str = abs.display().to_string();

            let mut entries = match fs::read_dir(&abs).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(e).context(ReadSnafu { path: path_str });
                }
            };

            let mut stems = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .context(ReadSnafu {
                    path: path_str.clone(),
                })?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .context(ReadSnafu {
                        path: entry.path().display().to_string(),
                    })?;
                if !file_type.is_file() {
                    continue;
                }
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    stems.push(stem.to_string());
                }
            }
            stems.sort();
            Ok(stems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_atomic_creates_parent_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        let rel_path = Path::new("data/ST/interval/line/Flow.parquet");
        write_atomic(&location, rel_path, b"nested content").await?;

        let abs = tmp.path().join(rel_path);
        assert!(abs.exists());
        let read_back = tokio::fs::read(&abs).await?;
        assert_eq!(read_back, b"nested content");
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_overwrites_without_leftover_tmp() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel_path = Path::new("_plexstore.json");

        write_atomic(&location, rel_path, b"original").await?;
        write_atomic(&location, rel_path, b"updated").await?;

        let read_back = read_to_string(&location, rel_path).await?;
        assert_eq!(read_back, "updated");
        assert!(!tmp.path().join("_plexstore.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn reads_report_not_found_for_missing_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel_path = Path::new("does_not_exist.parquet");

        let err = read_all_bytes(&location, rel_path)
            .await
            .expect_err("expected NotFound error");
        assert!(err.is_not_found());

        let err = read_to_string(&location, rel_path)
            .await
            .expect_err("expected NotFound error");
        assert!(matches!(err, StorageError::NotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn failures_name_the_operation() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        tokio::fs::create_dir_all(tmp.path().join("data")).await?;
        tokio::fs::write(tmp.path().join("blocker"), b"file").await?;

        let err = read_all_bytes(&location, Path::new("data"))
            .await
            .expect_err("a directory is not a readable file");
        assert!(matches!(err, StorageError::Read { .. }));
        assert!(!err.is_not_found());

        let err = write_atomic(&location, Path::new("blocker/inner.parquet"), b"x")
            .await
            .expect_err("parent is a file");
        assert!(matches!(err, StorageError::Write { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn list_files_filters_by_extension_and_sorts() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let dir = Path::new("metadata/objects");

        write_atomic(&location, &dir.join("node.parquet"), b"x").await?;
        write_atomic(&location, &dir.join("generator.parquet"), b"x").await?;
        write_atomic(&location, &dir.join("notes.txt"), b"x").await?;
        tokio::fs::create_dir_all(tmp.path().join(dir).join("nested.parquet")).await?;

        let stems = list_files(&location, dir, "parquet").await?;
        assert_eq!(stems, vec!["generator".to_string(), "node".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn list_files_on_missing_directory_is_empty() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        let stems = list_files(&location, Path::new("metadata/relations"), "parquet").await?;
        assert!(stems.is_empty());
        Ok(())
    }
}
