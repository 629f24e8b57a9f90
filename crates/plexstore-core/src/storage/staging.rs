use std::{
    io,
    path::{Path, PathBuf},
};

use snafu::prelude::*;
use tokio::fs;

use super::error::{InvalidOutputPathSnafu, PublishSnafu, StageSnafu};
use super::{StorageResult, StoreLocation};

/// Directory a store is assembled in before it replaces the final output.
///
/// The directory lives next to the output path so the publishing rename
/// stays on one filesystem. Dropping an unpublished `StagingDir` removes it,
/// so a failed conversion never leaves a partial store behind.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    output: PathBuf,
    armed: bool,
}

impl StagingDir {
    /// Create an empty staging directory for `output`.
    ///
    /// A stale staging directory left by a crashed run is cleared first.
    pub async fn create(output: &Path) -> StorageResult<Self> {
        let (Some(parent), Some(name)) = (output.parent(), output.file_name()) else {
            return InvalidOutputPathSnafu {
                path: output.display().to_string(),
            }
            .fail();
        };

        let staging = parent.join(format!(
            ".{}.staging-{}",
            name.to_string_lossy(),
            std::process::id()
        ));

        let stage_ctx = || StageSnafu {
            path: staging.display().to_string(),
        };
        remove_path(&staging).await.context(stage_ctx())?;
        fs::create_dir_all(&staging).await.context(stage_ctx())?;

        Ok(Self {
            path: staging,
            output: output.to_path_buf(),
            armed: true,
        })
    }

    /// Store location rooted at the staging directory.
    pub fn location(&self) -> StoreLocation {
        StoreLocation::local(&self.path)
    }

    /// Staging directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the output path with the staged store.
    ///
    /// Whatever exists at the output path (a previous store or a stray file)
    /// is removed before the rename.
    pub async fn publish(mut self) -> StorageResult<StoreLocation> {
        let publish_ctx = || PublishSnafu {
            path: self.output.display().to_string(),
        };
        remove_path(&self.output).await.context(publish_ctx())?;
        fs::rename(&self.path, &self.output)
            .await
            .context(publish_ctx())?;
        self.armed = false;
        Ok(StoreLocation::local(&self.output))
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Remove a file or directory tree; a missing path is not an error.
async fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{read_to_string, write_atomic};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn publish_replaces_existing_output() -> TestResult {
        let tmp = TempDir::new()?;
        let output = tmp.path().join("solution.plexstore");
        tokio::fs::create_dir_all(output.join("stale")).await?;

        let staging = StagingDir::create(&output).await?;
        write_atomic(&staging.location(), Path::new("marker.txt"), b"fresh").await?;
        let staged_path = staging.path().to_path_buf();

        let published = staging.publish().await?;
        assert_eq!(published.root(), output.as_path());
        assert!(!staged_path.exists());
        assert!(!output.join("stale").exists());
        assert_eq!(
            read_to_string(&published, Path::new("marker.txt")).await?,
            "fresh"
        );
        Ok(())
    }

    #[tokio::test]
    async fn dropped_staging_dir_is_removed() -> TestResult {
        let tmp = TempDir::new()?;
        let output = tmp.path().join("solution.plexstore");

        let staging = StagingDir::create(&output).await?;
        write_atomic(&staging.location(), Path::new("data/partial.parquet"), b"x").await?;
        let staged_path = staging.path().to_path_buf();
        assert!(staged_path.exists());

        drop(staging);
        assert!(!staged_path.exists());
        assert!(!output.exists());
        Ok(())
    }

    #[tokio::test]
    async fn unusable_output_parent_is_a_staging_error() -> TestResult {
        let tmp = TempDir::new()?;
        tokio::fs::write(tmp.path().join("blocker"), b"file").await?;

        let err = StagingDir::create(&tmp.path().join("blocker").join("out.plexstore"))
            .await
            .expect_err("parent is a file");
        assert!(matches!(err, crate::storage::StorageError::Stage { .. }));

        let err = StagingDir::create(Path::new("/"))
            .await
            .expect_err("root has no file name");
        assert!(matches!(
            err,
            crate::storage::StorageError::InvalidOutputPath { .. }
        ));
        Ok(())
    }
}
