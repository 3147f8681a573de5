// SPDX-License-Identifier: MIT

//! Per-request staging of the uploaded file.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::ServiceError;

/// One uploaded file, staged in a working directory owned by a single
/// in-flight request.
///
/// The directory gets a random name under the configured staging root
/// so concurrent requests never collide, and it is deleted recursively
/// when the value drops, on every exit path.
#[derive(Debug)]
pub struct StagedFile {
    // Held for its Drop impl; the directory lives as long as the request.
    dir: TempDir,
    file_name: String,
    path: PathBuf,
}

impl StagedFile {
    /// Stage the uploaded payload under `staging_root`.
    ///
    /// `file_name` is the client-visible name. Names containing a path
    /// separator are rejected before anything touches the disk; this
    /// is the directory-traversal guard.
    pub async fn create(
        staging_root: &Path,
        file_name: &str,
        payload: &[u8],
    ) -> Result<Self, ServiceError> {
        if file_name.is_empty() || file_name.contains('/') || file_name.contains('\\') {
            return Err(ServiceError::InvalidFilename(file_name.to_string()));
        }

        tokio::fs::create_dir_all(staging_root).await?;
        let dir = tempfile::Builder::new()
            .prefix(".staging-")
            .rand_bytes(16)
            .tempdir_in(staging_root)
            .inspect_err(|error| {
                tracing::error!(
                    ?error,
                    staging_root = %staging_root.display(),
                    "Failed to create a staging directory"
                );
            })?;
        let path = dir.path().join(file_name);
        tokio::fs::write(&path, payload).await?;
        tracing::debug!(
            path = %path.display(),
            bytes = payload.len(),
            "Staged uploaded file"
        );

        Ok(Self {
            dir,
            file_name: file_name.to_string(),
            path,
        })
    }

    /// The client-visible file name, with no directory components.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// The absolute path of the staged file inside the working
    /// directory. Never expose this to the client.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The working directory owning the staged file.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Read the staged file back, e.g. after the tool rewrote it in
    /// place.
    pub async fn contents(&self) -> Result<Vec<u8>, ServiceError> {
        Ok(tokio::fs::read(&self.path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn staging_directory_is_removed_on_drop() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;

        let staged = StagedFile::create(root.path(), "app.exe", b"MZ").await?;
        let dir = staged.dir().to_owned();
        assert!(dir.exists());
        assert_eq!(staged.contents().await?, b"MZ");

        drop(staged);
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(root.path())?.count(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn path_separators_are_rejected_before_any_write() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;

        for name in ["../app.exe", "a/b.exe", "a\\b.exe", ""] {
            let error = StagedFile::create(root.path(), name, b"MZ")
                .await
                .unwrap_err();
            assert!(matches!(error, ServiceError::InvalidFilename(_)));
        }
        // Nothing may exist under the root, not even an empty
        // per-request directory.
        assert!(
            !root.path().exists() || std::fs::read_dir(root.path())?.count() == 0
        );

        Ok(())
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_directories() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;

        let first = StagedFile::create(root.path(), "app.exe", b"1").await?;
        let second = StagedFile::create(root.path(), "app.exe", b"2").await?;
        assert_ne!(first.dir(), second.dir());
        assert_eq!(first.contents().await?, b"1");
        assert_eq!(second.contents().await?, b"2");

        Ok(())
    }
}
