use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::utils::validation::validate_file_path;

/// Disk placement and retrieval seam. Paths handed across this boundary
/// are relative to the storage root; resolution back to absolute form
/// always goes through the containment check.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Directory where uploads are staged before validation completes.
    /// Same filesystem as the root so the final placement is a rename.
    fn staging_dir(&self) -> PathBuf;

    /// Resolves a stored relative path to an absolute one, or None if it
    /// escapes the root.
    fn resolve(&self, relative_path: &str) -> Option<PathBuf>;

    /// Moves a staged file into `<root>/<owner_dir>/<stored_name>`.
    /// Returns the relative path recorded in the database. The move is a
    /// rename, never a copy: either the file is in place or it is not.
    async fn place(&self, staged: &Path, owner_dir: &str, stored_name: &str) -> Result<String>;

    /// Unlinks a stored file. Missing files are not an error.
    async fn remove(&self, relative_path: &str) -> Result<()>;

    /// Hard-links the stored file into the public directory under the
    /// share token, falling back to a copy across filesystems.
    async fn materialize_public(&self, relative_path: &str, token: &str) -> Result<PathBuf>;

    /// Removes a materialized public copy. Missing files are fine.
    async fn remove_public(&self, token: &str) -> Result<()>;
}

pub struct LocalStorage {
    root: PathBuf,
    public_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf, public_dir: PathBuf) -> Self {
        Self { root, public_dir }
    }

    /// Creates the root, staging and public directories up front so the
    /// first upload does not race on them.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join("staging"))
            .await
            .context("creating staging directory")?;
        tokio::fs::create_dir_all(&self.public_dir)
            .await
            .context("creating public directory")?;
        Ok(())
    }

    /// Idempotent directory creation that tolerates concurrent
    /// first-writers and attempts one permission repair on a directory
    /// that exists but is not writable.
    async fn ensure_writable_dir(dir: &Path) -> Result<()> {
        match tokio::fs::create_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(anyhow!("creating {}: {}", dir.display(), e)),
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = tokio::fs::metadata(dir).await?;
            let mode = meta.permissions().mode();
            if mode & 0o200 == 0 {
                tracing::warn!("Repairing permissions on {}", dir.display());
                let mut perms = meta.permissions();
                perms.set_mode(0o750);
                tokio::fs::set_permissions(dir, perms).await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl StorageService for LocalStorage {
    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn resolve(&self, relative_path: &str) -> Option<PathBuf> {
        validate_file_path(relative_path, &self.root)
    }

    async fn place(&self, staged: &Path, owner_dir: &str, stored_name: &str) -> Result<String> {
        let dir = self.root.join(owner_dir);
        Self::ensure_writable_dir(&dir).await?;

        let dest = dir.join(stored_name);
        tokio::fs::rename(staged, &dest)
            .await
            .with_context(|| format!("placing upload at {}", dest.display()))?;

        Ok(format!("{}/{}", owner_dir, stored_name))
    }

    async fn remove(&self, relative_path: &str) -> Result<()> {
        let abs = self
            .resolve(relative_path)
            .ok_or_else(|| anyhow!("path escapes storage root: {}", relative_path))?;
        match tokio::fs::remove_file(&abs).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("removing {}: {}", abs.display(), e)),
        }
    }

    async fn materialize_public(&self, relative_path: &str, token: &str) -> Result<PathBuf> {
        let src = self
            .resolve(relative_path)
            .ok_or_else(|| anyhow!("path escapes storage root: {}", relative_path))?;
        Self::ensure_writable_dir(&self.public_dir).await?;
        let dest = self.public_dir.join(token);

        match tokio::fs::hard_link(&src, &dest).await {
            Ok(()) => Ok(dest),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(dest),
            Err(link_err) => {
                // Cross-device or unsupported filesystem: fall back to a copy.
                tracing::debug!(
                    "hard_link failed ({}), copying {} instead",
                    link_err,
                    src.display()
                );
                tokio::fs::copy(&src, &dest)
                    .await
                    .with_context(|| format!("copying to {}", dest.display()))?;
                Ok(dest)
            }
        }
    }

    async fn remove_public(&self, token: &str) -> Result<()> {
        let dest = self.public_dir.join(token);
        match tokio::fs::remove_file(&dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("removing public copy {}: {}", dest.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> (tempfile::TempDir, LocalStorage) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(tmp.path().join("storage"), tmp.path().join("public"));
        storage.init().await.unwrap();
        (tmp, storage)
    }

    #[tokio::test]
    async fn test_place_is_a_move() {
        let (_tmp, storage) = storage().await;
        let staged = storage.staging_dir().join("incoming");
        tokio::fs::write(&staged, b"payload").await.unwrap();

        let rel = storage.place(&staged, "user-1", "abc123.bin").await.unwrap();
        assert_eq!(rel, "user-1/abc123.bin");
        assert!(!staged.exists());
        let abs = storage.resolve(&rel).unwrap();
        assert_eq!(tokio::fs::read(&abs).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_resolve_rejects_escape() {
        let (_tmp, storage) = storage().await;
        assert!(storage.resolve("../outside").is_none());
        assert!(storage.resolve("a/../../outside").is_none());
    }

    #[tokio::test]
    async fn test_public_materialization_and_removal() {
        let (_tmp, storage) = storage().await;
        let staged = storage.staging_dir().join("incoming");
        tokio::fs::write(&staged, b"shared bytes").await.unwrap();
        let rel = storage.place(&staged, "user-1", "f.bin").await.unwrap();

        let public = storage.materialize_public(&rel, "tok123").await.unwrap();
        assert_eq!(tokio::fs::read(&public).await.unwrap(), b"shared bytes");

        storage.remove_public("tok123").await.unwrap();
        assert!(!public.exists());
        // Removing again is not an error.
        storage.remove_public("tok123").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let (_tmp, storage) = storage().await;
        storage.remove("user-1/never-existed.bin").await.unwrap();
    }
}
