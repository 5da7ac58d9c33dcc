use crate::error::{Result, VellumError};
use crate::key::{BlobKey, STAGING_DIR};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

/// ContentStore keeps blob bytes at `{root}/{key}`.
/// New content is staged under `{root}/.vellum-staging/` and renamed into place.
pub struct ContentStore {
    root: PathBuf,
    staging: PathBuf,
}

impl ContentStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        let staging = root.join(STAGING_DIR);
        std::fs::create_dir_all(&staging)?;
        let store = Self { root, staging };
        store.sweep_staging()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_path(&self, key: &BlobKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn exists(&self, key: &BlobKey) -> bool {
        self.content_path(key).is_file()
    }

    /// Reject keys whose content path is an existing directory of other blobs
    /// or sits below an existing blob file.
    pub async fn check_placement(&self, key: &BlobKey) -> Result<()> {
        let final_path = self.content_path(key);
        if fs::metadata(&final_path).await.is_ok_and(|meta| meta.is_dir()) {
            return Err(VellumError::InvalidKey(format!(
                "{} is a prefix of existing blobs",
                key
            )));
        }

        let mut ancestor = final_path.parent();
        while let Some(dir) = ancestor.filter(|dir| *dir != self.root.as_path()) {
            if fs::metadata(dir).await.is_ok_and(|meta| !meta.is_dir()) {
                return Err(VellumError::InvalidKey(format!(
                    "{} is nested under an existing blob",
                    key
                )));
            }
            ancestor = dir.parent();
        }
        Ok(())
    }

    /// Remove staging leftovers from a previous run that died mid-write.
    fn sweep_staging(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.staging)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::warn!("Removed {} stale staged writes from {:?}", removed, self.staging);
        }
        Ok(removed)
    }

    /// Start a staged write into a fresh temporary file.
    pub async fn stage(&self) -> Result<StagedWrite> {
        let temp_path = self.staging.join(format!("{}.tmp", Ulid::new()));
        let file = fs::File::create(&temp_path).await?;
        Ok(StagedWrite {
            file: Some(file),
            temp_path: Some(temp_path),
            hasher: Md5::new(),
            size_bytes: 0,
        })
    }

    /// Atomically move a sealed write to the content path for `key`.
    ///
    /// The previous content, if any, is kept as a hard-linked backup until
    /// [`Promotion::finish`] or [`Promotion::rollback`] is called.
    pub async fn promote(&self, mut sealed: SealedWrite, key: &BlobKey) -> Result<Promotion> {
        self.check_placement(key).await?;
        let final_path = self.content_path(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let backup_path = self.staging.join(format!("{}.bak", Ulid::new()));
        let backup = match fs::hard_link(&final_path, &backup_path).await {
            Ok(()) => Some(backup_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let temp_path = sealed
            .temp_path
            .take()
            .ok_or_else(|| VellumError::Internal("staged write already promoted".to_string()))?;

        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if let Some(backup) = &backup {
                let _ = fs::remove_file(backup).await;
            }
            return Err(e.into());
        }
        sync_dir(final_path.parent()).await?;

        Ok(Promotion {
            final_path,
            backup,
        })
    }

    pub async fn open(&self, key: &BlobKey) -> Result<fs::File> {
        match fs::File::open(self.content_path(key)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VellumError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove content for `key`. Returns false when no file existed.
    pub async fn remove(&self, key: &BlobKey) -> Result<bool> {
        match fs::remove_file(self.content_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-progress write to a temporary file, hashed as it goes.
/// Dropping it before [`StagedWrite::seal`] removes the temporary file.
pub struct StagedWrite {
    file: Option<fs::File>,
    temp_path: Option<PathBuf>,
    hasher: Md5,
    size_bytes: u64,
}

impl StagedWrite {
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| VellumError::Internal("staged write already sealed".to_string()))?;
        file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.size_bytes += chunk.len() as u64;
        Ok(())
    }

    /// Flush and fsync the temporary file.
    pub async fn seal(mut self) -> Result<SealedWrite> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| VellumError::Internal("staged write already sealed".to_string()))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let checksum = STANDARD.encode(self.hasher.clone().finalize());
        Ok(SealedWrite {
            temp_path: self.temp_path.take(),
            checksum,
            size_bytes: self.size_bytes,
        })
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if let Some(path) = self.temp_path.take() {
            drop(self.file.take());
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to discard staged write {:?}: {}", path, e);
            }
        }
    }
}

/// Durable temporary file waiting to be promoted.
pub struct SealedWrite {
    temp_path: Option<PathBuf>,
    pub checksum: String,
    pub size_bytes: u64,
}

impl Drop for SealedWrite {
    fn drop(&mut self) {
        if let Some(path) = self.temp_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to discard sealed write {:?}: {}", path, e);
            }
        }
    }
}

/// Content that has been renamed into place but not yet committed to the index.
pub struct Promotion {
    final_path: PathBuf,
    backup: Option<PathBuf>,
}

impl Promotion {
    /// The index commit succeeded; drop the backup of the previous content.
    pub async fn finish(self) {
        if let Some(backup) = &self.backup {
            if let Err(e) = fs::remove_file(backup).await {
                tracing::warn!("Failed to remove content backup {:?}: {}", backup, e);
            }
        }
    }

    /// The index commit failed; put the previous content back, or remove the
    /// new file if there was none.
    pub async fn rollback(self) -> Result<()> {
        match &self.backup {
            Some(backup) => fs::rename(backup, &self.final_path).await?,
            None => fs::remove_file(&self.final_path).await?,
        }
        sync_dir(self.final_path.parent()).await
    }
}

/// Fsync a directory so a rename inside it is durable.
#[cfg(unix)]
async fn sync_dir(dir: Option<&Path>) -> Result<()> {
    if let Some(dir) = dir {
        fs::File::open(dir).await?.sync_all().await?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: Option<&Path>) -> Result<()> {
    Ok(())
}

/// Base64 MD5 of `data`, in the same form as stored checksums.
pub fn compute_checksum(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}
