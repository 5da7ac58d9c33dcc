use crate::{BlobKey, DeleteMode, Result, Storage};

#[derive(Clone)]
pub struct DeleteBlobOperation {
    storage: Storage,
}

#[derive(Debug, Clone)]
pub struct DeleteBlobOperationRequest {
    pub key: BlobKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteBlobOperationOutcome {
    /// A live record was tombstoned or removed.
    Deleted(DeleteMode),
    /// Nothing live existed for the key. Callers treat this the same as
    /// `Deleted` so repeated deletes are indistinguishable.
    AlreadyAbsent,
}

impl DeleteBlobOperation {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn run(&self, request: DeleteBlobOperationRequest) -> Result<DeleteBlobOperationOutcome> {
        let DeleteBlobOperationRequest { key } = request;
        let mode = self.storage.delete_mode();

        let _guard = self.storage.locks.write(&key).await?;

        let target = key.clone();
        let removed = self
            .storage
            .index
            .blocking(move |index| index.delete(&target, mode))
            .await?;

        // Hard deletes drop the record first so no reader can see metadata
        // pointing at missing content.
        let content_removed = match mode {
            DeleteMode::Hard => self.storage.content.remove(&key).await?,
            DeleteMode::Soft => false,
        };

        if removed || content_removed {
            tracing::info!("Deleted blob {} ({:?})", key, mode);
            Ok(DeleteBlobOperationOutcome::Deleted(mode))
        } else {
            tracing::debug!("Delete of absent blob {}", key);
            Ok(DeleteBlobOperationOutcome::AlreadyAbsent)
        }
    }
}
