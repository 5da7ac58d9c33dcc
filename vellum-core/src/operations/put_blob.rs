use crate::operations::etag_matches;
use crate::{BlobKey, BlobMetadata, Result, SealedWrite, Storage, VellumError, compute_etag};
use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct PutBlobOperation {
    storage: Storage,
}

#[derive(Debug, Clone)]
pub struct PutBlobOperationRequest {
    pub key: BlobKey,
    /// Declared `Content-Type`; guessed from the key when absent.
    pub content_type: Option<String>,
    /// Declared `Content-Length`, checked before any bytes are read.
    pub content_length: Option<u64>,
    pub if_match: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PutBlobOperationResult {
    pub meta: BlobMetadata,
    pub created: bool,
}

impl PutBlobOperation {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Stream `body` into a staged file and commit it under `request.key`.
    ///
    /// Nothing becomes visible unless every step succeeds: limits are enforced
    /// while streaming, the temp file is fsynced and renamed into place, and
    /// only then is the metadata upserted. Dropping the returned future while
    /// streaming discards the staged bytes; after sealing, the commit finishes
    /// on its own task.
    pub async fn run<S, E>(
        &self,
        request: PutBlobOperationRequest,
        body: S,
    ) -> Result<PutBlobOperationResult>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send,
        E: Display + Send,
    {
        let PutBlobOperationRequest {
            key,
            content_type,
            content_length,
            if_match,
        } = request;

        let config = &self.storage.config;
        let limit = config.max_upload_size;

        let content_type = resolve_content_type(&key, content_type.as_deref());
        if !config.mime_allowed(&content_type) {
            return Err(VellumError::UnsupportedMediaType(content_type));
        }

        if let Some(length) = content_length {
            if length > limit {
                return Err(VellumError::PayloadTooLarge { limit });
            }
        }

        if let Some(condition) = if_match.as_deref() {
            let current = self.current_record(&key).await?;
            check_if_match(&key, condition, current.as_ref())?;
        }

        self.storage.content.check_placement(&key).await?;

        let mut staged = self.storage.content.stage().await?;
        let mut body = std::pin::pin!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| VellumError::BodyAborted(e.to_string()))?;
            if staged.size_bytes() + chunk.len() as u64 > limit {
                tracing::debug!("Upload for {} exceeded {} bytes", key, limit);
                return Err(VellumError::PayloadTooLarge { limit });
            }
            staged.write(&chunk).await?;
        }
        let sealed = staged.seal().await?;

        // Once started, the commit runs to completion even if this future is
        // dropped, so the rename and the index upsert land together.
        tokio::spawn(commit(self.storage.clone(), key, content_type, if_match, sealed))
            .await
            .map_err(|e| VellumError::Internal(format!("blob commit task failed: {}", e)))?
    }

    async fn current_record(&self, key: &BlobKey) -> Result<Option<BlobMetadata>> {
        let key = key.clone();
        let record = self
            .storage
            .index
            .blocking(move |index| index.get_record(&key))
            .await?;
        Ok(record.filter(|meta| !meta.is_tombstoned()))
    }
}

async fn commit(
    storage: Storage,
    key: BlobKey,
    content_type: String,
    if_match: Option<String>,
    sealed: SealedWrite,
) -> Result<PutBlobOperationResult> {
    let _guard = storage.locks.write(&key).await?;

    let lookup = key.clone();
    let previous = storage
        .index
        .blocking(move |index| index.get_record(&lookup))
        .await?;
    if let Some(condition) = if_match.as_deref() {
        let live = previous.as_ref().filter(|meta| !meta.is_tombstoned());
        check_if_match(&key, condition, live)?;
    }

    let now = Utc::now();
    let meta = BlobMetadata {
        key: key.clone(),
        content_type,
        size_bytes: sealed.size_bytes,
        etag: compute_etag(&sealed.checksum, &now),
        checksum: sealed.checksum.clone(),
        created_at: previous.as_ref().map(|meta| meta.created_at).unwrap_or(now),
        modified_at: now,
        deleted_at: None,
    };

    let promotion = storage.content.promote(sealed, &key).await?;

    let record = meta.clone();
    if let Err(error) = storage.index.blocking(move |index| index.put(&record)).await {
        tracing::error!("Index commit for {} failed, restoring content: {}", key, error);
        if let Err(rollback_error) = promotion.rollback().await {
            tracing::error!("Content rollback for {} failed: {}", key, rollback_error);
        }
        return Err(error);
    }
    promotion.finish().await;

    tracing::info!(
        "Stored blob {} ({} bytes, {})",
        key,
        meta.size_bytes,
        meta.content_type
    );

    Ok(PutBlobOperationResult {
        created: previous.is_none_or(|meta| meta.is_tombstoned()),
        meta,
    })
}

fn resolve_content_type(key: &BlobKey, declared: Option<&str>) -> String {
    match declared.map(str::trim).filter(|value| !value.is_empty()) {
        Some(declared) => declared.to_string(),
        None => mime_guess::from_path(key.as_str())
            .first()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
    }
}

fn check_if_match(key: &BlobKey, condition: &str, current: Option<&BlobMetadata>) -> Result<()> {
    let matched = match current {
        Some(meta) => etag_matches(condition, &meta.etag, false),
        None => false,
    };
    if matched {
        Ok(())
    } else {
        Err(VellumError::PreconditionFailed(format!(
            "If-Match does not match current version of {}",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::operations::test_support::{body_of, open_storage, open_storage_with};
    use crate::storage::compute_checksum;
    use futures_util::stream;

    fn request(key: &str, content_type: &str) -> PutBlobOperationRequest {
        PutBlobOperationRequest {
            key: BlobKey::parse(key).unwrap(),
            content_type: Some(content_type.to_string()),
            content_length: None,
            if_match: None,
        }
    }

    fn staging_is_empty(storage: &Storage) -> bool {
        std::fs::read_dir(storage.content.root().join(crate::key::STAGING_DIR))
            .unwrap()
            .next()
            .is_none()
    }

    #[tokio::test]
    async fn test_put_stores_bytes_and_metadata() {
        let (_dir, storage) = open_storage();
        let op = PutBlobOperation::new(storage.clone());

        let result = op
            .run(request("cats/tom.png", "image/png"), body_of(&["abc", "def"]))
            .await
            .unwrap();

        assert!(result.created);
        assert_eq!(result.meta.size_bytes, 6);
        assert_eq!(result.meta.checksum, compute_checksum(b"abcdef"));
        assert_eq!(
            std::fs::read(storage.content.content_path(&result.meta.key)).unwrap(),
            b"abcdef"
        );
        assert_eq!(storage.index.get(&result.meta.key).unwrap(), result.meta);
        assert!(staging_is_empty(&storage));
    }

    #[tokio::test]
    async fn test_exact_limit_succeeds_and_one_more_fails() {
        let (_dir, storage) = open_storage_with(StoreConfig {
            max_upload_size: 8,
            ..StoreConfig::default()
        });
        let op = PutBlobOperation::new(storage.clone());

        op.run(request("exact.png", "image/png"), body_of(&["1234", "5678"]))
            .await
            .unwrap();

        let err = op
            .run(request("over.png", "image/png"), body_of(&["1234", "56789"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::PayloadTooLarge { limit: 8 }));

        let over = BlobKey::parse("over.png").unwrap();
        assert!(storage.index.get_record(&over).unwrap().is_none());
        assert!(!storage.content.exists(&over));
        assert!(staging_is_empty(&storage));
    }

    #[tokio::test]
    async fn test_declared_length_over_limit_is_rejected_early() {
        let (_dir, storage) = open_storage_with(StoreConfig {
            max_upload_size: 8,
            ..StoreConfig::default()
        });
        let op = PutBlobOperation::new(storage);

        let mut req = request("big.png", "image/png");
        req.content_length = Some(9);
        let err = op.run(req, body_of(&["x"])).await.unwrap_err();
        assert!(matches!(err, VellumError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_mime_allow_list() {
        let (_dir, storage) = open_storage();
        let op = PutBlobOperation::new(storage.clone());

        op.run(request("ok.png", "image/png"), body_of(&["png"]))
            .await
            .unwrap();

        let err = op
            .run(request("notes.txt", "text/plain"), body_of(&["hi"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::UnsupportedMediaType(_)));

        let notes = BlobKey::parse("notes.txt").unwrap();
        assert!(storage.index.get_record(&notes).unwrap().is_none());
        assert!(!storage.content.exists(&notes));
        assert!(staging_is_empty(&storage));
    }

    #[tokio::test]
    async fn test_content_type_guessed_from_key() {
        let (_dir, storage) = open_storage();
        let op = PutBlobOperation::new(storage);

        let mut req = request("photo.jpg", "");
        req.content_type = None;
        let result = op.run(req, body_of(&["jpg"])).await.unwrap();
        assert_eq!(result.meta.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_if_match() {
        let (_dir, storage) = open_storage();
        let op = PutBlobOperation::new(storage.clone());

        let first = op
            .run(request("a.png", "image/png"), body_of(&["v1"]))
            .await
            .unwrap();

        let mut stale = request("a.png", "image/png");
        stale.if_match = Some("\"not-the-etag\"".to_string());
        let err = op.run(stale, body_of(&["v2"])).await.unwrap_err();
        assert!(matches!(err, VellumError::PreconditionFailed(_)));

        let mut fresh = request("a.png", "image/png");
        fresh.if_match = Some(first.meta.etag.clone());
        let second = op.run(fresh, body_of(&["v2"])).await.unwrap();
        assert!(!second.created);
        assert_ne!(second.meta.etag, first.meta.etag);
        assert_eq!(second.meta.created_at, first.meta.created_at);

        let mut missing = request("missing.png", "image/png");
        missing.if_match = Some("*".to_string());
        let err = op.run(missing, body_of(&["v1"])).await.unwrap_err();
        assert!(matches!(err, VellumError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_aborted_body_leaves_previous_version() {
        let (_dir, storage) = open_storage();
        let op = PutBlobOperation::new(storage.clone());

        let first = op
            .run(request("keep.png", "image/png"), body_of(&["original"]))
            .await
            .unwrap();

        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err("connection reset"),
        ]);
        let err = op
            .run(request("keep.png", "image/png"), broken)
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::BodyAborted(_)));

        assert_eq!(storage.index.get(&first.meta.key).unwrap(), first.meta);
        assert_eq!(
            std::fs::read(storage.content.content_path(&first.meta.key)).unwrap(),
            b"original"
        );
        assert!(staging_is_empty(&storage));
    }

    #[tokio::test]
    async fn test_put_after_soft_delete_revives_key() {
        let (_dir, storage) = open_storage();
        let op = PutBlobOperation::new(storage.clone());

        let first = op
            .run(request("phoenix.png", "image/png"), body_of(&["one"]))
            .await
            .unwrap();
        storage
            .index
            .delete(&first.meta.key, crate::DeleteMode::Soft)
            .unwrap();

        let second = op
            .run(request("phoenix.png", "image/png"), body_of(&["two"]))
            .await
            .unwrap();
        assert!(second.created);
        assert!(second.meta.deleted_at.is_none());
        assert_eq!(storage.index.get(&first.meta.key).unwrap(), second.meta);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_leave_consistent_record() {
        let (_dir, storage) = open_storage();
        let op = PutBlobOperation::new(storage.clone());

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let op = op.clone();
            handles.push(tokio::spawn(async move {
                let payload = vec![i; 4096 + i as usize];
                let chunks: Vec<std::result::Result<Bytes, std::convert::Infallible>> =
                    payload.chunks(1000).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
                op.run(request("race.png", "image/png"), stream::iter(chunks))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let key = BlobKey::parse("race.png").unwrap();
        let meta = storage.index.get(&key).unwrap();
        let bytes = std::fs::read(storage.content.content_path(&key)).unwrap();
        assert_eq!(meta.size_bytes, bytes.len() as u64);
        assert_eq!(meta.checksum, compute_checksum(&bytes));
        assert!(staging_is_empty(&storage));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_put_never_splits_content_and_record() {
        let (_dir, storage) = open_storage();
        let op = PutBlobOperation::new(storage.clone());
        let key = BlobKey::parse("torn.png").unwrap();
        op.run(request("torn.png", "image/png"), body_of(&["old"]))
            .await
            .unwrap();

        for polls in 1..60 {
            let mut put = Box::pin(op.run(
                request("torn.png", "image/png"),
                body_of(&["brand new longer bytes"]),
            ));
            for _ in 0..polls {
                if futures_util::poll!(put.as_mut()).is_ready() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            drop(put);

            let _guard = storage.locks.write(&key).await.unwrap();
            let meta = storage.index.get(&key).unwrap();
            let bytes = std::fs::read(storage.content.content_path(&key)).unwrap();
            assert_eq!(meta.size_bytes, bytes.len() as u64, "after {} polls", polls);
            assert_eq!(meta.checksum, compute_checksum(&bytes), "after {} polls", polls);
        }
    }

    #[tokio::test]
    async fn test_key_colliding_with_directory_or_file_is_invalid() {
        let (_dir, storage) = open_storage();
        let op = PutBlobOperation::new(storage.clone());

        op.run(request("a/b.png", "image/png"), body_of(&["nested"]))
            .await
            .unwrap();

        let err = op
            .run(request("a", "image/png"), body_of(&["dir"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::InvalidKey(_)));

        let err = op
            .run(request("a/b.png/c.png", "image/png"), body_of(&["under file"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::InvalidKey(_)));

        assert!(storage.index.get_record(&BlobKey::parse("a").unwrap()).unwrap().is_none());
        assert!(staging_is_empty(&storage));
    }
}
