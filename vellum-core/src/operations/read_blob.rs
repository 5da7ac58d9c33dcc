use crate::operations::etag_matches;
use crate::{BlobKey, BlobMetadata, Result, Storage, VellumError, compute_checksum};
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::AsyncSeekExt;

#[derive(Clone)]
pub struct ReadBlobOperation {
    storage: Storage,
}

#[derive(Debug, Clone)]
pub struct ReadBlobOperationRequest {
    pub key: BlobKey,
    /// Raw `Range` header.
    pub range: Option<String>,
    pub if_none_match: Option<String>,
    pub include_body: bool,
}

#[derive(Debug)]
pub struct ReadBlobOperationResult {
    pub meta: BlobMetadata,
    pub range: Option<ByteRange>,
    pub body: Option<BlobBody>,
}

/// Open content positioned at the first byte to send.
#[derive(Debug)]
pub struct BlobBody {
    pub file: File,
    pub length: u64,
}

#[derive(Debug)]
pub enum ReadBlobOperationOutcome {
    Found(ReadBlobOperationResult),
    NotModified(BlobMetadata),
    NotFound,
    Deleted,
}

/// Inclusive byte range resolved against a known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Resolve a `Range` header against `size`.
    ///
    /// Returns `Ok(None)` for headers that should be ignored (other units,
    /// multiple ranges, malformed values) so the full content is served.
    pub fn parse(header: &str, size: u64) -> Result<Option<ByteRange>> {
        let Some(ranges) = header.trim().strip_prefix("bytes=") else {
            return Ok(None);
        };
        if ranges.contains(',') {
            return Ok(None);
        }
        let Some((first, last)) = ranges.trim().split_once('-') else {
            return Ok(None);
        };
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            let Ok(suffix) = last.parse::<u64>() else {
                return Ok(None);
            };
            if suffix == 0 || size == 0 {
                return Err(VellumError::RangeNotSatisfiable { size });
            }
            return Ok(Some(ByteRange {
                start: size.saturating_sub(suffix),
                end: size - 1,
            }));
        }

        let Ok(start) = first.parse::<u64>() else {
            return Ok(None);
        };
        let end = if last.is_empty() {
            None
        } else {
            match last.parse::<u64>() {
                Ok(end) if end >= start => Some(end),
                _ => return Ok(None),
            }
        };

        if start >= size {
            return Err(VellumError::RangeNotSatisfiable { size });
        }
        let end = end.map_or(size - 1, |end| end.min(size - 1));
        Ok(Some(ByteRange { start, end }))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// `Content-Range` value for this range of a `size`-byte blob.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

impl ReadBlobOperation {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn run(&self, request: ReadBlobOperationRequest) -> Result<ReadBlobOperationOutcome> {
        let ReadBlobOperationRequest {
            key,
            range,
            if_none_match,
            include_body,
        } = request;

        // Metadata lookup and open happen under the key lock, so the file we
        // hold matches the record even if a write lands right after.
        let _guard = self.storage.locks.read(&key).await?;

        let lookup = key.clone();
        let record = self
            .storage
            .index
            .blocking(move |index| index.get_record(&lookup))
            .await?;

        let meta = match record {
            None => return Ok(ReadBlobOperationOutcome::NotFound),
            Some(meta) if meta.is_tombstoned() => return Ok(ReadBlobOperationOutcome::Deleted),
            Some(meta) => meta,
        };

        if let Some(condition) = if_none_match.as_deref() {
            if etag_matches(condition, &meta.etag, true) {
                return Ok(ReadBlobOperationOutcome::NotModified(meta));
            }
        }

        let range = match range.as_deref() {
            Some(header) => ByteRange::parse(header, meta.size_bytes)?,
            None => None,
        };

        if !include_body {
            return Ok(ReadBlobOperationOutcome::Found(ReadBlobOperationResult {
                meta,
                range,
                body: None,
            }));
        }

        let body = self.open_body(&meta, range).await?;
        Ok(ReadBlobOperationOutcome::Found(ReadBlobOperationResult {
            meta,
            range,
            body: Some(body),
        }))
    }

    async fn open_body(&self, meta: &BlobMetadata, range: Option<ByteRange>) -> Result<BlobBody> {
        let mut file = match self.storage.content.open(&meta.key).await {
            Ok(file) => file,
            Err(VellumError::NotFound(_)) => {
                tracing::error!("Content missing for indexed blob {}", meta.key);
                return Err(VellumError::Internal(format!(
                    "content missing for {}",
                    meta.key
                )));
            }
            Err(error) => return Err(error),
        };

        let on_disk = file.metadata().await?.len();
        if on_disk != meta.size_bytes {
            tracing::error!(
                "Content size mismatch for {}: index={} disk={}",
                meta.key,
                meta.size_bytes,
                on_disk
            );
            return Err(VellumError::Internal(format!(
                "content size mismatch for {}",
                meta.key
            )));
        }

        if self.storage.config.debug {
            let bytes = tokio::fs::read(self.storage.content.content_path(&meta.key)).await?;
            let checksum = compute_checksum(&bytes);
            if checksum != meta.checksum {
                tracing::error!(
                    "Checksum mismatch for {}: index={} disk={}",
                    meta.key,
                    meta.checksum,
                    checksum
                );
                return Err(VellumError::Internal(format!(
                    "checksum mismatch for {}",
                    meta.key
                )));
            }
        }

        let length = match range {
            Some(range) => {
                file.seek(SeekFrom::Start(range.start)).await?;
                range.len()
            }
            None => meta.size_bytes,
        };

        Ok(BlobBody { file, length })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::operations::test_support::{body_of, open_storage, open_storage_with};
    use crate::operations::{PutBlobOperation, PutBlobOperationRequest};
    use tokio::io::AsyncReadExt;

    async fn put(storage: &Storage, key: &str, content: &str) -> BlobMetadata {
        PutBlobOperation::new(storage.clone())
            .run(
                PutBlobOperationRequest {
                    key: BlobKey::parse(key).unwrap(),
                    content_type: Some("image/png".to_string()),
                    content_length: None,
                    if_match: None,
                },
                body_of(&[content]),
            )
            .await
            .unwrap()
            .meta
    }

    fn request(key: &str) -> ReadBlobOperationRequest {
        ReadBlobOperationRequest {
            key: BlobKey::parse(key).unwrap(),
            range: None,
            if_none_match: None,
            include_body: true,
        }
    }

    async fn read_body(body: BlobBody) -> Vec<u8> {
        let mut buf = Vec::new();
        body.file.take(body.length).read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(
            ByteRange::parse("bytes=0-4", 10).unwrap(),
            Some(ByteRange { start: 0, end: 4 })
        );
        assert_eq!(
            ByteRange::parse("bytes=5-", 10).unwrap(),
            Some(ByteRange { start: 5, end: 9 })
        );
        assert_eq!(
            ByteRange::parse("bytes=-3", 10).unwrap(),
            Some(ByteRange { start: 7, end: 9 })
        );
        assert_eq!(
            ByteRange::parse("bytes=-30", 10).unwrap(),
            Some(ByteRange { start: 0, end: 9 })
        );
        assert_eq!(
            ByteRange::parse("bytes=8-100", 10).unwrap(),
            Some(ByteRange { start: 8, end: 9 })
        );
        assert_eq!(ByteRange::parse("bytes=0-1,3-4", 10).unwrap(), None);
        assert_eq!(ByteRange::parse("items=0-1", 10).unwrap(), None);
        assert_eq!(ByteRange::parse("bytes=5-2", 10).unwrap(), None);
        assert_eq!(ByteRange::parse("bytes=abc", 10).unwrap(), None);
        assert!(matches!(
            ByteRange::parse("bytes=10-", 10),
            Err(VellumError::RangeNotSatisfiable { size: 10 })
        ));
        assert!(matches!(
            ByteRange::parse("bytes=-0", 10),
            Err(VellumError::RangeNotSatisfiable { .. })
        ));
        assert_eq!(ByteRange { start: 2, end: 5 }.content_range(10), "bytes 2-5/10");
    }

    #[tokio::test]
    async fn test_read_full_body() {
        let (_dir, storage) = open_storage();
        let meta = put(&storage, "cat.png", "meow meow").await;

        let outcome = ReadBlobOperation::new(storage).run(request("cat.png")).await.unwrap();
        let ReadBlobOperationOutcome::Found(result) = outcome else {
            panic!("expected blob to be found");
        };
        assert_eq!(result.meta, meta);
        assert!(result.range.is_none());
        assert_eq!(read_body(result.body.unwrap()).await, b"meow meow");
    }

    #[tokio::test]
    async fn test_read_range() {
        let (_dir, storage) = open_storage();
        put(&storage, "digits.png", "0123456789").await;

        let mut req = request("digits.png");
        req.range = Some("bytes=3-5".to_string());
        let outcome = ReadBlobOperation::new(storage.clone()).run(req).await.unwrap();
        let ReadBlobOperationOutcome::Found(result) = outcome else {
            panic!("expected blob to be found");
        };
        assert_eq!(result.range, Some(ByteRange { start: 3, end: 5 }));
        assert_eq!(read_body(result.body.unwrap()).await, b"345");

        let mut req = request("digits.png");
        req.range = Some("bytes=20-".to_string());
        let err = ReadBlobOperation::new(storage).run(req).await.unwrap_err();
        assert!(matches!(err, VellumError::RangeNotSatisfiable { size: 10 }));
    }

    #[tokio::test]
    async fn test_if_none_match() {
        let (_dir, storage) = open_storage();
        let meta = put(&storage, "etag.png", "content").await;
        let op = ReadBlobOperation::new(storage);

        let mut req = request("etag.png");
        req.if_none_match = Some(meta.etag.clone());
        assert!(matches!(
            op.run(req).await.unwrap(),
            ReadBlobOperationOutcome::NotModified(_)
        ));

        let mut req = request("etag.png");
        req.if_none_match = Some(format!("W/{}", meta.etag));
        assert!(matches!(
            op.run(req).await.unwrap(),
            ReadBlobOperationOutcome::NotModified(_)
        ));

        let mut req = request("etag.png");
        req.if_none_match = Some("\"stale\"".to_string());
        assert!(matches!(
            op.run(req).await.unwrap(),
            ReadBlobOperationOutcome::Found(_)
        ));
    }

    #[tokio::test]
    async fn test_head_has_no_body() {
        let (_dir, storage) = open_storage();
        put(&storage, "head.png", "abc").await;

        let mut req = request("head.png");
        req.include_body = false;
        let outcome = ReadBlobOperation::new(storage).run(req).await.unwrap();
        let ReadBlobOperationOutcome::Found(result) = outcome else {
            panic!("expected blob to be found");
        };
        assert!(result.body.is_none());
        assert_eq!(result.meta.size_bytes, 3);
    }

    #[tokio::test]
    async fn test_missing_and_deleted() {
        let (_dir, storage) = open_storage();
        let meta = put(&storage, "gone.png", "abc").await;
        storage.index.delete(&meta.key, crate::DeleteMode::Soft).unwrap();

        let op = ReadBlobOperation::new(storage);
        assert!(matches!(
            op.run(request("gone.png")).await.unwrap(),
            ReadBlobOperationOutcome::Deleted
        ));
        assert!(matches!(
            op.run(request("never.png")).await.unwrap(),
            ReadBlobOperationOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn test_debug_detects_corrupt_content() {
        let (_dir, storage) = open_storage_with(StoreConfig {
            debug: true,
            ..StoreConfig::default()
        });
        let meta = put(&storage, "rot.png", "abcdef").await;
        std::fs::write(storage.content.content_path(&meta.key), b"abcxyz").unwrap();

        let err = ReadBlobOperation::new(storage)
            .run(request("rot.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::Internal(_)));
    }

    #[tokio::test]
    async fn test_open_handle_survives_overwrite() {
        let (_dir, storage) = open_storage();
        put(&storage, "swap.png", "first").await;

        let outcome = ReadBlobOperation::new(storage.clone())
            .run(request("swap.png"))
            .await
            .unwrap();
        put(&storage, "swap.png", "second version").await;

        let ReadBlobOperationOutcome::Found(result) = outcome else {
            panic!("expected blob to be found");
        };
        assert_eq!(read_body(result.body.unwrap()).await, b"first");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reads_during_overwrites_match_their_metadata() {
        let (_dir, storage) = open_storage();
        put(&storage, "busy.png", "v0").await;

        let writer = {
            let storage = storage.clone();
            tokio::spawn(async move {
                for i in 1..40 {
                    let content = format!("version {} {}", i, "x".repeat(i * 37));
                    put(&storage, "busy.png", &content).await;
                }
            })
        };

        let op = ReadBlobOperation::new(storage);
        let mut reads = 0;
        while reads == 0 || !writer.is_finished() {
            let ReadBlobOperationOutcome::Found(result) = op.run(request("busy.png")).await.unwrap()
            else {
                panic!("expected blob to be found");
            };
            let body = read_body(result.body.unwrap()).await;
            assert_eq!(body.len() as u64, result.meta.size_bytes);
            assert_eq!(compute_checksum(&body), result.meta.checksum);
            reads += 1;
        }
        writer.await.unwrap();
    }
}
