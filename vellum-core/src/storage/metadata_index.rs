use crate::error::{Result, VellumError};
use crate::key::BlobKey;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const INDEX_FILE: &str = "index.db";
const CURSOR_PAGE_SIZE: usize = 256;

/// Metadata record kept for every stored key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub key: BlobKey,
    pub content_type: String,
    pub size_bytes: u64,
    /// Base64 MD5 of the content, as sent in `Content-MD5`.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub etag: String,
}

impl BlobMetadata {
    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Quoted strong ETag derived from the checksum and modification time.
pub fn compute_etag(checksum: &str, modified_at: &DateTime<Utc>) -> String {
    let nanos = modified_at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| modified_at.timestamp_micros() * 1000);
    let digest = Sha256::digest(format!("{}:{}", checksum, nanos).as_bytes());
    format!("\"{}\"", &hex::encode(digest)[..32])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    Soft,
    Hard,
}

/// Durable ordered index of blob metadata, one row per key.
///
/// The SQLite database runs in WAL mode with an exclusive lock that is taken
/// at open and held until the last handle is dropped, so only one process can
/// own an index directory at a time.
#[derive(Clone)]
pub struct MetadataIndex {
    inner: Arc<IndexInner>,
}

struct IndexInner {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl MetadataIndex {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(INDEX_FILE);

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::ZERO)?;

        conn.execute_batch(
            "PRAGMA locking_mode = EXCLUSIVE;
             PRAGMA auto_vacuum = INCREMENTAL;",
        )
        .map_err(|e| lock_error(e, &path))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )
        .map_err(|e| lock_error(e, &path))?;

        // Writing inside an exclusive transaction takes the file lock, which
        // EXCLUSIVE locking mode then keeps until the connection closes.
        conn.execute_batch(
            "BEGIN EXCLUSIVE;
             CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY NOT NULL,
                content_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                etag TEXT NOT NULL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                deleted_at TEXT
             ) WITHOUT ROWID;
             CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
             );
             INSERT OR REPLACE INTO index_meta (key, value) VALUES ('opened_at', datetime('now'));
             COMMIT;",
        )
        .map_err(|e| lock_error(e, &path))?;

        tracing::info!("Opened metadata index at {}", path.display());

        Ok(Self {
            inner: Arc::new(IndexInner {
                path,
                conn: Mutex::new(conn),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .conn
            .lock()
            .map_err(|_| VellumError::Internal("metadata index mutex poisoned".to_string()))
    }

    /// Run blocking index work on the blocking thread pool.
    pub async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&MetadataIndex) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let index = self.clone();
        tokio::task::spawn_blocking(move || f(&index))
            .await
            .map_err(|e| VellumError::Internal(format!("index task failed: {}", e)))?
    }

    /// Insert or replace the record for `meta.key`.
    pub fn put(&self, meta: &BlobMetadata) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO blobs (
                key, content_type, size_bytes, checksum, etag, created_at, modified_at, deleted_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                checksum = excluded.checksum,
                etag = excluded.etag,
                created_at = excluded.created_at,
                modified_at = excluded.modified_at,
                deleted_at = excluded.deleted_at",
            params![
                meta.key.as_str(),
                meta.content_type,
                meta.size_bytes as i64,
                meta.checksum,
                meta.etag,
                meta.created_at.to_rfc3339(),
                meta.modified_at.to_rfc3339(),
                meta.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Live record for `key`; tombstoned records are reported as not found.
    pub fn get(&self, key: &BlobKey) -> Result<BlobMetadata> {
        match self.get_record(key)? {
            Some(meta) if !meta.is_tombstoned() => Ok(meta),
            _ => Err(VellumError::NotFound(key.to_string())),
        }
    }

    /// Record for `key` including tombstones.
    pub fn get_record(&self, key: &BlobKey) -> Result<Option<BlobMetadata>> {
        let conn = self.conn()?;
        let meta = conn
            .query_row(
                "SELECT key, content_type, size_bytes, checksum, etag, created_at, modified_at, deleted_at
                 FROM blobs WHERE key = ?1",
                [key.as_str()],
                row_to_meta,
            )
            .optional()?;
        Ok(meta)
    }

    /// Mark `key` deleted. Returns false when there was nothing live to delete.
    pub fn delete(&self, key: &BlobKey, mode: DeleteMode) -> Result<bool> {
        let conn = self.conn()?;
        let affected = match mode {
            DeleteMode::Soft => conn.execute(
                "UPDATE blobs SET deleted_at = ?1 WHERE key = ?2 AND deleted_at IS NULL",
                params![Utc::now().to_rfc3339(), key.as_str()],
            )?,
            DeleteMode::Hard => {
                conn.execute("DELETE FROM blobs WHERE key = ?1", [key.as_str()])?
            }
        };
        Ok(affected > 0)
    }

    /// Up to `limit` records with keys starting with `prefix`, strictly after
    /// `after`, in key order. Tombstones are included.
    pub fn list_page(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<BlobMetadata>> {
        let conn = self.conn()?;
        let lower = match after {
            Some(after) if after >= prefix => after,
            _ => prefix,
        };
        let inclusive = after.is_none_or(|after| after < prefix);

        let sql = if inclusive {
            "SELECT key, content_type, size_bytes, checksum, etag, created_at, modified_at, deleted_at
             FROM blobs WHERE key >= ?1 ORDER BY key LIMIT ?2"
        } else {
            "SELECT key, content_type, size_bytes, checksum, etag, created_at, modified_at, deleted_at
             FROM blobs WHERE key > ?1 ORDER BY key LIMIT ?2"
        };

        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![lower, limit as i64], row_to_meta)?;

        let mut page = Vec::new();
        for row in rows {
            let meta = row?;
            // Keys sharing a prefix are contiguous, so the first miss ends the scan.
            if !meta.key.as_str().starts_with(prefix) {
                break;
            }
            page.push(meta);
        }
        Ok(page)
    }

    /// Lazy ordered cursor over every record under `prefix`.
    pub fn list(&self, prefix: &str) -> IndexCursor {
        IndexCursor::new(self.clone(), prefix.to_string(), None)
    }

    /// Cursor resuming strictly after `after`.
    pub fn list_from(&self, prefix: &str, after: Option<String>) -> IndexCursor {
        IndexCursor::new(self.clone(), prefix.to_string(), after)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Fold the WAL back into the main file and release free pages.
    pub fn compact(&self) -> Result<()> {
        let conn = self.conn()?;
        let busy: i64 = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))?;
        if busy != 0 {
            tracing::warn!("WAL checkpoint of {} did not complete", self.inner.path.display());
        }
        conn.execute_batch("PRAGMA incremental_vacuum;")?;
        tracing::debug!("Compacted metadata index {}", self.inner.path.display());
        Ok(())
    }
}

/// Finite, restartable iterator over index records in key order.
///
/// Records are fetched a page at a time; `position` reports the last key
/// yielded so a new cursor can pick up from there.
pub struct IndexCursor {
    index: MetadataIndex,
    prefix: String,
    after: Option<String>,
    buffer: std::vec::IntoIter<BlobMetadata>,
    exhausted: bool,
}

impl IndexCursor {
    fn new(index: MetadataIndex, prefix: String, after: Option<String>) -> Self {
        Self {
            index,
            prefix,
            after,
            buffer: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    pub fn position(&self) -> Option<&str> {
        self.after.as_deref()
    }

    fn refill(&mut self) -> Result<()> {
        let page = self
            .index
            .list_page(&self.prefix, self.after.as_deref(), CURSOR_PAGE_SIZE)?;
        if page.len() < CURSOR_PAGE_SIZE {
            self.exhausted = true;
        }
        self.buffer = page.into_iter();
        Ok(())
    }
}

impl Iterator for IndexCursor {
    type Item = Result<BlobMetadata>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(meta) = self.buffer.next() {
                self.after = Some(meta.key.to_string());
                return Some(Ok(meta));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

fn row_to_meta(row: &Row<'_>) -> rusqlite::Result<BlobMetadata> {
    let key: String = row.get(0)?;
    let size_bytes: i64 = row.get(2)?;
    let created_at: String = row.get(5)?;
    let modified_at: String = row.get(6)?;
    let deleted_at: Option<String> = row.get(7)?;

    Ok(BlobMetadata {
        key: BlobKey::parse(&key).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        content_type: row.get(1)?,
        size_bytes: size_bytes as u64,
        checksum: row.get(3)?,
        etag: row.get(4)?,
        created_at: parse_timestamp(5, &created_at)?,
        modified_at: parse_timestamp(6, &modified_at)?,
        deleted_at: deleted_at.map(|t| parse_timestamp(7, &t)).transpose()?,
    })
}

fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn lock_error(error: rusqlite::Error, path: &Path) -> VellumError {
    match error.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            VellumError::LockContention(path.display().to_string())
        }
        _ => VellumError::Index(error),
    }
}
