//! Storage modules for Vellum
//!
//! Provides the metadata index, on-disk content, and per-key write ordering.

pub mod content_store;
pub mod key_locks;
pub mod metadata_index;

pub use content_store::{
    ContentStore, Promotion, SealedWrite, StagedWrite, compute_checksum,
};
pub use key_locks::{KeyLocks, KeyReadGuard, KeyWriteGuard};
pub use metadata_index::{BlobMetadata, DeleteMode, IndexCursor, MetadataIndex, compute_etag};

use crate::config::StoreConfig;
use crate::error::Result;
use std::sync::Arc;

/// Shared handles for the index, content and key locks. Built once per
/// process and cloned into every request.
#[derive(Clone)]
pub struct Storage {
    pub config: Arc<StoreConfig>,
    pub index: MetadataIndex,
    pub content: Arc<ContentStore>,
    pub locks: Arc<KeyLocks>,
}

impl Storage {
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let index = MetadataIndex::open(&config.index_dir)?;
        let content = ContentStore::new(config.upload_root.clone())?;
        Ok(Self {
            config: Arc::new(config),
            index,
            content: Arc::new(content),
            locks: Arc::new(KeyLocks::new()),
        })
    }

    pub fn delete_mode(&self) -> DeleteMode {
        if self.config.soft_delete {
            DeleteMode::Soft
        } else {
            DeleteMode::Hard
        }
    }
}
