//! Vellum Core - storage and signing for a signed-URL blob service
//!
//! - HMAC-SHA256 path signatures with optional expiry
//! - SQLite metadata index held under an exclusive lock
//! - Staged, fsynced, rename-into-place content writes
//! - Per-key serialization of commits and reads

pub mod config;
pub mod error;
pub mod key;
pub mod operations;
pub mod signer;
pub mod storage;

pub use config::StoreConfig;
pub use error::{Result, VellumError};
pub use key::{BlobKey, STAGING_DIR};
pub use signer::{Signature, Signer, UNSAFE_TOKEN, Verification, secrets_match};
pub use storage::{
    BlobMetadata, ContentStore, DeleteMode, IndexCursor, KeyLocks, KeyReadGuard, KeyWriteGuard, MetadataIndex,
    Promotion, SealedWrite, StagedWrite, Storage, compute_checksum, compute_etag,
};
