use crate::error::{Result, VellumError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage options consumed by the core. Loading is up to the embedding binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,
    #[serde(default = "default_soft_delete")]
    pub soft_delete: bool,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,
    #[serde(default)]
    pub debug: bool,
}

fn default_base_path() -> String {
    "/blob".to_string()
}

fn default_upload_root() -> PathBuf {
    PathBuf::from("data/uploads")
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("data/index")
}

fn default_soft_delete() -> bool {
    true
}

fn default_max_upload_size() -> u64 {
    10 * 1024 * 1024
}

fn default_allowed_mime_types() -> Vec<String> {
    vec!["image/".to_string()]
}

fn default_compaction_interval_secs() -> u64 {
    3600
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            upload_root: default_upload_root(),
            index_dir: default_index_dir(),
            soft_delete: default_soft_delete(),
            max_upload_size: default_max_upload_size(),
            allowed_mime_types: default_allowed_mime_types(),
            compaction_interval_secs: default_compaction_interval_secs(),
            debug: false,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.base_path.starts_with('/') || self.base_path.trim_end_matches('/').is_empty() {
            return Err(VellumError::Config(format!(
                "storage.base_path must be a non-root path starting with '/': {}",
                self.base_path
            )));
        }
        if self.max_upload_size == 0 {
            return Err(VellumError::Config(
                "storage.max_upload_size must be greater than zero".to_string(),
            ));
        }
        if self.upload_root == self.index_dir {
            return Err(VellumError::Config(
                "storage.upload_root and storage.index_dir must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `content_type` matches the allow-list. An empty list allows everything.
    pub fn mime_allowed(&self, content_type: &str) -> bool {
        if self.allowed_mime_types.is_empty() {
            return true;
        }
        let content_type = content_type.trim().to_ascii_lowercase();
        self.allowed_mime_types
            .iter()
            .any(|prefix| content_type.starts_with(&prefix.trim().to_ascii_lowercase()))
    }
}
