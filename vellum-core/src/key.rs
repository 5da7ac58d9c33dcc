use crate::error::{Result, VellumError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Directory under the upload root that holds in-flight staged writes.
pub const STAGING_DIR: &str = ".vellum-staging";

/// Path-like identifier of a stored blob, relative to the upload root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobKey(String);

impl BlobKey {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(VellumError::InvalidKey("blob key cannot be empty".to_string()));
        }

        for component in trimmed.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(VellumError::InvalidKey(format!(
                    "invalid blob key component: {:?}",
                    component
                )));
            }
            if component.contains('\0') || component.contains('\\') {
                return Err(VellumError::InvalidKey(format!(
                    "blob key component contains a reserved character: {:?}",
                    component
                )));
            }
        }

        if trimmed == STAGING_DIR || trimmed.starts_with(&format!("{}/", STAGING_DIR)) {
            return Err(VellumError::InvalidKey(format!(
                "{} is reserved",
                STAGING_DIR
            )));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Derive a key from a decoded request path by stripping `base_path`.
    pub fn from_request_path(path: &str, base_path: &str) -> Result<Self> {
        let base = base_path.trim_end_matches('/');
        let rest = path.strip_prefix(base).ok_or_else(|| {
            VellumError::InvalidKey(format!("path {} is outside {}", path, base_path))
        })?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return Err(VellumError::InvalidKey(format!(
                "path {} is outside {}",
                path, base_path
            )));
        }
        Self::parse(rest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component, used for content disposition.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BlobKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BlobKey {
    type Error = VellumError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BlobKey> for String {
    fn from(key: BlobKey) -> Self {
        key.0
    }
}
