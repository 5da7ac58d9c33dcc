use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use vellum_core::{Result, Signer, StoreConfig, VellumError};

const ENV_PREFIX: &str = "VELLUM";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reads of individual blobs skip the access guard.
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub signature_secret: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub storage: StoreConfig,
    #[serde(default)]
    pub serve: ServeConfig,
}

/// Image-transformation collaborator behind `/serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(default)]
    pub upstream_url: Option<String>,
    #[serde(default = "default_serve_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            upstream_url: None,
            timeout_secs: default_serve_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    512
}

fn default_serve_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load from an optional file, then apply `VELLUM__*` environment
    /// overrides (`VELLUM__STORAGE__SOFT_DELETE=false`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("storage.allowed_mime_types"),
            )
            .build()
            .map_err(|e| VellumError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| VellumError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.is_development()
            && self
                .signature_secret
                .as_deref()
                .is_none_or(|secret| secret.trim().is_empty())
        {
            return Err(VellumError::Config(
                "signature_secret is required outside development".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(VellumError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(VellumError::Config(
                "max_concurrency must be greater than zero".to_string(),
            ));
        }
        if let Some(upstream) = &self.serve.upstream_url {
            reqwest::Url::parse(upstream).map_err(|e| {
                VellumError::Config(format!("serve.upstream_url {:?} is invalid: {}", upstream, e))
            })?;
        }
        self.storage.validate()
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let host = self.host.trim_matches(|c| c == '[' || c == ']');
        format!("{}:{}", host, self.port)
            .parse()
            .or_else(|_| format!("[{}]:{}", host, self.port).parse())
            .map_err(|e| VellumError::Config(format!("invalid listen address {}: {}", self.host, e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Storage options with `debug` following the environment.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            debug: self.is_development(),
            ..self.storage.clone()
        }
    }

    pub fn signer(&self) -> Signer {
        Signer::new(self.signature_secret.as_deref().unwrap_or_default())
            .allow_unsafe(self.is_development())
    }

    /// Configured API key, ignoring blank values.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|key| !key.trim().is_empty())
    }
}
