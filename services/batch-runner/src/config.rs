//! Configuration types and loading
//!
//! The file path comes from `--config`, then CONFIG_PATH, then
//! `keyrelay.toml`. Settings come from the TOML file with serde defaults for
//! omitted fields. The only environment overlay is the credential source's
//! service key: KEYRELAY_SOURCE_KEY, falling back to service_key_file. The key
//! never lives in the TOML itself.

use common::Secret;
use dispatch::RetryPolicy;
use key_pool::{CredentialSource, JsonFileSource, RestTableSource};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var holding the credential source's service key.
pub const SOURCE_KEY_ENV: &str = "KEYRELAY_SOURCE_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub credentials: CredentialsConfig,
    pub completion: CompletionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub status: Option<StatusConfig>,
}

/// Where credentials come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// PostgREST-style table over HTTP
    Rest,
    /// JSON array of rows on disk
    File,
}

/// Credential source settings
#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    /// Owner whose credential rows are loaded
    pub owner: String,
    pub source: SourceKind,
    /// Table name (rest) or file path (file)
    #[serde(default)]
    pub source_id: Option<String>,
    /// Table endpoint root, required for the rest source
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(skip)]
    pub service_key: Option<Secret<String>>,
    #[serde(default)]
    pub service_key_file: Option<PathBuf>,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
}

/// Completion endpoint settings
#[derive(Debug, Deserialize)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Work pool settings
#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            min_spacing_ms: default_min_spacing_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }
}

/// Optional status endpoint
#[derive(Debug, Deserialize)]
pub struct StatusConfig {
    pub listen_addr: SocketAddr,
}

fn default_timeout() -> u64 {
    60
}

fn default_source_timeout() -> u64 {
    30
}

fn default_concurrency() -> usize {
    4
}

fn default_min_spacing_ms() -> u64 {
    1000
}

fn require_http_url(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Service key resolution order:
    /// 1. KEYRELAY_SOURCE_KEY env var
    /// 2. service_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| common::Error::io(path, e))?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.credentials.owner.trim().is_empty() {
            return Err(common::Error::Config(
                "credentials.owner must not be empty".into(),
            ));
        }

        if config.credentials.source == SourceKind::Rest {
            let base_url = config.credentials.base_url.as_deref().ok_or_else(|| {
                common::Error::Config("credentials.base_url is required for the rest source".into())
            })?;
            require_http_url("credentials.base_url", base_url)?;
        }

        require_http_url("completion.endpoint", &config.completion.endpoint)?;

        if config.credentials.timeout_secs == 0 {
            return Err(common::Error::Config(
                "credentials.timeout_secs must be greater than 0".into(),
            ));
        }

        if config.completion.timeout_secs == 0 {
            return Err(common::Error::Config(
                "completion.timeout_secs must be greater than 0".into(),
            ));
        }

        if config.dispatch.concurrency == 0 {
            return Err(common::Error::Config(
                "dispatch.concurrency must be greater than 0".into(),
            ));
        }

        // Resolve service key: env var takes precedence over file
        if let Ok(key) = std::env::var(SOURCE_KEY_ENV) {
            config.credentials.service_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.credentials.service_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read service_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.credentials.service_key = Some(Secret::new(key));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("keyrelay.toml")
    }
}

impl CredentialsConfig {
    /// Build the configured credential source.
    ///
    /// A missing `source_id` is passed through; `CredentialPool::load`
    /// reports it as a configuration error.
    pub fn build_source(&self) -> common::Result<Box<dyn CredentialSource>> {
        let source: Box<dyn CredentialSource> = match self.source {
            SourceKind::Rest => {
                let client = reqwest::Client::builder()
                    .timeout(self.timeout())
                    .build()
                    .map_err(|e| {
                        common::Error::Config(format!("failed to build source HTTP client: {e}"))
                    })?;
                Box::new(RestTableSource::new(
                    client,
                    self.base_url.clone().unwrap_or_default(),
                    self.source_id.clone(),
                    self.service_key.clone(),
                ))
            }
            SourceKind::File => Box::new(JsonFileSource::new(
                self.source_id.clone().unwrap_or_default(),
            )),
        };
        Ok(source)
    }

    /// Per-request timeout for the rest source.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
