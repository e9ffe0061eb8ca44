//! Service configuration file
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3000
//!
//! [sandbox]
//! timeout_ms = 5000
//! fs_root = "${HOME}/sandcell-files"
//!
//! [sandbox.http]
//! allowed_hosts = ["api.example.com", "*.example.org"]
//! ```
//!
//! `${VAR}` references are expanded from the environment before parsing.

use sandcell_sandbox::SandboxConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Executions allowed to run at once
    pub max_concurrent: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_concurrent: 16,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to expand environment variables: {0}")]
    Expand(#[from] shellexpand::LookupError<std::env::VarError>),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load configuration from a TOML file, expanding `${ENV_VAR}` references
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "server.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
