use std::fs;
use std::path::{Path, PathBuf};

use dimse::{ClientOptions, DimseError, RemoteNode};
use serde::Deserialize;
use thiserror::Error;

use crate::config::LoggingConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid client configuration: {0}")]
    Client(#[from] DimseError),

    #[error("Log file path must be set when log_to_file is enabled")]
    MissingLogFilePath,

    #[error("Remote {0} requires TLS but no [tls] section is configured")]
    MissingTls(String),
}

/// Courier configuration file
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientOptions,
    pub remote: RemoteNode,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle with the certificates to trust
    pub ca_bundle_path: PathBuf,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.client.validate()?;
        self.remote.validate()?;

        if self.logging.log_to_file && self.logging.log_file_path.trim().is_empty() {
            return Err(ConfigError::MissingLogFilePath);
        }
        if self.remote.use_tls && self.tls.is_none() {
            return Err(ConfigError::MissingTls(self.remote.ae_title.clone()));
        }
        Ok(())
    }
}
