use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error; all variants are fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Shared client/server configuration, loaded from a JSON file.
///
/// `sni` is part of the schema and validated when `tls` is enabled, but the
/// transport currently derives SNI from `host`; the field is carried for
/// forward compatibility.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub addresses: Vec<String>,
    pub host: String,
    pub tls: bool,
    pub sni: String,
    pub port: u16,
    pub proxy_port: u16,
    pub secret: String,
}

// Older config files spell the address list "addressess"; both spellings are
// accepted on load (the legacy one wins when both appear, matching the
// deployed decoder), and only the canonical key is emitted on save.
impl<'de> Deserialize<'de> for Config {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            addressess: Vec<String>,
            #[serde(default)]
            addresses: Vec<String>,
            #[serde(default)]
            host: String,
            #[serde(default)]
            tls: bool,
            #[serde(default)]
            sni: String,
            #[serde(default)]
            port: u16,
            #[serde(default)]
            proxy_port: u16,
            #[serde(default)]
            secret: String,
        }

        let raw = Raw::deserialize(deserializer)?;
        let addresses = if !raw.addressess.is_empty() {
            raw.addressess
        } else {
            raw.addresses
        };

        Ok(Config {
            addresses,
            host: raw.host,
            tls: raw.tls,
            sni: raw.sni,
            port: raw.port,
            proxy_port: raw.proxy_port,
            secret: raw.secret,
        })
    }
}

impl Config {
    /// Load a configuration file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let cfg = serde_json::from_reader(BufReader::new(file))?;
        Ok(cfg)
    }

    fn validate_common(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid("secret must not be empty".into()));
        }
        Ok(())
    }

    /// Validate the fields the client depends on.
    pub fn validate_client(&self) -> Result<(), ConfigError> {
        self.validate_common()?;
        if self.addresses.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one server address is required".into(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be in 1..=65535".into()));
        }
        if self.proxy_port == 0 {
            return Err(ConfigError::Invalid(
                "proxy_port must be in 1..=65535".into(),
            ));
        }
        if self.tls && self.sni.is_empty() {
            return Err(ConfigError::Invalid(
                "sni is required when tls is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Validate the fields the server depends on.
    ///
    /// A zero port is allowed here; the server binary falls back to 8080.
    pub fn validate_server(&self) -> Result<(), ConfigError> {
        self.validate_common()
    }
}
