//! Runtime settings
//!
//! Settings come from an optional TOML file and are then overridden by
//! command-line arguments (see [`crate::cli`]). Every field has a default, so
//! an empty file or no file at all yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::defaults;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// ACME directory URL
    pub directory_url: String,

    /// Contact address registered with a newly created ACME account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,

    pub account_key_file: PathBuf,

    /// When set, the account key lives in this SecureString parameter
    /// instead of `account_key_file`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_key_ssm: Option<String>,

    pub http_port: u16,
    pub https_port: u16,

    /// Target group the bootstrap forwarding rule points at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_group_arn: Option<String>,

    /// Function ARN used to locate the bootstrap target group when
    /// `target_group_arn` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_arn: Option<String>,

    /// Case-insensitive substrings of an issuer name that mark a certificate
    /// as coming from the ACME authority.
    pub issuer_markers: Vec<String>,

    pub probe_interval_ms: u64,
    pub probe_timeout_secs: u64,
    pub challenge_timeout_secs: u64,
    pub validation_interval_ms: u64,
    pub validation_timeout_secs: u64,
    pub order_timeout_secs: u64,
    pub invocation_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            directory_url: defaults::LETS_ENCRYPT_DIRECTORY.to_string(),
            contact_email: None,
            account_key_file: PathBuf::from(defaults::ACCOUNT_KEY_FILE),
            account_key_ssm: None,
            http_port: defaults::HTTP_PORT,
            https_port: defaults::HTTPS_PORT,
            target_group_arn: None,
            function_arn: None,
            issuer_markers: vec![defaults::ISSUER_MARKER.to_string()],
            probe_interval_ms: defaults::PROBE_INTERVAL.as_millis() as u64,
            probe_timeout_secs: defaults::PROBE_TIMEOUT.as_secs(),
            challenge_timeout_secs: defaults::CHALLENGE_TIMEOUT.as_secs(),
            validation_interval_ms: defaults::VALIDATION_INTERVAL.as_millis() as u64,
            validation_timeout_secs: defaults::VALIDATION_TIMEOUT.as_secs(),
            order_timeout_secs: defaults::ORDER_TIMEOUT.as_secs(),
            invocation_timeout_secs: defaults::INVOCATION_TIMEOUT.as_secs(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. Missing keys take their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        Self::parse(&content)
    }

    /// Load from `path` when given, else start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Check that every knob is usable and the timeouts nest.
    pub fn validate(&self) -> Result<()> {
        if self.directory_url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "directory_url cannot be empty".to_string(),
            ));
        }
        if self.issuer_markers.iter().all(|m| m.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "issuer_markers must contain at least one non-empty marker".to_string(),
            ));
        }
        if self.http_port == 0 || self.https_port == 0 {
            return Err(ConfigError::Validation(
                "listener ports must be non-zero".to_string(),
            ));
        }
        if self.probe_interval_ms == 0 || self.validation_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "polling intervals must be non-zero".to_string(),
            ));
        }
        if self.probe_timeout() >= self.challenge_timeout() {
            return Err(ConfigError::Validation(format!(
                "probe_timeout_secs ({}) must be shorter than challenge_timeout_secs ({})",
                self.probe_timeout_secs, self.challenge_timeout_secs
            )));
        }
        if self.challenge_timeout() >= self.invocation_timeout() {
            return Err(ConfigError::Validation(format!(
                "challenge_timeout_secs ({}) must be shorter than invocation_timeout_secs ({})",
                self.challenge_timeout_secs, self.invocation_timeout_secs
            )));
        }
        if self.validation_timeout() >= self.invocation_timeout() {
            return Err(ConfigError::Validation(format!(
                "validation_timeout_secs ({}) must be shorter than invocation_timeout_secs ({})",
                self.validation_timeout_secs, self.invocation_timeout_secs
            )));
        }
        // One issuance waits for the challenge, the order and then TLS.
        let issuance = self
            .challenge_timeout()
            .checked_add(self.order_timeout())
            .and_then(|d| d.checked_add(self.validation_timeout()));
        if issuance.is_none_or(|d| d >= self.invocation_timeout()) {
            return Err(ConfigError::Validation(format!(
                "challenge_timeout_secs + order_timeout_secs + validation_timeout_secs ({} + {} + {}) must be shorter than invocation_timeout_secs ({})",
                self.challenge_timeout_secs,
                self.order_timeout_secs,
                self.validation_timeout_secs,
                self.invocation_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn validation_interval(&self) -> Duration {
        Duration::from_millis(self.validation_interval_ms)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}
