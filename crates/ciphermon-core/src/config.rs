//! Configuration management for ciphermon.
//!
//! # Configuration Sources
//!
//! Configuration can be loaded from:
//! - Environment variables (prefixed with `CIPHERMON_`)
//! - JSON configuration files
//! - Programmatic defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use ciphermon_core::config::MonitorConfig;
//!
//! let config = MonitorConfig::builder()
//!     .request_ttl(Duration::from_secs(600))
//!     .open_registration(false)
//!     .build()?;
//! ```

use crate::scoring::ScoringPolicy;
use crate::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete ciphermon configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Decrypt-request lifecycle.
    pub oracle: OracleConfig,

    /// Score thresholds.
    pub scoring: ScoringPolicy,

    /// Ciphertext well-formedness bounds.
    pub ciphertext: CiphertextConfig,

    /// Authorization policy.
    pub access: AccessConfig,

    /// Proof key material.
    pub crypto: CryptoConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Create a new configuration builder.
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Looks for variables prefixed with `CIPHERMON_`:
    /// - `CIPHERMON_REQUEST_TTL_MS` - Pending request lifetime in ms (`0` disables expiry)
    /// - `CIPHERMON_MAX_PENDING_REQUESTS` - Upper bound on simultaneously pending requests
    /// - `CIPHERMON_OPEN_REGISTRATION` - Whether first submitters claim unowned models
    /// - `CIPHERMON_PROOF_KEY_HEX` - Hex-encoded ed25519 public key of the decryption service
    /// - `CIPHERMON_LOG_LEVEL` - Logging level (trace, debug, info, warn, error)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file. Missing sections fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MonitorError::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            MonitorError::ConfigError(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(ttl) = var("CIPHERMON_REQUEST_TTL_MS") {
            let ttl: u64 = ttl.parse().map_err(|e| {
                MonitorError::ConfigError(format!("Invalid CIPHERMON_REQUEST_TTL_MS: {e}"))
            })?;
            self.oracle.request_ttl_ms = (ttl > 0).then_some(ttl);
        }

        if let Some(max) = var("CIPHERMON_MAX_PENDING_REQUESTS") {
            self.oracle.max_pending_requests = max.parse().map_err(|e| {
                MonitorError::ConfigError(format!("Invalid CIPHERMON_MAX_PENDING_REQUESTS: {e}"))
            })?;
        }

        if let Some(open) = var("CIPHERMON_OPEN_REGISTRATION") {
            self.access.open_registration = open.parse().map_err(|e| {
                MonitorError::ConfigError(format!("Invalid CIPHERMON_OPEN_REGISTRATION: {e}"))
            })?;
        }

        if let Some(key) = var("CIPHERMON_PROOF_KEY_HEX") {
            self.crypto.proof_public_key_hex = Some(key);
        }

        if let Some(level) = var("CIPHERMON_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(ttl) = self.oracle.request_ttl_ms {
            if ttl < 1000 {
                return Err(MonitorError::ConfigError(
                    "request_ttl_ms must be at least 1000ms".into(),
                ));
            }
        }

        if self.oracle.max_pending_requests == 0 {
            return Err(MonitorError::ConfigError(
                "max_pending_requests must be greater than 0".into(),
            ));
        }

        if self.ciphertext.max_handle_bytes == 0 {
            return Err(MonitorError::ConfigError(
                "max_handle_bytes must be greater than 0".into(),
            ));
        }

        if let Some(ref key) = self.crypto.proof_public_key_hex {
            if key.len() != 64 || hex::decode(key).is_err() {
                return Err(MonitorError::ConfigError(
                    "proof_public_key_hex must be 64 hex characters (32 bytes)".into(),
                ));
            }
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(MonitorError::ConfigError(format!(
                    "unknown log level: {other}"
                )))
            }
        }

        self.scoring.validate()
    }
}

/// Decrypt-request lifecycle configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// How long a request may stay pending before it can be expired. `None` disables expiry.
    pub request_ttl_ms: Option<u64>,

    /// Maximum number of pending (or reserved) requests across all targets.
    pub max_pending_requests: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            request_ttl_ms: Some(86_400_000), // 24 hours
            max_pending_requests: 10_000,
        }
    }
}

/// Ciphertext well-formedness configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiphertextConfig {
    /// Maximum accepted byte length of a single handle.
    pub max_handle_bytes: usize,
}

impl Default for CiphertextConfig {
    fn default() -> Self {
        Self {
            max_handle_bytes: 64 * 1024,
        }
    }
}

/// Authorization policy configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Let the first submitter of an unowned model claim it.
    pub open_registration: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            open_registration: true,
        }
    }
}

/// Proof key configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Hex-encoded ed25519 public key (32 bytes = 64 hex chars) of the decryption service.
    pub proof_public_key_hex: Option<String>,
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// JSON output format.
    pub json_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json_output: false,
        }
    }
}

/// Builder for MonitorConfig.
#[derive(Default)]
pub struct MonitorConfigBuilder {
    config: MonitorConfig,
}

impl MonitorConfigBuilder {
    /// Set the pending request lifetime.
    pub fn request_ttl(mut self, ttl: Duration) -> Self {
        self.config.oracle.request_ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Keep pending requests forever.
    pub fn no_request_expiry(mut self) -> Self {
        self.config.oracle.request_ttl_ms = None;
        self
    }

    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.config.oracle.max_pending_requests = max;
        self
    }

    pub fn scoring(mut self, policy: ScoringPolicy) -> Self {
        self.config.scoring = policy;
        self
    }

    pub fn max_handle_bytes(mut self, max: usize) -> Self {
        self.config.ciphertext.max_handle_bytes = max;
        self
    }

    pub fn open_registration(mut self, open: bool) -> Self {
        self.config.access.open_registration = open;
        self
    }

    pub fn proof_public_key_hex(mut self, key: impl Into<String>) -> Self {
        self.config.crypto.proof_public_key_hex = Some(key.into());
        self
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Enable JSON log output.
    pub fn json_logs(mut self, enabled: bool) -> Self {
        self.config.logging.json_output = enabled;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<MonitorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
