//! CLI Command Implementations

pub mod init;
pub mod keygen;
pub mod simulate;
pub mod verify_log;

use anyhow::{Context, Result};
use ciphermon_core::MonitorConfig;
use std::path::Path;

/// Default config file name written by `ciphermon init`.
pub const CONFIG_FILE_NAME: &str = "ciphermon.json";

/// Load config from file, or from `CIPHERMON_*` environment variables when no file is given.
pub fn load_config(path: Option<&Path>) -> Result<MonitorConfig> {
    match path {
        Some(path) => MonitorConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => MonitorConfig::from_env().context("Invalid CIPHERMON_* environment"),
    }
}

/// Accept only the output formats every command understands.
pub fn check_format(format: &str) -> Result<()> {
    match format {
        "human" | "json" => Ok(()),
        other => anyhow::bail!("Unknown format: {}. Use human or json.", other),
    }
}
