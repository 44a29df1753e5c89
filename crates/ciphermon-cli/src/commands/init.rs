//! `ciphermon init` command implementation

use anyhow::{Context, Result};
use ciphermon_core::MonitorConfig;
use std::fs;
use std::path::PathBuf;

use super::CONFIG_FILE_NAME;

pub fn run(output: PathBuf, force: bool) -> Result<()> {
    fs::create_dir_all(&output)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let config_path = write_default_config(&output, force)?;

    println!("Created configuration at {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("   1. Generate a proof key: ciphermon keygen");
    println!("   2. Set crypto.proof_public_key_hex in the config");
    println!(
        "   3. Try the demo:        ciphermon --config {} simulate --input records.json --insecure-demo",
        config_path.display()
    );
    Ok(())
}

fn write_default_config(dir: &std::path::Path, force: bool) -> Result<PathBuf> {
    let config_path = dir.join(CONFIG_FILE_NAME);
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let config_json = serde_json::to_string_pretty(&MonitorConfig::default())?;
    fs::write(&config_path, config_json).context("Failed to write config file")?;
    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_default_config(dir.path(), false).unwrap();
        let loaded = MonitorConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, MonitorConfig::default());
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        write_default_config(dir.path(), false).unwrap();
        assert!(write_default_config(dir.path(), false).is_err());
        assert!(write_default_config(dir.path(), true).is_ok());
    }
}
