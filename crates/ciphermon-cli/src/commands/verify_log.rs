//! `ciphermon verify-log` command implementation

use anyhow::{Context, Result};
use ciphermon_core::event_log::verify_chain;
use std::path::PathBuf;

pub fn run(path: PathBuf) -> Result<()> {
    let count = verify_chain(&path)
        .with_context(|| format!("Event log failed verification: {}", path.display()))?;
    println!("{}: {} records, chain intact", path.display(), count);
    Ok(())
}
