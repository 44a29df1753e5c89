//! ciphermon CLI
//!
//! Command-line interface for configuring and exercising the encrypted model monitor.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// ciphermon: private model-performance monitoring over encrypted records
///
/// Inference records are submitted as ciphertexts; only authorized, proof-checked reveals
/// ever turn them into alert levels.
#[derive(Parser)]
#[command(name = "ciphermon")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true, env = "CIPHERMON_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output directory for config
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Generate a decryption-proof signing key
    Keygen {
        /// Output format (json, human)
        #[arg(short, long, default_value = "human")]
        format: String,
    },

    /// Run demo records through the monitor with the local simulator
    Simulate {
        /// Records file (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Output format (json, human)
        #[arg(short, long, default_value = "human")]
        format: String,

        /// Append events to a hash-chained JSONL audit log
        #[arg(long)]
        event_log: Option<PathBuf>,

        /// Hex seed for the simulator's proof-signing key (random if omitted)
        #[arg(long, env = "CIPHERMON_SIGNING_SEED")]
        signing_seed: Option<String>,

        /// Allow insecure demo behavior.
        ///
        /// Required because the local simulator performs no encryption at all.
        #[arg(long, default_value_t = false)]
        insecure_demo: bool,
    },

    /// Verify the hash chain of an audit log
    VerifyLog {
        /// Event log file (JSONL)
        #[arg(short, long)]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if config.logging.json_output {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Init { output, force } => commands::init::run(output, force),
        Commands::Keygen { format } => commands::keygen::run(format),
        Commands::Simulate {
            input,
            format,
            event_log,
            signing_seed,
            insecure_demo,
        } => commands::simulate::run(
            input,
            format,
            event_log,
            signing_seed,
            insecure_demo,
            config,
        ),
        Commands::VerifyLog { path } => commands::verify_log::run(path),
    }
}
