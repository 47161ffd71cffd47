//! CLI command implementations.
//!
//! - `mask`: parse a CPU set against the topology and show its cluster maps
//! - `policy`: apply policy strings and print the resulting snapshots
//! - `run`: drive synthetic flows through a threaded runtime

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mcps_core::config::TopologyConfig;
use mcps_core::McpsConfig;

pub mod mask;
pub mod policy;
pub mod run;

/// mcpsctl - multi-core packet steering control
#[derive(Parser)]
#[command(name = "mcpsctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of possible CPUs, overriding the configuration
    #[arg(long, global = true)]
    pub cpus: Option<usize>,

    /// Output format
    #[arg(long, global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Parse a CPU set and show its cluster maps
    Mask(mask::MaskArgs),

    /// Apply policy strings and print the snapshots
    Policy(policy::PolicyArgs),

    /// Drive synthetic traffic through the engine
    Run(run::RunArgs),
}

/// Loads the configuration file if given, otherwise defaults.
///
/// `--cpus` without a file also picks a topology that fits.
pub fn load_config(path: Option<&Path>, cpus: Option<usize>) -> Result<McpsConfig> {
    let mut config = match path {
        Some(path) => McpsConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => cpus.map_or_else(McpsConfig::default, McpsConfig::with_cpus),
    };
    if let (Some(path), Some(cpus)) = (path, cpus) {
        if config.nr_cpus != cpus {
            tracing::debug!(path = %path.display(), cpus, "overriding nr_cpus");
            config.nr_cpus = cpus;
            if config.validate().is_err() {
                config.topology = TopologyConfig::for_cpus(cpus);
            }
        }
    }
    config.validate()?;
    Ok(config)
}
