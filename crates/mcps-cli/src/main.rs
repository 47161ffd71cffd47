//! mcpsctl - administrative CLI for the MCPS steering engine.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on debug flag
    let filter = if cli.debug {
        "mcps_core=debug,mcpsctl=debug"
    } else {
        "mcps_core=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = commands::load_config(cli.config.as_deref(), cli.cpus)?;
    match cli.command {
        Commands::Mask(args) => commands::mask::execute(args, &config, cli.format),
        Commands::Policy(args) => commands::policy::execute(args, config, cli.format),
        Commands::Run(args) => commands::run::execute(args, config, cli.format),
    }
}
