// ABOUTME: Entry point for the offspot-demo CLI application.
// ABOUTME: Parses arguments, loads configuration and dispatches to command handlers.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use commands::Context;
use offspot_demo::config::Config;
use offspot_demo::deploy::DeployOptions;
use offspot_demo::error::Result;
use offspot_demo::output::{Output, OutputMode};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbose flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Normal
    };

    if let Err(e) = run(cli, mode).await {
        Output::new(mode).error(&e.to_string());
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli, mode: OutputMode) -> Result<()> {
    let config = Config::discover(cli.config.as_deref())?.with_env_overrides();
    let ctx = Context::new(config, Output::new(mode), cli.force_lock)?;

    match cli.command {
        Commands::Deploy {
            ident,
            reuse_image,
            force_prepare,
        } => {
            let options = DeployOptions {
                reuse_image,
                force_prepare,
            };
            commands::deploy(ctx, &ident, options).await
        }
        Commands::Undeploy { ident, keep_image } => {
            commands::undeploy(ctx, &ident, keep_image).await
        }
        Commands::Toggle { ident, mode } => commands::toggle(ctx, &ident, mode.into()).await,
        Commands::Prepare { ident, force } => commands::prepare(ctx, &ident, force).await,
        Commands::Refresh => commands::refresh(ctx).await,
        Commands::Status => commands::status(ctx).await,
    }
}
