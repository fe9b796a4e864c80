// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use offspot_demo::toggle::Mode;

#[derive(Parser)]
#[command(name = "offspot-demo")]
#[command(about = "Deploy and refresh offspot hotspot images as public demos")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: /etc/offspot-demo/config.yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print final results
    #[arg(short, long, global = true, conflicts_with = "json")]
    pub quiet: bool,

    /// Print results as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Break the operation lock even if another run holds it
    #[arg(long, global = true)]
    pub force_lock: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download, mount and start the latest image of a deployment
    Deploy {
        /// Deployment identifier
        ident: String,

        /// Use the image already downloaded instead of fetching it again
        #[arg(long)]
        reuse_image: bool,

        /// Prepare the image even if it was prepared before
        #[arg(long)]
        force_prepare: bool,
    },

    /// Stop a deployment and remove its files
    Undeploy {
        /// Deployment identifier
        ident: String,

        /// Keep the downloaded image
        #[arg(long)]
        keep_image: bool,
    },

    /// Switch a deployment between maintenance and image mode
    Toggle {
        /// Deployment identifier
        ident: String,

        /// Mode to switch to
        #[arg(value_enum)]
        mode: ModeArg,
    },

    /// Rewrite the compose manifest of a mounted image
    Prepare {
        /// Deployment identifier
        ident: String,

        /// Prepare again even if already prepared
        #[arg(long)]
        force: bool,
    },

    /// Redeploy anything unhealthy or outdated, undeploy what is no longer listed
    Refresh,

    /// Show the state of every configured deployment
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Maint,
    Image,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Maint => Mode::Maintenance,
            ModeArg::Image => Mode::Image,
        }
    }
}
