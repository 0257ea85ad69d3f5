use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "reclaimd",
    about = "Keeps log and cache directories under quota by deleting the oldest files",
    version
)]
pub struct Cli {
    /// Configuration file (default: ~/.config/reclaimd/config.toml, then /etc/reclaimd/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run every configured job until SIGINT or SIGTERM (default)
    Run,

    /// Validate the configuration and show current usage per job, deleting nothing
    Check,
}
