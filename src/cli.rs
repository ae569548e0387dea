//! CLI argument parsing for lockfleet.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "lockfleet",
    about = "Periodic workers contending for exclusive resource locks",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Override the random seed
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the fleet until Ctrl-C (default)
    Run,

    /// Validate the configuration and print resources and profiles
    Check,
}
