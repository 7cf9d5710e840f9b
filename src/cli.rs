use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::DEFAULT_LOG_PATH;

/// archstage - An unattended Arch Linux installer
#[derive(Parser, Debug)]
#[command(name = "archstage")]
#[command(about = "Installs Arch Linux from a JSON config through ordered, checked phases")]
#[command(version)]
pub struct Cli {
    /// Install log file
    #[arg(long, global = true, default_value = DEFAULT_LOG_PATH)]
    pub log: PathBuf,

    /// Mirror log output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Dry-run mode: print the phase plan instead of executing anything.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the installation described by a configuration file
    Install {
        /// Path to the JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Where the installation context is persisted after each phase
        #[arg(long)]
        state: Option<PathBuf>,

        /// Skip a phase by name (repeatable; only skippable phases)
        #[arg(long = "skip", value_name = "PHASE")]
        skip: Vec<String>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// Unmount the target, close encrypted devices and stop stray processes
    Cleanup,
    /// Show the phases an install would run, without running them
    Plan {
        /// Path to the JSON configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
