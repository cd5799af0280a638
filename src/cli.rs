use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// rootstrap - headless installation engine
#[derive(Parser, Debug)]
#[command(name = "rootstrap")]
#[command(about = "Partition, install, configure and make bootable a target system from a JSON configuration")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: record every command instead of executing it.
    ///
    /// The pipeline runs against a recording runner and the command
    /// transcript is printed at the end. Configuration files are still
    /// written under the target root, which defaults to a scratch directory.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an installation
    Install {
        /// Path to the installation configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Where the target system is mounted
        #[arg(long)]
        target_root: Option<PathBuf>,

        /// Seconds to wait for devices to settle before the disk wipe
        #[arg(long, default_value_t = 3)]
        settle_delay: u64,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
