//! CLI argument parsing for the tagpin inspector

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tagpin")]
#[command(author, version, about = "Inspect per-workflow container-image digest pins", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Store directory (overrides config)
    #[arg(short, long)]
    pub store_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show a workflow's pinned digests as a restart would see them
    Pins {
        /// Workflow ID
        #[arg(required = true)]
        workflow_id: String,
    },

    /// Verify stored rows would rehydrate; reports rows that would make a
    /// restart fail
    Check {
        /// Limit to one workflow (default: all rows)
        workflow_id: Option<String>,
    },

    /// List workflow IDs present in the store
    Workflows,
}
