//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - init: create the task database
//! - queue/execute/reschedule: run one heartbeat window
//! - task-execute: the worker entry point spawned by the execute heartbeat

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Prism - a database-coordinated task scheduler
#[derive(Parser, Debug)]
#[command(name = "prism")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the task database and schema
    Init,

    /// Run the queue heartbeat for one run window
    Queue,

    /// Run the execute heartbeat for one run window
    Execute,

    /// Run the reschedule heartbeat for one run window
    Reschedule,

    /// Worker entry point: run a single task row to its terminal state
    TaskExecute {
        /// Task row id
        #[arg(long)]
        id: i64,

        /// Task class name
        #[arg(long)]
        class: String,

        /// Range token this worker covers
        #[arg(long, default_value = "")]
        range: String,

        /// Execution timeout in seconds
        #[arg(long)]
        timeout: i64,

        /// Cooldown in seconds after the timeout
        #[arg(long)]
        cooldown: i64,
    },
}
