//! Command-line interface definition

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use apexstore::Priority;

/// APEX - autonomous development daemon
#[derive(Debug, Parser)]
#[command(name = "apexd", version, about = "Drives AI-agent tasks through multi-stage workflows")]
pub struct Cli {
    /// Path to a config file (default: .apex.yml, then user config)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Project directory the daemon operates on
    #[arg(short, long, global = true, default_value = ".")]
    pub project: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon in the background
    Start,

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Run the daemon loop in the foreground (used by `start`)
    RunDaemon,

    /// Task operations
    #[command(subcommand)]
    Task(TaskCommand),
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// Create a new task
    Add {
        /// What the task should accomplish
        description: String,

        /// Workflow to run (default: feature)
        #[arg(short, long)]
        workflow: Option<String>,

        /// Queue priority
        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// Acceptance criteria for the task
        #[arg(long)]
        criteria: Option<String>,
    },

    /// List tasks
    List {
        /// Only tasks with this status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one task
    Show { task_id: String },

    /// Cancel a task
    Cancel { task_id: String },
}
