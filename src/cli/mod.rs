//! CLI interface module
//!
//! `clap` derive surface: `start` (run the orchestrator), `add <issue-id>`
//! (seed a task from the tracker), `status` (print queue/active/cost).
//! Terminal output formatting lives in `display`.

pub mod commands;
pub mod display;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "orca", version, about = "Orchestrates AI coding agents against a tracker-synced task backlog")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit machine-readable JSON instead of a human table, where supported.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator: sync, scheduler tick loop, monitors, API server.
    Start,
    /// Seed a task by fetching one issue from the tracker and upserting it.
    Add {
        /// The tracker's external issue identifier.
        issue_id: String,
    },
    /// Print queue depth, active invocation count, and rolling-window cost.
    Status,
}
