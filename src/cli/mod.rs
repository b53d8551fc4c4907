//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Run coding agents side by side in isolated worktrees", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the repository (defaults to current directory)
    #[arg(short, long, global = true)]
    pub repo: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Prepare the repository for agents
    Init,

    /// Create agents, each with its own worktree and branch
    Spawn {
        /// Number of agents to create
        #[arg(default_value_t = 1)]
        count: usize,

        /// Isolation profile from the config (`none` runs on the host)
        #[arg(short, long)]
        isolation: Option<String>,

        /// Branch to fork from (defaults to the current branch)
        #[arg(short, long)]
        base: Option<String>,

        /// Task list file, relative to each worktree
        #[arg(short, long)]
        task_file: Option<PathBuf>,
    },

    /// List agents with their status, tasks and diff
    List,

    /// Remove an agent's worktree, branch and session
    Remove {
        /// Agent name or id
        agent: String,
    },

    /// Attach to an agent's terminal session
    Attach {
        /// Agent name or id
        agent: String,
    },

    /// Follow status changes until interrupted
    Watch,
}
