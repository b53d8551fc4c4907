//! Atelier: agent lifecycle and status synchronization
//!
//! Several coding agents work the same repository side by side, each in its own
//! worktree and branch, optionally inside a sandbox, each reachable through a
//! stable terminal session. Atelier creates and destroys those workspaces and
//! keeps every agent's observable state reconciled from the signal files its
//! hooks write.

pub mod agent;
pub mod cli;
pub mod command;
pub mod config;
pub mod context;
pub mod factory;
pub mod git;
pub mod isolation;
pub mod platform;
pub mod session;
pub mod state;
pub mod status;
pub mod tasks;
#[cfg(test)]
pub(crate) mod testing;
pub mod tracker;
pub mod watcher;
pub mod worktree;

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtelierError {
    #[error("Git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("`{command}` failed: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("Worktree error: {0}")]
    Worktree(String),

    #[error("Isolation error: {0}")]
    Isolation(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Cannot determine base branch: {0}")]
    BaseBranch(String),
}

impl AtelierError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AtelierError::Timeout { .. } => true,
            AtelierError::GitCommand { stderr, .. } => {
                let stderr = stderr.to_ascii_lowercase();
                TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m))
            }
            AtelierError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "index.lock",
    ".lock': file exists",
    "could not resolve host",
    "connection timed out",
    "connection reset",
    "could not read from remote repository",
    "early eof",
];

pub type Result<T> = std::result::Result<T, AtelierError>;
