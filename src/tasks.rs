//! Agent task lists.
//!
//! Agents publish their todo list as JSON, either a bare array or wrapped in
//! `{"todos": [...]}`:
//!
//! ```json
//! [{"content": "Write parser", "status": "in_progress"}]
//! ```

use crate::config::ATELIER_DIR;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    #[serde(alias = "in-progress")]
    InProgress,
    #[serde(alias = "done")]
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub status: TaskStatus,
    #[serde(alias = "content")]
    pub text: String,
}

#[async_trait]
pub trait TaskReader: Send + Sync {
    /// Current task list. A missing list is empty, not an error.
    async fn read_tasks(&self, worktree: &Path, task_file: Option<&Path>) -> Result<Vec<Task>>;
}

/// Default task file inside a worktree.
pub fn default_task_file(worktree: &Path) -> PathBuf {
    worktree.join(ATELIER_DIR).join("todos.json")
}

/// Reads task lists from JSON files on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTaskReader;

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<Task>),
    Wrapped { todos: Vec<Task> },
}

pub fn parse_tasks(content: &str) -> Result<Vec<Task>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(match serde_json::from_str::<TaskFile>(content)? {
        TaskFile::List(tasks) => tasks,
        TaskFile::Wrapped { todos } => todos,
    })
}

#[async_trait]
impl TaskReader for FileTaskReader {
    async fn read_tasks(&self, worktree: &Path, task_file: Option<&Path>) -> Result<Vec<Task>> {
        let path = match task_file {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => worktree.join(p),
            None => default_task_file(worktree),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_tasks(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
