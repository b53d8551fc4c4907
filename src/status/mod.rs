//! Signal file parsing
//!
//! Hooks running inside an agent's session write its current activity to
//! `<worktree>/.atelier/status/<session-id>`. The file holds either a bare
//! status token or a JSON tool-approval payload:
//!
//! ```text
//! working
//! {"tool_name": "Bash", "tool_input": {"command": "cargo publish"}}
//! ```
//!
//! The modification time travels with the parsed value so the tracker can
//! discard signals written before the user's last interaction.

use crate::config::ATELIER_DIR;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Observable activity of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    WaitingInput,
    WaitingApproval,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::WaitingInput => "waiting-input",
            AgentStatus::WaitingApproval => "waiting-approval",
        }
    }

    /// Parse a status token; `_` and `-` are interchangeable.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "idle" => Some(AgentStatus::Idle),
            "working" => Some(AgentStatus::Working),
            "waiting-input" => Some(AgentStatus::WaitingInput),
            "waiting-approval" => Some(AgentStatus::WaitingApproval),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Indicator shown next to an agent. Idle agents differ by whether a
/// terminal session is still alive.
pub fn status_icon(status: AgentStatus, has_session: bool) -> &'static str {
    match status {
        AgentStatus::Working => "●",
        AgentStatus::WaitingInput => "?",
        AgentStatus::WaitingApproval => "!",
        AgentStatus::Idle if has_session => "○",
        AgentStatus::Idle => "·",
    }
}

/// Result of reading one signal file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatus {
    pub status: AgentStatus,
    /// Set only for [`AgentStatus::WaitingApproval`].
    pub pending_approval: Option<String>,
    pub modified: DateTime<Utc>,
}

pub fn status_dir(worktree: &Path) -> PathBuf {
    worktree.join(ATELIER_DIR).join("status")
}

pub fn signal_path(worktree: &Path, session_id: &str) -> PathBuf {
    status_dir(worktree).join(session_id)
}

#[derive(Deserialize)]
struct ToolPayload {
    #[serde(alias = "tool")]
    tool_name: String,
    #[serde(default, alias = "input")]
    tool_input: Value,
}

/// Decode signal file content. Unrecognised content yields `None`.
pub fn parse_signal(content: &str) -> Option<(AgentStatus, Option<String>)> {
    let content = content.trim();
    if content.is_empty() {
        return None;
    }
    if content.starts_with('{') {
        let payload: ToolPayload = serde_json::from_str(content).ok()?;
        let description = describe_tool(&payload.tool_name, &payload.tool_input);
        return Some((AgentStatus::WaitingApproval, Some(description)));
    }
    let status = AgentStatus::from_token(content.lines().next()?)?;
    Some((status, None))
}

/// `"<tool>: <summary>"` for a pending tool call.
pub fn describe_tool(tool: &str, input: &Value) -> String {
    const KEYS: &[&str] = &["command", "file_path", "path", "url", "pattern"];
    let summary = KEYS
        .iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .or_else(|| match input {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        });
    match summary {
        Some(summary) if !summary.is_empty() => format!("{}: {}", tool, summary),
        _ => tool.to_string(),
    }
}

/// Read a single signal file. A missing file is `Ok(None)`.
pub async fn read_signal(path: &Path) -> Result<Option<ParsedStatus>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let Some((status, pending_approval)) = parse_signal(&content) else {
        tracing::debug!("unrecognised signal in {}", path.display());
        return Ok(None);
    };
    Ok(Some(ParsedStatus {
        status,
        pending_approval,
        modified: DateTime::<Utc>::from(metadata.modified()?),
    }))
}

/// Parse the most recently modified signal file under `worktree`.
pub async fn read_latest(worktree: &Path) -> Result<Option<ParsedStatus>> {
    let dir = status_dir(worktree);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }

    match newest {
        Some((_, path)) => read_signal(&path).await,
        None => Ok(None),
    }
}
