//! Agent data model
//!
//! An [`Agent`] is the in-memory view owned by whoever hosts the engine. Its
//! durable subset, [`PersistedAgent`], is written next to the worktree so an
//! agent's identity survives restarts without any central store.

use crate::isolation::RuntimeHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use crate::git::DiffStats;
pub use crate::status::AgentStatus;
pub use crate::tasks::{Task, TaskStatus};

/// Agent names, handed out in order.
pub const NAME_POOL: &[&str] = &[
    "dou",
    "flinck",
    "bol",
    "maes",
    "fabritius",
    "hoogstraten",
    "eeckhout",
    "victors",
    "koninck",
    "drost",
    "gelder",
    "backer",
    "renesse",
    "ovens",
    "lievens",
    "furnerius",
];

/// Agent handle shared between the host and the status tracker.
pub type SharedAgent = Arc<Mutex<Agent>>;

/// Durable identity of an agent, stored in its worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedAgent {
    pub id: u32,
    pub name: String,
    pub session_id: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub repo_path: PathBuf,
    #[serde(default)]
    pub task_file: Option<PathBuf>,
    #[serde(default = "default_isolation")]
    pub isolation: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_isolation() -> String {
    crate::config::NO_ISOLATION.to_string()
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: u32,
    pub name: String,
    /// Generated once, never reused; survives renames.
    pub session_id: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub repo_path: PathBuf,
    pub base_branch: Option<String>,
    pub task_file: Option<PathBuf>,
    pub status: AgentStatus,
    /// Present only while [`AgentStatus::WaitingApproval`].
    pub pending_approval: Option<String>,
    pub last_interaction: DateTime<Utc>,
    pub diff: DiffStats,
    pub tasks: Vec<Task>,
    pub isolation: String,
    pub runtime: Option<RuntimeHandle>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Rebuild an agent from its stored identity.
    ///
    /// The last interaction is the epoch so that any signal already on disk
    /// is applied on the first poll.
    pub fn from_persisted(p: PersistedAgent) -> Self {
        Self {
            id: p.id,
            name: p.name,
            session_id: p.session_id,
            branch: p.branch,
            worktree_path: p.worktree_path,
            repo_path: p.repo_path,
            base_branch: p.base_branch,
            task_file: p.task_file,
            status: AgentStatus::Idle,
            pending_approval: None,
            last_interaction: DateTime::<Utc>::UNIX_EPOCH,
            diff: DiffStats::default(),
            tasks: Vec::new(),
            isolation: p.isolation,
            runtime: None,
            created_at: p.created_at,
        }
    }

    pub fn persisted(&self) -> PersistedAgent {
        PersistedAgent {
            id: self.id,
            name: self.name.clone(),
            session_id: self.session_id.clone(),
            branch: self.branch.clone(),
            worktree_path: self.worktree_path.clone(),
            repo_path: self.repo_path.clone(),
            task_file: self.task_file.clone(),
            isolation: self.isolation.clone(),
            base_branch: self.base_branch.clone(),
            created_at: self.created_at,
        }
    }

    /// A local user action (approve, respond, interrupt) changed the status.
    ///
    /// Signals written before this moment are ignored from now on.
    pub fn record_interaction(&mut self, status: AgentStatus) {
        self.status = status;
        if status != AgentStatus::WaitingApproval {
            self.pending_approval = None;
        }
        self.last_interaction = Utc::now();
    }

    pub fn shared(self) -> SharedAgent {
        Arc::new(Mutex::new(self))
    }
}

/// Smallest id >= 1 not in `used`.
pub fn smallest_unused_id(used: &BTreeSet<u32>) -> u32 {
    (1..).find(|id| !used.contains(id)).unwrap_or(u32::MAX)
}

/// Fresh opaque session identifier (128 random bits, hex).
pub fn generate_session_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted() -> PersistedAgent {
        PersistedAgent {
            id: 2,
            name: "flinck".into(),
            session_id: generate_session_id(),
            branch: "atelier/flinck".into(),
            worktree_path: "/repo/.atelier/worktrees/atelier-flinck".into(),
            repo_path: "/repo".into(),
            task_file: None,
            isolation: "none".into(),
            base_branch: Some("main".into()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn id_allocation_fills_gaps() {
        assert_eq!(smallest_unused_id(&BTreeSet::new()), 1);
        assert_eq!(smallest_unused_id(&BTreeSet::from([1, 2, 3])), 4);
        assert_eq!(smallest_unused_id(&BTreeSet::from([1, 3])), 2);
        assert_eq!(smallest_unused_id(&BTreeSet::from([2, 3])), 1);
    }

    #[test]
    fn session_ids_are_unique_hex() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn persisted_round_trip_keeps_identity() {
        let p = persisted();
        let agent = Agent::from_persisted(p.clone());
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.last_interaction, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(agent.persisted(), p);
    }

    #[test]
    fn old_metadata_without_optional_fields_loads() {
        let json = r#"{"id":1,"name":"dou","session_id":"abc","branch":"atelier/dou",
            "worktree_path":"/w","repo_path":"/r"}"#;
        let p: PersistedAgent = serde_json::from_str(json).unwrap();
        assert_eq!(p.isolation, "none");
        assert_eq!(p.base_branch, None);
    }

    #[test]
    fn interaction_clears_pending_approval() {
        let mut agent = Agent::from_persisted(persisted());
        agent.status = AgentStatus::WaitingApproval;
        agent.pending_approval = Some("Bash: ls".into());
        let before = agent.last_interaction;

        agent.record_interaction(AgentStatus::Working);
        assert_eq!(agent.status, AgentStatus::Working);
        assert_eq!(agent.pending_approval, None);
        assert!(agent.last_interaction > before);
    }
}
