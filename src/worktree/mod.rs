//! Git worktree management
//!
//! Each agent gets a worktree at `<worktree_dir>/<prefix>-<name>` on branch
//! `<prefix>/<name>`. A metadata file inside the worktree records the agent's
//! identity; scanning for those files is how agents are recovered after a
//! restart.

use crate::agent::PersistedAgent;
use crate::config::{ATELIER_DIR, EngineConfig};
use crate::git::{same_path, GitOps};
use crate::status;
use crate::{AtelierError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const METADATA_FILE: &str = "agent.json";

/// Manages git worktrees for agent isolation
pub struct WorktreeManager {
    git: Arc<GitOps>,
    worktree_dir: PathBuf,
    prefix: String,
    /// Serializes metadata writes.
    metadata_lock: Mutex<()>,
}

impl WorktreeManager {
    pub fn new(git: Arc<GitOps>, config: &EngineConfig) -> Self {
        Self {
            git,
            worktree_dir: config.worktree_dir.clone(),
            prefix: config.branch_prefix.clone(),
            metadata_lock: Mutex::new(()),
        }
    }

    pub fn git(&self) -> &Arc<GitOps> {
        &self.git
    }

    /// Folder name for an agent: `<prefix>-<name>`.
    pub fn folder_name(&self, name: &str) -> String {
        format!("{}-{}", self.prefix, name)
    }

    /// Branch name for an agent: `<prefix>/<name>`.
    pub fn branch_name(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    pub fn worktree_root(&self, repo: &Path) -> PathBuf {
        if self.worktree_dir.is_absolute() {
            self.worktree_dir.clone()
        } else {
            repo.join(&self.worktree_dir)
        }
    }

    /// Where the worktree for `name` lives. Pure.
    pub fn worktree_path(&self, repo: &Path, name: &str) -> PathBuf {
        self.worktree_root(repo).join(self.folder_name(name))
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    /// Create the worktree directory and keep our files out of `git status`.
    pub fn ensure_layout(&self, repo: &Path) -> Result<()> {
        std::fs::create_dir_all(self.worktree_root(repo))?;

        let git_repo = git2::Repository::open(repo)?;
        let exclude = git_repo.path().join("info").join("exclude");
        let pattern = format!("/{}/", ATELIER_DIR);
        let current = std::fs::read_to_string(&exclude).unwrap_or_default();
        if !current.lines().any(|l| l.trim() == pattern) {
            if let Some(parent) = exclude.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut updated = current;
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str(&pattern);
            updated.push('\n');
            std::fs::write(&exclude, updated)?;
        }
        Ok(())
    }

    /// Create `branch` from `base_branch` checked out at `path`.
    ///
    /// Fails if `path` already exists.
    pub async fn create(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<()> {
        if path.exists() {
            return Err(AtelierError::Worktree(format!(
                "{} already exists",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.git.add_worktree(repo, path, branch, base_branch).await?;
        tokio::fs::create_dir_all(status::status_dir(path)).await?;

        tracing::info!(
            "created worktree {} on {} from {}",
            path.display(),
            branch,
            base_branch
        );
        Ok(())
    }

    /// Remove the worktree at `path` and delete `branch`.
    ///
    /// Anything already gone is fine, so repeated cleanup is safe.
    pub async fn remove(&self, repo: &Path, path: &Path, branch: &str) -> Result<()> {
        let registered = match self.git.list_worktrees(repo).await {
            Ok(entries) => entries.iter().any(|e| same_path(&e.path, path)),
            Err(e) => {
                tracing::debug!("cannot list worktrees: {}", e);
                true
            }
        };
        if registered {
            if let Err(e) = self.git.remove_worktree(repo, path).await {
                tracing::warn!(
                    "git could not remove {}: {}; removing directory",
                    path.display(),
                    e
                );
            }
        } else {
            tracing::debug!("worktree {} already gone", path.display());
        }

        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }

        if let Err(e) = self.git.prune_worktrees(repo).await {
            tracing::warn!("worktree prune failed: {}", e);
        }

        if self.git.branch_exists(repo, branch).await? {
            self.git.delete_branch(repo, branch).await?;
        } else {
            tracing::debug!("branch {} already gone", branch);
        }

        tracing::info!("removed worktree {} and branch {}", path.display(), branch);
        Ok(())
    }

    pub fn metadata_path(worktree: &Path) -> PathBuf {
        worktree.join(ATELIER_DIR).join(METADATA_FILE)
    }

    /// Write the agent's metadata file, replacing it whole.
    pub async fn save_metadata(&self, agent: &PersistedAgent) -> Result<()> {
        let path = Self::metadata_path(&agent.worktree_path);
        let json = serde_json::to_vec_pretty(agent)?;

        let _guard = self.metadata_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Read a worktree's metadata. Missing or corrupt metadata is `None`.
    pub async fn load_metadata(worktree: &Path) -> Option<PersistedAgent> {
        let path = Self::metadata_path(worktree);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!("cannot read {}: {}", path.display(), e);
                }
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(agent) => Some(agent),
            Err(e) => {
                tracing::warn!("ignoring corrupt metadata {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Every agent of `repo` with valid metadata, ordered by id.
    pub async fn scan_for_agents(&self, repo: &Path) -> Result<Vec<PersistedAgent>> {
        let root = self.worktree_root(repo);
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let folder_prefix = format!("{}-", self.prefix);
        let mut agents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&folder_prefix) || !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(agent) = Self::load_metadata(&entry.path()).await else {
                continue;
            };
            if !same_path(&agent.repo_path, repo) {
                continue;
            }
            agents.push(agent);
        }

        agents.sort_by_key(|a| a.id);
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::generate_session_id;
    use crate::command::ProcessRunner;
    use crate::git::GitConfig;
    use crate::testing::init_repo;
    use chrono::Utc;

    fn manager() -> WorktreeManager {
        let git = GitOps::new(Arc::new(ProcessRunner::new()), GitConfig::default());
        WorktreeManager::new(Arc::new(git), &EngineConfig::default())
    }

    fn persisted(m: &WorktreeManager, repo: &Path, id: u32, name: &str) -> PersistedAgent {
        PersistedAgent {
            id,
            name: name.to_string(),
            session_id: generate_session_id(),
            branch: m.branch_name(name),
            worktree_path: m.worktree_path(repo, name),
            repo_path: repo.to_path_buf(),
            task_file: None,
            isolation: "none".into(),
            base_branch: Some("main".into()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn paths_are_deterministic() {
        let m = manager();
        let repo = Path::new("/work/repo");
        assert_eq!(
            m.worktree_path(repo, "bol"),
            PathBuf::from("/work/repo/.atelier/worktrees/atelier-bol")
        );
        assert_eq!(m.worktree_path(repo, "bol"), m.worktree_path(repo, "bol"));
        assert_eq!(m.branch_name("bol"), "atelier/bol");
    }

    #[tokio::test]
    async fn create_then_remove_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let m = manager();
        m.ensure_layout(&repo).unwrap();

        let path = m.worktree_path(&repo, "dou");
        let branch = m.branch_name("dou");
        m.create(&repo, &path, &branch, "main").await.unwrap();

        let checkout = git2::Repository::open(&path).unwrap();
        assert_eq!(checkout.head().unwrap().shorthand(), Some(branch.as_str()));
        assert!(m.git().branch_exists(&repo, &branch).await.unwrap());

        m.remove(&repo, &path, &branch).await.unwrap();
        assert!(!path.exists());
        assert!(!m.git().branch_exists(&repo, &branch).await.unwrap());

        // Second cleanup is a no-op.
        m.remove(&repo, &path, &branch).await.unwrap();
    }

    #[tokio::test]
    async fn create_over_existing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let m = manager();
        let path = m.worktree_path(&repo, "bol");
        std::fs::create_dir_all(&path).unwrap();

        let err = m
            .create(&repo, &path, &m.branch_name("bol"), "main")
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::Worktree(_)));
    }

    #[tokio::test]
    async fn scan_recovers_written_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let m = manager();
        m.ensure_layout(&repo).unwrap();

        let agent = persisted(&m, &repo, 1, "dou");
        m.create(&repo, &agent.worktree_path, &agent.branch, "main")
            .await
            .unwrap();
        m.save_metadata(&agent).await.unwrap();

        let found = m.scan_for_agents(&repo).await.unwrap();
        assert_eq!(found, vec![agent]);
    }

    #[tokio::test]
    async fn scan_skips_foreign_and_bare_directories() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().to_path_buf();
        let m = manager();
        let root = m.worktree_root(&repo);

        // Matching name, no metadata.
        std::fs::create_dir_all(root.join("atelier-maes")).unwrap();
        // Non-matching name, valid metadata.
        let mut stray = persisted(&m, &repo, 4, "stray");
        stray.worktree_path = root.join("other-stray");
        m.save_metadata(&stray).await.unwrap();
        // Matching name, corrupt metadata.
        let corrupt = root.join("atelier-drost");
        std::fs::create_dir_all(corrupt.join(ATELIER_DIR)).unwrap();
        std::fs::write(WorktreeManager::metadata_path(&corrupt), "{ nope").unwrap();
        // Two valid agents, written out of order.
        let second = persisted(&m, &repo, 2, "flinck");
        let first = persisted(&m, &repo, 1, "dou");
        m.save_metadata(&second).await.unwrap();
        m.save_metadata(&first).await.unwrap();

        let found = m.scan_for_agents(&repo).await.unwrap();
        assert_eq!(found, vec![first, second]);
        assert_eq!(WorktreeManager::load_metadata(&corrupt).await, None);
    }

    #[tokio::test]
    async fn scan_without_worktree_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(manager().scan_for_agents(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn metadata_rewrite_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager();
        let mut agent = persisted(&m, dir.path(), 3, "bol");
        m.save_metadata(&agent).await.unwrap();
        agent.isolation = "sandbox".into();
        m.save_metadata(&agent).await.unwrap();

        let loaded = WorktreeManager::load_metadata(&agent.worktree_path).await.unwrap();
        assert_eq!(loaded.isolation, "sandbox");
        assert!(!WorktreeManager::metadata_path(&agent.worktree_path)
            .with_extension("json.tmp")
            .exists());
    }

    #[test]
    fn ensure_layout_excludes_atelier_dir_once() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let m = manager();
        m.ensure_layout(&repo).unwrap();
        m.ensure_layout(&repo).unwrap();

        let exclude = std::fs::read_to_string(repo.join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.matches("/.atelier/").count(), 1);
    }
}
