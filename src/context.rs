//! Engine wiring.
//!
//! Everything the engine needs is built here once per repository and passed
//! explicitly; nothing lives in process-wide statics.

use crate::command::{CommandRunner, ProcessRunner};
use crate::config::EngineConfig;
use crate::factory::{AgentFactory, DetachedTmux};
use crate::git::GitOps;
use crate::isolation::IsolationRegistry;
use crate::session::TmuxSessions;
use crate::state::{AgentStore, SqliteAgentStore};
use crate::tasks::FileTaskReader;
use crate::tracker::{AgentSource, AgentStatusTracker, EventSink};
use crate::worktree::WorktreeManager;
use crate::{AtelierError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct EngineContext {
    pub repo: PathBuf,
    pub config: Arc<EngineConfig>,
    pub runner: Arc<dyn CommandRunner>,
    pub git: Arc<GitOps>,
    pub worktrees: Arc<WorktreeManager>,
    pub isolation: Arc<IsolationRegistry>,
    pub sessions: Arc<TmuxSessions>,
    pub store: Arc<dyn AgentStore>,
}

impl EngineContext {
    /// Context for the repository containing `path`, with its configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let repo = repo_root(path.as_ref())?;
        let config = EngineConfig::load(&repo)?;
        Self::new(repo, config, Arc::new(ProcessRunner::new()))
    }

    pub fn new(
        repo: impl AsRef<Path>,
        config: EngineConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let repo = repo.as_ref().to_path_buf();
        let git = Arc::new(GitOps::new(runner.clone(), config.git.clone()));
        let worktrees = Arc::new(WorktreeManager::new(git.clone(), &config));
        let isolation = Arc::new(IsolationRegistry::with_defaults(runner.clone()));
        let sessions = Arc::new(TmuxSessions::new(runner.clone()));
        let store: Arc<dyn AgentStore> = Arc::new(SqliteAgentStore::open(&repo)?);

        Ok(Self {
            repo,
            config: Arc::new(config),
            runner,
            git,
            worktrees,
            isolation,
            sessions,
            store,
        })
    }

    /// Factory whose agents get a detached tmux session running the agent command.
    pub fn factory(&self) -> AgentFactory {
        AgentFactory::new(
            &self.repo,
            self.worktrees.clone(),
            self.isolation.clone(),
            self.config.clone(),
        )
        .with_store(self.store.clone())
        .with_terminal(Arc::new(DetachedTmux::new(
            self.sessions.clone(),
            self.config.agent_command.clone(),
        )))
    }

    pub fn tracker(&self, source: impl AgentSource, sink: impl EventSink) -> AgentStatusTracker {
        AgentStatusTracker::new(
            self.config.tracker.clone(),
            source,
            self.git.clone(),
            Arc::new(FileTaskReader),
            sink,
        )
        .with_watcher(self.config.watcher.clone())
    }
}

/// Top-level working directory of the repository containing `path`.
pub fn repo_root(path: &Path) -> Result<PathBuf> {
    let repo = git2::Repository::discover(path)?;
    repo.workdir()
        .map(Path::to_path_buf)
        .ok_or_else(|| AtelierError::Config(format!("{} is a bare repository", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeRunner;
    use crate::testing::init_repo;

    #[test]
    fn discovers_root_from_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        std::fs::create_dir_all(repo.join("src/deep")).unwrap();
        let root = repo_root(&repo.join("src/deep")).unwrap();
        assert_eq!(root.canonicalize().unwrap(), repo.canonicalize().unwrap());
    }

    #[test]
    fn wires_everything_for_a_repo() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let ctx = EngineContext::new(&repo, EngineConfig::default(), Arc::new(FakeRunner::succeeding()))
            .unwrap();
        assert!(repo.join(".atelier/state.db").exists());
        assert_eq!(ctx.isolation.backend_types(), vec!["container", "microvm", "none"]);
        assert_eq!(ctx.factory().repo(), repo.as_path());
    }
}
