//! Agent factory
//!
//! Batch creation of agents: base branch, names, worktrees, ids, metadata,
//! optional sandbox, terminal. One agent failing never aborts the others; the
//! caller gets a per-name outcome.

use crate::agent::{
    Agent, NAME_POOL, PersistedAgent, generate_session_id, smallest_unused_id,
};
use crate::config::{IsolationConfigProvider, NO_ISOLATION};
use crate::isolation::IsolationRegistry;
use crate::session::TmuxSessions;
use crate::state::AgentStore;
use crate::worktree::WorktreeManager;
use crate::{AtelierError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What to create.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub count: usize,
    /// Isolation config name; `None` means no sandbox.
    pub isolation: Option<String>,
    /// Branch to fork from; `None` uses the repository's current branch.
    pub base_branch: Option<String>,
    pub task_file: Option<PathBuf>,
}

impl CreateRequest {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            isolation: None,
            base_branch: None,
            task_file: None,
        }
    }

    pub fn isolation(mut self, name: impl Into<String>) -> Self {
        self.isolation = Some(name.into());
        self
    }

    pub fn base_branch(mut self, branch: impl Into<String>) -> Self {
        self.base_branch = Some(branch.into());
        self
    }

    pub fn task_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.task_file = Some(path.into());
        self
    }
}

#[derive(Debug)]
pub enum AgentOutcome {
    Created(Box<Agent>),
    /// A worktree for that name was already on disk.
    SkippedExisting { name: String },
    Failed { name: String, error: String },
}

#[derive(Debug, Default)]
pub struct BatchResult {
    pub outcomes: Vec<AgentOutcome>,
    /// Requested agents that could not be named because the pool ran out.
    pub shortfall: usize,
}

impl BatchResult {
    pub fn created(&self) -> Vec<&Agent> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                AgentOutcome::Created(agent) => Some(agent.as_ref()),
                _ => None,
            })
            .collect()
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                AgentOutcome::SkippedExisting { name } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether a request for `requested` agents should count as failed: some
    /// agent errored, or a non-empty request produced nothing.
    pub fn is_failure(&self, requested: usize) -> bool {
        !self.errors().is_empty() || (requested > 0 && self.created().is_empty())
    }

    pub fn errors(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                AgentOutcome::Failed { name, error } => Some((name.as_str(), error.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn into_agents(self) -> Vec<Agent> {
        self.outcomes
            .into_iter()
            .filter_map(|o| match o {
                AgentOutcome::Created(agent) => Some(*agent),
                _ => None,
            })
            .collect()
    }
}

/// Opens (and closes) the terminal an agent runs in.
#[async_trait]
pub trait TerminalHook: Send + Sync {
    async fn agent_created(&self, agent: &Agent) -> Result<()>;

    async fn agent_removed(&self, _agent: &PersistedAgent) -> Result<()> {
        Ok(())
    }
}

/// Leaves terminals to the caller.
pub struct NoTerminal;

#[async_trait]
impl TerminalHook for NoTerminal {
    async fn agent_created(&self, _agent: &Agent) -> Result<()> {
        Ok(())
    }
}

/// Pre-warms a detached tmux session running the agent command.
pub struct DetachedTmux {
    sessions: Arc<TmuxSessions>,
    command: String,
}

impl DetachedTmux {
    pub fn new(sessions: Arc<TmuxSessions>, command: impl Into<String>) -> Self {
        Self {
            sessions,
            command: command.into(),
        }
    }
}

#[async_trait]
impl TerminalHook for DetachedTmux {
    async fn agent_created(&self, agent: &Agent) -> Result<()> {
        self.sessions
            .create_detached(&agent.session_id, &agent.worktree_path, Some(self.command.as_str()))
            .await?;
        Ok(())
    }

    async fn agent_removed(&self, agent: &PersistedAgent) -> Result<()> {
        self.sessions.kill(&agent.session_id).await?;
        Ok(())
    }
}

/// Names chosen for a batch.
#[derive(Debug, Default, PartialEq, Eq)]
struct NamePlan {
    names: Vec<String>,
    skipped: Vec<String>,
    shortfall: usize,
}

/// Walk the pool in order, skipping names in use and names whose worktree
/// is already on disk.
fn plan_names(count: usize, used: &BTreeSet<String>, on_disk: impl Fn(&str) -> bool) -> NamePlan {
    let mut plan = NamePlan::default();
    for name in NAME_POOL.iter().copied() {
        if plan.names.len() == count {
            break;
        }
        if used.contains(name) {
            continue;
        }
        if on_disk(name) {
            plan.skipped.push(name.to_string());
            continue;
        }
        plan.names.push(name.to_string());
    }
    plan.shortfall = count - plan.names.len();
    plan
}

pub struct AgentFactory {
    repo: PathBuf,
    worktrees: Arc<WorktreeManager>,
    isolation: Arc<IsolationRegistry>,
    profiles: Arc<dyn IsolationConfigProvider>,
    store: Option<Arc<dyn AgentStore>>,
    terminal: Arc<dyn TerminalHook>,
}

impl AgentFactory {
    pub fn new(
        repo: impl AsRef<Path>,
        worktrees: Arc<WorktreeManager>,
        isolation: Arc<IsolationRegistry>,
        profiles: Arc<dyn IsolationConfigProvider>,
    ) -> Self {
        Self {
            repo: repo.as_ref().to_path_buf(),
            worktrees,
            isolation,
            profiles,
            store: None,
            terminal: Arc::new(NoTerminal),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn AgentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_terminal(mut self, terminal: Arc<dyn TerminalHook>) -> Self {
        self.terminal = terminal;
        self
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Agents recovered from worktree metadata.
    pub async fn recover(&self) -> Result<Vec<Agent>> {
        Ok(self
            .worktrees
            .scan_for_agents(&self.repo)
            .await?
            .into_iter()
            .map(Agent::from_persisted)
            .collect())
    }

    /// Create up to `request.count` agents.
    ///
    /// Only an unresolvable base branch fails the whole batch.
    pub async fn create_agents(&self, request: CreateRequest) -> Result<BatchResult> {
        let base = match request.base_branch.clone() {
            Some(base) => base,
            None => self
                .worktrees
                .git()
                .current_branch(&self.repo)
                .await
                .map_err(|e| match e {
                    AtelierError::BaseBranch(_) => e,
                    other => AtelierError::BaseBranch(other.to_string()),
                })?,
        };
        self.worktrees.ensure_layout(&self.repo)?;

        let existing = self.worktrees.scan_for_agents(&self.repo).await?;
        let used_names: BTreeSet<String> = existing.iter().map(|a| a.name.clone()).collect();
        let mut used_ids: BTreeSet<u32> = existing.iter().map(|a| a.id).collect();

        let plan = plan_names(request.count, &used_names, |name| {
            WorktreeManager::exists(&self.worktrees.worktree_path(&self.repo, name))
        });
        if plan.shortfall > 0 {
            tracing::warn!(
                "name pool exhausted: creating {} of {} agents",
                plan.names.len(),
                request.count
            );
        }

        let mut result = BatchResult {
            outcomes: Vec::with_capacity(plan.names.len() + plan.skipped.len()),
            shortfall: plan.shortfall,
        };
        for name in plan.skipped {
            tracing::info!("skipping {}: worktree already exists", name);
            result.outcomes.push(AgentOutcome::SkippedExisting { name });
        }
        for name in plan.names {
            match self.create_one(&name, &base, &request, &mut used_ids).await {
                Ok(agent) => result.outcomes.push(AgentOutcome::Created(Box::new(agent))),
                Err(e) => {
                    tracing::warn!("failed to create agent {}: {}", name, e);
                    result.outcomes.push(AgentOutcome::Failed {
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(result)
    }

    async fn create_one(
        &self,
        name: &str,
        base: &str,
        request: &CreateRequest,
        used_ids: &mut BTreeSet<u32>,
    ) -> Result<Agent> {
        let path = self.worktrees.worktree_path(&self.repo, name);
        let branch = self.worktrees.branch_name(name);
        self.worktrees.create(&self.repo, &path, &branch, base).await?;

        let id = smallest_unused_id(used_ids);
        used_ids.insert(id);

        let persisted = PersistedAgent {
            id,
            name: name.to_string(),
            session_id: generate_session_id(),
            branch: branch.clone(),
            worktree_path: path.clone(),
            repo_path: self.repo.clone(),
            task_file: request.task_file.clone(),
            isolation: request
                .isolation
                .clone()
                .unwrap_or_else(|| NO_ISOLATION.to_string()),
            base_branch: Some(base.to_string()),
            created_at: Utc::now(),
        };
        if let Err(e) = self.worktrees.save_metadata(&persisted).await {
            used_ids.remove(&id);
            if let Err(cleanup) = self.worktrees.remove(&self.repo, &path, &branch).await {
                tracing::warn!("cleanup of {} failed: {}", path.display(), cleanup);
            }
            return Err(e);
        }

        let mut agent = Agent::from_persisted(persisted);
        agent.last_interaction = agent.created_at;
        self.attach_isolation(&mut agent).await;

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&agent.persisted()) {
                tracing::warn!("central store not updated for {}: {}", agent.name, e);
            }
        }
        if let Err(e) = self.terminal.agent_created(&agent).await {
            tracing::warn!("terminal for {} not started: {}", agent.name, e);
        }

        tracing::info!("created agent {} (#{}) on {}", agent.name, agent.id, agent.branch);
        Ok(agent)
    }

    /// Start the agent's sandbox, falling back to none on any failure.
    async fn attach_isolation(&self, agent: &mut Agent) {
        if agent.isolation == NO_ISOLATION {
            return;
        }
        let failure = match self.profiles.isolation_profile(&agent.isolation) {
            None => format!("unknown isolation config '{}'", agent.isolation),
            Some(profile) => match self
                .isolation
                .create_runtime(&profile, &agent.worktree_path, agent.id)
                .await
            {
                Ok(handle) => {
                    agent.runtime = Some(handle);
                    return;
                }
                Err(e) => e.to_string(),
            },
        };

        tracing::warn!(
            "isolation '{}' failed for {}, running without: {}",
            agent.isolation,
            agent.name,
            failure
        );
        agent.isolation = NO_ISOLATION.to_string();
        agent.runtime = None;
        if let Err(e) = self.worktrees.save_metadata(&agent.persisted()).await {
            tracing::warn!("metadata for {} not updated: {}", agent.name, e);
        }
    }

    /// Tear an agent down: sandbox, terminal, worktree, branch, central entry.
    pub async fn delete_agent(&self, agent: &Agent) -> Result<()> {
        if let Some(mut handle) = agent.runtime.clone() {
            if let Err(e) = self.isolation.destroy_runtime(&mut handle).await {
                tracing::warn!("sandbox {} for {} not destroyed: {}", handle.id, agent.name, e);
            }
        }
        let persisted = agent.persisted();
        if let Err(e) = self.terminal.agent_removed(&persisted).await {
            tracing::warn!("terminal for {} not closed: {}", agent.name, e);
        }

        self.worktrees
            .remove(&self.repo, &agent.worktree_path, &agent.branch)
            .await?;

        if let Some(store) = &self.store {
            if let Err(e) = store.remove(agent.id) {
                tracing::warn!("central store entry for {} not removed: {}", agent.name, e);
            }
        }
        tracing::info!("deleted agent {} (#{})", agent.name, agent.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, ProcessRunner};
    use crate::config::{EngineConfig, IsolationProfile};
    use crate::git::GitOps;
    use crate::isolation::{DisplayInfo, IsolationBackend};
    use crate::state::SqliteAgentStore;
    use crate::testing::init_repo;
    use std::collections::HashSet;

    struct Exploding;

    #[async_trait]
    impl IsolationBackend for Exploding {
        fn backend_type(&self) -> &'static str {
            "exploding"
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn display_info(&self, _definition: Option<&Path>) -> Result<DisplayInfo> {
            Ok(DisplayInfo {
                backend: "exploding".into(),
                summary: String::new(),
            })
        }
        async fn create(&self, _d: Option<&Path>, _w: &Path, _id: u32) -> Result<String> {
            Err(AtelierError::Isolation("image pull failed".into()))
        }
        async fn exec(&self, _id: &str, _command: &str) -> Result<CommandOutput> {
            Ok(CommandOutput::ok(""))
        }
        async fn destroy(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn batch_failure_needs_an_error_or_nothing_created() {
        let empty = BatchResult {
            outcomes: Vec::new(),
            shortfall: 0,
        };
        assert!(!empty.is_failure(0));
        assert!(empty.is_failure(2));

        let skipped = BatchResult {
            outcomes: vec![AgentOutcome::SkippedExisting { name: "dou".into() }],
            shortfall: 0,
        };
        assert!(skipped.is_failure(1));

        let failed = BatchResult {
            outcomes: vec![AgentOutcome::Failed {
                name: "bol".into(),
                error: "worktree add failed".into(),
            }],
            shortfall: 0,
        };
        assert!(failed.is_failure(0));
    }

    fn factory(repo: &Path) -> (AgentFactory, Arc<SqliteAgentStore>) {
        let mut config = EngineConfig::default();
        config.isolation.insert(
            "sandbox".into(),
            IsolationProfile {
                backend: "exploding".into(),
                definition: None,
            },
        );
        let runner = Arc::new(ProcessRunner::new());
        let git = Arc::new(GitOps::new(runner.clone(), config.git.clone()));
        let worktrees = Arc::new(WorktreeManager::new(git, &config));
        let mut registry = IsolationRegistry::with_defaults(runner);
        registry.register(Arc::new(Exploding));
        let store = Arc::new(SqliteAgentStore::in_memory().unwrap());
        let factory = AgentFactory::new(repo, worktrees, Arc::new(registry), Arc::new(config))
            .with_store(store.clone());
        (factory, store)
    }

    #[test]
    fn name_plan_skips_used_and_on_disk() {
        let used = BTreeSet::from(["dou".to_string()]);
        let plan = plan_names(2, &used, |name| name == "flinck");
        assert_eq!(plan.names, vec!["bol", "maes"]);
        assert_eq!(plan.skipped, vec!["flinck"]);
        assert_eq!(plan.shortfall, 0);
    }

    #[test]
    fn name_plan_reports_pool_exhaustion() {
        let used: BTreeSet<String> = NAME_POOL[..14].iter().map(|n| n.to_string()).collect();
        let plan = plan_names(5, &used, |_| false);
        assert_eq!(plan.names.len(), 2);
        assert_eq!(plan.shortfall, 3);
    }

    #[tokio::test]
    async fn three_agents_from_main() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let (factory, store) = factory(&repo);

        let result = factory.create_agents(CreateRequest::new(3)).await.unwrap();
        assert!(result.errors().is_empty());
        assert!(result.skipped().is_empty());
        assert_eq!(result.shortfall, 0);

        let agents = result.created();
        let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["dou", "flinck", "bol"]);
        let ids: Vec<u32> = agents.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let sessions: HashSet<&str> = agents.iter().map(|a| a.session_id.as_str()).collect();
        assert_eq!(sessions.len(), 3);

        for agent in &agents {
            assert!(agent.worktree_path.is_dir());
            assert_eq!(agent.base_branch.as_deref(), Some("main"));
            let checkout = git2::Repository::open(&agent.worktree_path).unwrap();
            assert_eq!(checkout.head().unwrap().shorthand(), Some(agent.branch.as_str()));
        }
        assert_eq!(store.list().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn deleting_the_middle_agent_leaves_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let (factory, store) = factory(&repo);
        let agents = factory
            .create_agents(CreateRequest::new(3))
            .await
            .unwrap()
            .into_agents();

        factory.delete_agent(&agents[1]).await.unwrap();

        let remaining = factory.recover().await.unwrap();
        let names: Vec<&str> = remaining.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["dou", "bol"]);
        assert!(!agents[1].worktree_path.exists());

        let git = factory.worktrees.git();
        assert!(!git.branch_exists(&repo, &agents[1].branch).await.unwrap());
        for kept in [&agents[0], &agents[2]] {
            assert!(kept.worktree_path.is_dir());
            assert!(git.branch_exists(&repo, &kept.branch).await.unwrap());
        }
        assert_eq!(store.list().unwrap().len(), 2);

        // The freed id is the next one handed out.
        let next = factory
            .create_agents(CreateRequest::new(1))
            .await
            .unwrap()
            .into_agents();
        assert_eq!(next[0].id, 2);
    }

    #[tokio::test]
    async fn failing_isolation_falls_back_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let (factory, _) = factory(&repo);

        let result = factory
            .create_agents(CreateRequest::new(1).isolation("sandbox"))
            .await
            .unwrap();
        assert!(result.errors().is_empty());
        let agent = result.created()[0];
        assert_eq!(agent.isolation, "none");
        assert!(agent.runtime.is_none());

        let on_disk = WorktreeManager::load_metadata(&agent.worktree_path)
            .await
            .unwrap();
        assert_eq!(on_disk.isolation, "none");
    }

    #[tokio::test]
    async fn existing_worktree_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let (factory, _) = factory(&repo);
        std::fs::create_dir_all(factory.worktrees.worktree_path(&repo, "dou")).unwrap();

        let result = factory.create_agents(CreateRequest::new(1)).await.unwrap();
        assert_eq!(result.skipped(), vec!["dou"]);
        let created = result.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "flinck");
        assert_eq!(created[0].id, 1);
    }

    #[tokio::test]
    async fn unknown_base_branch_fails_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, _) = factory(dir.path());
        let err = factory
            .create_agents(CreateRequest::new(2))
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::BaseBranch(_)));
    }

    #[tokio::test]
    async fn bad_base_branch_fails_each_agent_not_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let (factory, _) = factory(&repo);

        let result = factory
            .create_agents(CreateRequest::new(2).base_branch("does-not-exist"))
            .await
            .unwrap();
        assert_eq!(result.errors().len(), 2);
        assert!(result.created().is_empty());
    }

    #[tokio::test]
    async fn created_agents_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let created = {
            let (factory, _) = factory(&repo);
            factory
                .create_agents(CreateRequest::new(2))
                .await
                .unwrap()
                .into_agents()
        };

        // Fresh factory, empty central store.
        let (factory, store) = factory(&repo);
        assert!(store.list().unwrap().is_empty());
        let recovered = factory.recover().await.unwrap();
        let expected: Vec<PersistedAgent> = created.iter().map(Agent::persisted).collect();
        let got: Vec<PersistedAgent> = recovered.iter().map(Agent::persisted).collect();
        assert_eq!(got, expected);
    }
}
