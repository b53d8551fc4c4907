//! Git operations
//!
//! Mutating calls shell out to `git` through the [`CommandRunner`], bounded by
//! a per-class timeout and retried with backoff on transient failures. Local
//! ref lookups go through libgit2.

mod retry;

pub use retry::{retry, RetryPolicy};

use crate::command::{CommandOutput, CommandRequest, CommandRunner};
use crate::config::millis;
use crate::{AtelierError, Result};
use async_trait::async_trait;
use git2::{BranchType, Repository};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Timeout class of a git invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutTier {
    /// Ref lookups and branch bookkeeping.
    Fast,
    /// Diffs, worktree removal.
    Medium,
    /// Worktree creation, anything touching the network.
    Slow,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub retries: u32,
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
    pub backoff_factor: u32,
    #[serde(rename = "fast_timeout_ms", with = "millis")]
    pub fast_timeout: Duration,
    #[serde(rename = "medium_timeout_ms", with = "millis")]
    pub medium_timeout: Duration,
    #[serde(rename = "slow_timeout_ms", with = "millis")]
    pub slow_timeout: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            retries: policy.retries,
            initial_backoff: policy.initial_backoff,
            max_backoff: policy.max_backoff,
            backoff_factor: policy.factor,
            fast_timeout: Duration::from_secs(10),
            medium_timeout: Duration::from_secs(30),
            slow_timeout: Duration::from_secs(120),
        }
    }
}

impl GitConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            factor: self.backoff_factor,
        }
    }

    pub fn timeout(&self, tier: TimeoutTier) -> Duration {
        match tier {
            TimeoutTier::Fast => self.fast_timeout,
            TimeoutTier::Medium => self.medium_timeout,
            TimeoutTier::Slow => self.slow_timeout,
        }
    }
}

/// Lines added/removed against the agent's base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub insertions: u64,
    pub deletions: u64,
    pub files_changed: u64,
}

/// Result of a diff query. "No changes" and "could not compute" stay distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    Changed(DiffStats),
    Clean,
    Failed(String),
}

/// One entry of `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name; `None` when detached.
    pub branch: Option<String>,
}

/// Source of diff statistics for a worktree.
#[async_trait]
pub trait DiffProvider: Send + Sync {
    async fn diff_stats(&self, worktree: &Path, base: Option<&str>) -> DiffOutcome;
}

pub struct GitOps {
    runner: Arc<dyn CommandRunner>,
    config: GitConfig,
}

impl GitOps {
    pub fn new(runner: Arc<dyn CommandRunner>, config: GitConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    /// One `git` invocation; a non-zero exit becomes [`AtelierError::GitCommand`].
    async fn git(&self, cwd: &Path, args: &[&str], tier: TimeoutTier) -> Result<CommandOutput> {
        let request = CommandRequest::new("git")
            .args(args.iter().copied())
            .cwd(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.config.timeout(tier));
        let label = request.display();
        let output = self.runner.run(request).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(AtelierError::GitCommand {
                command: label,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    async fn git_with_retry(
        &self,
        cwd: &Path,
        args: &[&str],
        tier: TimeoutTier,
    ) -> Result<CommandOutput> {
        let label = format!("git {}", args.first().copied().unwrap_or_default());
        retry(self.config.retry_policy(), &label, || self.git(cwd, args, tier)).await
    }

    /// Branch currently checked out in `repo`.
    pub async fn current_branch(&self, repo: &Path) -> Result<String> {
        let path = repo.to_path_buf();
        let limit = self.config.timeout(TimeoutTier::Fast);
        let lookup = tokio::task::spawn_blocking(move || head_branch(&path));
        match tokio::time::timeout(limit, lookup).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(AtelierError::BaseBranch(join.to_string())),
            Err(_) => Err(AtelierError::Timeout {
                command: "resolve HEAD".to_string(),
                after: limit,
            }),
        }
    }

    pub async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let path = repo.to_path_buf();
        let branch = branch.to_string();
        let limit = self.config.timeout(TimeoutTier::Fast);
        let lookup = tokio::task::spawn_blocking(move || -> Result<bool> {
            let repo = Repository::open(&path)?;
            Ok(repo.find_branch(&branch, BranchType::Local).is_ok())
        });
        match tokio::time::timeout(limit, lookup).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(AtelierError::Command(join.to_string())),
            Err(_) => Err(AtelierError::Timeout {
                command: "find branch".to_string(),
                after: limit,
            }),
        }
    }

    /// Create `branch` from `base` and check it out at `path`.
    ///
    /// A retry after a timed-out attempt first checks whether that attempt
    /// got far enough to register the worktree, and if so accepts it.
    pub async fn add_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        let path_arg = path.to_string_lossy();
        let attempted = AtomicBool::new(false);
        retry(self.config.retry_policy(), "git worktree add", || async {
            if attempted.swap(true, Ordering::SeqCst) && self.has_worktree(repo, path, branch).await
            {
                tracing::debug!(
                    "worktree {} was added by an earlier attempt",
                    path.display()
                );
                return Ok(());
            }
            self.git(
                repo,
                &["worktree", "add", "-b", branch, &*path_arg, base],
                TimeoutTier::Slow,
            )
            .await
            .map(|_| ())
        })
        .await
    }

    /// Whether `branch` is checked out at `path` as a registered worktree.
    async fn has_worktree(&self, repo: &Path, path: &Path, branch: &str) -> bool {
        match self.list_worktrees(repo).await {
            Ok(entries) => entries
                .iter()
                .any(|e| same_path(&e.path, path) && e.branch.as_deref() == Some(branch)),
            Err(e) => {
                tracing::debug!("cannot list worktrees: {}", e);
                false
            }
        }
    }

    pub async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.git_with_retry(
            repo,
            &["worktree", "remove", "--force", &*path],
            TimeoutTier::Medium,
        )
        .await?;
        Ok(())
    }

    /// Drop administrative entries for worktrees whose directories are gone.
    pub async fn prune_worktrees(&self, repo: &Path) -> Result<()> {
        self.git_with_retry(repo, &["worktree", "prune"], TimeoutTier::Fast)
            .await?;
        Ok(())
    }

    pub async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.git_with_retry(repo, &["branch", "-D", branch], TimeoutTier::Fast)
            .await?;
        Ok(())
    }

    /// Every worktree registered with `repo`, main checkout included.
    pub async fn list_worktrees(&self, repo: &Path) -> Result<Vec<WorktreeEntry>> {
        let output = self
            .git(repo, &["worktree", "list", "--porcelain"], TimeoutTier::Fast)
            .await?;
        Ok(parse_worktree_list(&output.stdout))
    }
}

#[async_trait]
impl DiffProvider for GitOps {
    async fn diff_stats(&self, worktree: &Path, base: Option<&str>) -> DiffOutcome {
        let base = base.unwrap_or("HEAD");
        match self
            .git(worktree, &["diff", "--numstat", base], TimeoutTier::Medium)
            .await
        {
            Ok(output) => match parse_numstat(&output.stdout) {
                stats if stats.files_changed == 0 => DiffOutcome::Clean,
                stats => DiffOutcome::Changed(stats),
            },
            Err(e) => DiffOutcome::Failed(e.to_string()),
        }
    }
}

fn head_branch(repo: &Path) -> Result<String> {
    let repo = Repository::open(repo).map_err(|e| AtelierError::BaseBranch(e.message().to_string()))?;
    let head = repo
        .head()
        .map_err(|e| AtelierError::BaseBranch(e.message().to_string()))?;
    if !head.is_branch() {
        return Err(AtelierError::BaseBranch("HEAD is detached".to_string()));
    }
    head.shorthand()
        .map(str::to_string)
        .ok_or_else(|| AtelierError::BaseBranch("branch name is not UTF-8".to_string()))
}

/// Parse `git worktree list --porcelain`.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries: Vec<WorktreeEntry> = Vec::new();
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.push(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some(entry) = entries.last_mut() {
                let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                entry.branch = Some(branch.to_string());
            }
        }
    }
    entries
}

/// Path equality that tolerates symlinked or relative spellings.
pub(crate) fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Sum `git diff --numstat` output. Binary files count as changed with no lines.
pub fn parse_numstat(output: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in output.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(added), Some(removed), Some(_path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        stats.insertions += added.parse::<u64>().unwrap_or(0);
        stats.deletions += removed.parse::<u64>().unwrap_or(0);
        stats.files_changed += 1;
    }
    stats
}
