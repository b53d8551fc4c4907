//! Agent status tracker
//!
//! Three independent loops reconcile each agent against the outside world:
//! status from signal files, the task list, and diff statistics. Every tick
//! asks the [`AgentSource`] for the current agent set, so the caller stays the
//! owner of that set.
//!
//! Signals are written by hooks in other processes with no delivery
//! guarantee. A signal older than the agent's last local interaction is
//! discarded; that check is what keeps a locally approved agent from being
//! flipped back by the file it just answered.

use crate::agent::{AgentStatus, DiffStats, SharedAgent, Task};
use crate::config::millis;
use crate::git::{DiffOutcome, DiffProvider};
use crate::status::{self, ParsedStatus};
use crate::tasks::TaskReader;
use crate::watcher::{HybridWatcher, WatcherConfig};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    #[serde(rename = "status_interval_ms", with = "millis")]
    pub status_interval: Duration,
    #[serde(rename = "todos_interval_ms", with = "millis")]
    pub todos_interval: Duration,
    #[serde(rename = "diff_interval_ms", with = "millis")]
    pub diff_interval: Duration,
    /// Re-check status as soon as a signal directory changes.
    pub watch_signals: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(1),
            todos_interval: Duration::from_secs(2),
            diff_interval: Duration::from_secs(60),
            watch_signals: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    StatusChanged {
        agent_id: u32,
        previous: AgentStatus,
        status: AgentStatus,
    },
    ApprovalPending {
        agent_id: u32,
        description: String,
    },
    TodosChanged {
        agent_id: u32,
        tasks: Vec<Task>,
    },
    DiffChanged {
        agent_id: u32,
        diff: DiffStats,
    },
}

/// Resolves the current agent set on every tick.
pub trait AgentSource: Send + Sync + 'static {
    fn agents(&self) -> Vec<SharedAgent>;
}

impl<F> AgentSource for F
where
    F: Fn() -> Vec<SharedAgent> + Send + Sync + 'static,
{
    fn agents(&self) -> Vec<SharedAgent> {
        self()
    }
}

/// Receives tracker events.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: AgentEvent);
}

impl EventSink for mpsc::UnboundedSender<AgentEvent> {
    fn emit(&self, event: AgentEvent) {
        let _ = self.send(event);
    }
}

struct Inner {
    config: TrackerConfig,
    source: Box<dyn AgentSource>,
    sink: Box<dyn EventSink>,
    diffs: Arc<dyn DiffProvider>,
    tasks: Arc<dyn TaskReader>,
    watcher: Mutex<Option<HybridWatcher>>,
}

pub struct AgentStatusTracker {
    inner: Arc<Inner>,
    watcher_config: Option<WatcherConfig>,
    polling: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentStatusTracker {
    pub fn new(
        config: TrackerConfig,
        source: impl AgentSource,
        diffs: Arc<dyn DiffProvider>,
        tasks: Arc<dyn TaskReader>,
        sink: impl EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source: Box::new(source),
                sink: Box::new(sink),
                diffs,
                tasks,
                watcher: Mutex::new(None),
            }),
            watcher_config: None,
            polling: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Also watch every agent's signal directory (when `watch_signals` is on).
    pub fn with_watcher(mut self, config: WatcherConfig) -> Self {
        self.watcher_config = Some(config);
        self
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// Start all loops. Each runs once immediately, then on its own period.
    /// Starting a running tracker is a no-op.
    pub fn start(&self) {
        if self.polling.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(mut handles) = self.handles.lock() else {
            return;
        };
        let config = &self.inner.config;

        handles.push(spawn_loop(config.status_interval, self.inner.clone(), |inner| async move {
            inner.poll_status().await
        }));
        handles.push(spawn_loop(config.todos_interval, self.inner.clone(), |inner| async move {
            inner.poll_todos().await
        }));
        handles.push(spawn_loop(config.diff_interval, self.inner.clone(), |inner| async move {
            inner.poll_diffs().await
        }));

        if let (true, Some(watcher_config)) = (config.watch_signals, &self.watcher_config) {
            let (tx, mut rx) = mpsc::unbounded_channel();
            match HybridWatcher::start(watcher_config, tx) {
                Ok(watcher) => {
                    if let Ok(mut slot) = self.inner.watcher.lock() {
                        *slot = Some(watcher);
                    }
                    let inner = self.inner.clone();
                    handles.push(tokio::spawn(async move {
                        while rx.recv().await.is_some() {
                            inner.poll_status().await;
                        }
                    }));
                }
                Err(e) => tracing::warn!("signal watching disabled: {}", e),
            }
        }
        tracing::debug!("status tracker started");
    }

    /// Stop every loop and the watcher. Repeated calls are no-ops.
    pub fn stop(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.inner.watcher.lock() {
            slot.take();
        }
        if self.polling.swap(false, Ordering::SeqCst) {
            tracing::debug!("status tracker stopped");
        }
    }

    /// Run every reconciliation pass once, now.
    pub async fn refresh(&self) {
        self.inner.poll_status().await;
        self.inner.poll_todos().await;
        self.inner.poll_diffs().await;
    }

    pub async fn poll_status(&self) {
        self.inner.poll_status().await
    }

    pub async fn poll_todos(&self) {
        self.inner.poll_todos().await
    }

    pub async fn poll_diffs(&self) {
        self.inner.poll_diffs().await
    }
}

impl Drop for AgentStatusTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_loop<F, Fut>(period: Duration, inner: Arc<Inner>, pass: F) -> JoinHandle<()>
where
    F: Fn(Arc<Inner>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            pass(inner.clone()).await;
        }
    })
}

impl Inner {
    async fn poll_status(&self) {
        let agents = self.source.agents();
        if agents.is_empty() {
            self.sync_watched(BTreeSet::new());
            return;
        }

        let mut dirs = BTreeSet::new();
        for shared in &agents {
            let worktree = shared.lock().await.worktree_path.clone();
            dirs.insert(status::status_dir(&worktree));

            let parsed = match status::read_latest(&worktree).await {
                Ok(Some(parsed)) => parsed,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!("reading signals in {}: {}", worktree.display(), e);
                    continue;
                }
            };
            self.apply_status(shared, parsed).await;
        }
        self.sync_watched(dirs);
    }

    async fn apply_status(&self, shared: &SharedAgent, parsed: ParsedStatus) {
        // Locked after the read so a local interaction recorded meanwhile wins.
        let mut agent = shared.lock().await;
        if parsed.modified < agent.last_interaction {
            tracing::debug!(
                "discarding stale {} signal for {} ({} < {})",
                parsed.status,
                agent.name,
                parsed.modified,
                agent.last_interaction
            );
            return;
        }

        let previous = agent.status;
        let had_approval = agent.pending_approval.is_some();
        agent.status = parsed.status;
        agent.pending_approval = if parsed.status == AgentStatus::WaitingApproval {
            parsed.pending_approval
        } else {
            None
        };

        if previous != agent.status {
            tracing::debug!("{}: {} -> {}", agent.name, previous, agent.status);
            self.sink.emit(AgentEvent::StatusChanged {
                agent_id: agent.id,
                previous,
                status: agent.status,
            });
        }
        if let (false, Some(description)) = (had_approval, &agent.pending_approval) {
            self.sink.emit(AgentEvent::ApprovalPending {
                agent_id: agent.id,
                description: description.clone(),
            });
        }
    }

    fn sync_watched(&self, wanted: BTreeSet<PathBuf>) {
        let Ok(slot) = self.watcher.lock() else {
            return;
        };
        let Some(watcher) = slot.as_ref() else {
            return;
        };
        for path in watcher.paths() {
            if !wanted.contains(&path) {
                let _ = watcher.remove_path(&path);
            }
        }
        for path in &wanted {
            if path.is_dir() {
                if let Err(e) = watcher.add_path(path) {
                    tracing::debug!("watch {}: {}", path.display(), e);
                }
            }
        }
    }

    async fn poll_todos(&self) {
        let agents = self.source.agents();
        for shared in agents {
            let (worktree, task_file) = {
                let agent = shared.lock().await;
                (agent.worktree_path.clone(), agent.task_file.clone())
            };
            let tasks = match self.tasks.read_tasks(&worktree, task_file.as_deref()).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::debug!("reading tasks in {}: {}", worktree.display(), e);
                    continue;
                }
            };
            let mut agent = shared.lock().await;
            if agent.tasks != tasks {
                agent.tasks = tasks.clone();
                self.sink.emit(AgentEvent::TodosChanged {
                    agent_id: agent.id,
                    tasks,
                });
            }
        }
    }

    async fn poll_diffs(&self) {
        let agents = self.source.agents();
        if agents.is_empty() {
            return;
        }

        let mut set = JoinSet::new();
        for shared in agents {
            let diffs = self.diffs.clone();
            set.spawn(async move {
                let (worktree, base) = {
                    let agent = shared.lock().await;
                    (agent.worktree_path.clone(), agent.base_branch.clone())
                };
                let outcome = diffs.diff_stats(&worktree, base.as_deref()).await;
                (shared, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((shared, outcome)) = joined else {
                continue;
            };
            let stats = match outcome {
                DiffOutcome::Changed(stats) => stats,
                DiffOutcome::Clean => DiffStats::default(),
                DiffOutcome::Failed(reason) => {
                    tracing::debug!("diff stats unavailable: {}", reason);
                    continue;
                }
            };
            let mut agent = shared.lock().await;
            if agent.diff != stats {
                agent.diff = stats;
                self.sink.emit(AgentEvent::DiffChanged {
                    agent_id: agent.id,
                    diff: stats,
                });
            }
        }
    }
}
