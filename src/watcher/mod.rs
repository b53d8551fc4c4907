//! Hybrid file watcher
//!
//! Native notifications (`notify`) are best-effort: over 9p/drvfs bridges and
//! some network filesystems they silently stop arriving. A backup poll
//! therefore always runs next to them and emits a [`WatchEventKind::Poll`]
//! event on a fixed interval, which consumers treat as "re-check everything".
//!
//! Native events are debounced per path. A health check marks the native side
//! unhealthy when it has been quiet for a whole window; that flag is advisory
//! and never disables the poll.

use crate::config::millis;
use crate::{platform, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchMode {
    /// Hybrid, except poll-only under WSL.
    #[default]
    Auto,
    Hybrid,
    PollOnly,
}

impl WatchMode {
    /// Concrete mode for a host; never returns `Auto`.
    pub fn resolve(self, wsl: bool) -> WatchMode {
        match self {
            WatchMode::Auto if wsl => WatchMode::PollOnly,
            WatchMode::Auto => WatchMode::Hybrid,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub mode: WatchMode,
    #[serde(rename = "debounce_ms", with = "millis")]
    pub debounce: Duration,
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    #[serde(rename = "health_interval_ms", with = "millis")]
    pub health_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Auto,
            debounce: Duration::from_millis(100),
            poll_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Native,
    Poll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Changed path for native events; `None` for polls.
    pub path: Option<PathBuf>,
}

impl WatchEvent {
    fn poll() -> Self {
        Self {
            kind: WatchEventKind::Poll,
            path: None,
        }
    }
}

/// Trailing-edge debounce: a path fires once it has been quiet for `window`.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now + self.window);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every path whose deadline has passed.
    pub fn due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready.sort();
        ready
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

pub struct HybridWatcher {
    mode: WatchMode,
    native: Option<Mutex<RecommendedWatcher>>,
    paths: Mutex<BTreeSet<PathBuf>>,
    healthy: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HybridWatcher {
    /// Start watching. Events are delivered to `sink` until [`stop`](Self::stop)
    /// or drop. Must be called inside a tokio runtime.
    pub fn start(config: &WatcherConfig, sink: mpsc::UnboundedSender<WatchEvent>) -> Result<Self> {
        let mut mode = config.mode.resolve(platform::is_wsl());
        let mut tasks = Vec::new();
        let healthy = Arc::new(AtomicBool::new(true));
        let mut native = None;

        if mode == WatchMode::Hybrid {
            let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();
            let handler = move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for path in event.paths {
                        let _ = raw_tx.send(path);
                    }
                }
                Err(e) => tracing::debug!("native watch error: {}", e),
            };
            match notify::recommended_watcher(handler) {
                Ok(watcher) => {
                    native = Some(Mutex::new(watcher));
                    let last_native = Arc::new(Mutex::new(Instant::now()));
                    tasks.push(tokio::spawn(debounce_loop(
                        raw_rx,
                        config.debounce,
                        sink.clone(),
                        last_native.clone(),
                    )));
                    tasks.push(tokio::spawn(health_loop(
                        config.health_interval,
                        last_native,
                        healthy.clone(),
                    )));
                }
                Err(e) => {
                    tracing::warn!("native file watching unavailable, polling only: {}", e);
                    mode = WatchMode::PollOnly;
                }
            }
        }
        if mode == WatchMode::PollOnly {
            healthy.store(false, Ordering::Relaxed);
        }

        tasks.push(tokio::spawn(poll_loop(config.poll_interval, sink)));
        tracing::debug!(
            "file watcher started ({:?}, poll every {:?})",
            mode,
            config.poll_interval
        );

        Ok(Self {
            mode,
            native,
            paths: Mutex::new(BTreeSet::new()),
            healthy,
            tasks: Mutex::new(tasks),
        })
    }

    /// The effective mode after host detection and fallback.
    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// Whether native events arrived within the last health window.
    pub fn is_native_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths
            .lock()
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Watch `path` (non-recursively). Already-watched paths are a no-op.
    pub fn add_path(&self, path: &Path) -> Result<()> {
        let Ok(mut paths) = self.paths.lock() else {
            return Ok(());
        };
        if paths.contains(path) {
            return Ok(());
        }
        if let Some(native) = &self.native {
            if let Ok(mut watcher) = native.lock() {
                watcher.watch(path, RecursiveMode::NonRecursive)?;
            }
        }
        paths.insert(path.to_path_buf());
        Ok(())
    }

    pub fn remove_path(&self, path: &Path) -> Result<()> {
        let Ok(mut paths) = self.paths.lock() else {
            return Ok(());
        };
        if !paths.remove(path) {
            return Ok(());
        }
        if let Some(native) = &self.native {
            if let Ok(mut watcher) = native.lock() {
                // The directory may already be gone, which drops the watch with it.
                if let Err(e) = watcher.unwatch(path) {
                    tracing::debug!("unwatch {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }

    /// Stop all background work. Safe to call more than once.
    pub fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for HybridWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn debounce_loop(
    mut raw: mpsc::UnboundedReceiver<PathBuf>,
    window: Duration,
    sink: mpsc::UnboundedSender<WatchEvent>,
    last_native: Arc<Mutex<Instant>>,
) {
    let mut debouncer = Debouncer::new(window);
    loop {
        let deadline = debouncer.next_deadline();
        tokio::select! {
            received = raw.recv() => {
                let Some(path) = received else { break };
                let now = Instant::now();
                if let Ok(mut last) = last_native.lock() {
                    *last = now;
                }
                debouncer.push(path, now);
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                for path in debouncer.due(Instant::now()) {
                    let event = WatchEvent { kind: WatchEventKind::Native, path: Some(path) };
                    if sink.send(event).is_err() {
                        return;
                    }
                }
            }
            _ = sink.closed() => break,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

async fn poll_loop(period: Duration, sink: mpsc::UnboundedSender<WatchEvent>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if sink.send(WatchEvent::poll()).is_err() {
            break;
        }
    }
}

async fn health_loop(window: Duration, last_native: Arc<Mutex<Instant>>, healthy: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
    loop {
        ticker.tick().await;
        let quiet = last_native
            .lock()
            .map(|last| last.elapsed() >= window)
            .unwrap_or(true);
        let was_healthy = healthy.swap(!quiet, Ordering::Relaxed);
        if quiet && was_healthy {
            tracing::debug!("no native file events for {:?}, relying on poll", window);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_mode_polls_under_wsl() {
        assert_eq!(WatchMode::Auto.resolve(true), WatchMode::PollOnly);
        assert_eq!(WatchMode::Auto.resolve(false), WatchMode::Hybrid);
        assert_eq!(WatchMode::Hybrid.resolve(true), WatchMode::Hybrid);
    }

    #[test]
    fn debouncer_coalesces_bursts() {
        let start = Instant::now();
        let window = Duration::from_millis(100);
        let mut debouncer = Debouncer::new(window);
        let a = PathBuf::from("/wt/.atelier/status/a");

        debouncer.push(a.clone(), start);
        debouncer.push(a.clone(), start + Duration::from_millis(50));
        debouncer.push(PathBuf::from("/other"), start + Duration::from_millis(20));

        assert_eq!(
            debouncer.due(start + Duration::from_millis(120)),
            vec![PathBuf::from("/other")]
        );
        // The burst on `a` was extended by the second event.
        assert_eq!(
            debouncer.next_deadline(),
            Some(start + Duration::from_millis(150))
        );
        assert!(debouncer.due(start + Duration::from_millis(140)).is_empty());
        assert_eq!(debouncer.due(start + Duration::from_millis(150)), vec![a]);
        assert!(debouncer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backup_poll_fires_without_native_events() {
        let config = WatcherConfig {
            mode: WatchMode::PollOnly,
            ..WatcherConfig::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = HybridWatcher::start(&config, tx).unwrap();
        assert!(!watcher.is_native_healthy());

        let started = Instant::now();
        let event = rx.recv().await.unwrap();
        assert_eq!(event, WatchEvent::poll());
        let first = started.elapsed();
        assert!(first >= Duration::from_secs(5) && first < Duration::from_secs(6));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Poll);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_native_side_turns_unhealthy_and_poll_continues() {
        let config = WatcherConfig {
            mode: WatchMode::Hybrid,
            ..WatcherConfig::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = HybridWatcher::start(&config, tx).unwrap();
        if watcher.mode() != WatchMode::Hybrid {
            return;
        }
        assert!(watcher.is_native_healthy());

        tokio::time::sleep(config.health_interval + Duration::from_secs(1)).await;
        assert!(!watcher.is_native_healthy());

        let mut polls = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.kind, WatchEventKind::Poll);
            polls += 1;
        }
        assert_eq!(polls, 12);

        let event = rx.recv().await.unwrap();
        assert_eq!(event, WatchEvent::poll());
        watcher.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn paths_can_change_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = WatcherConfig {
            mode: WatchMode::PollOnly,
            ..WatcherConfig::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let watcher = HybridWatcher::start(&config, tx).unwrap();

        watcher.add_path(dir.path()).unwrap();
        watcher.add_path(dir.path()).unwrap();
        assert_eq!(watcher.paths(), vec![dir.path().to_path_buf()]);
        watcher.remove_path(dir.path()).unwrap();
        assert!(watcher.paths().is_empty());
        watcher.stop();
        watcher.stop();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn native_events_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let config = WatcherConfig {
            mode: WatchMode::Hybrid,
            poll_interval: Duration::from_secs(3600),
            ..WatcherConfig::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = HybridWatcher::start(&config, tx).unwrap();
        if watcher.mode() != WatchMode::Hybrid {
            return;
        }
        watcher.add_path(dir.path()).unwrap();

        let file = dir.path().join("signal");
        std::fs::write(&file, "working").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, WatchEventKind::Native);
    }
}
