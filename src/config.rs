//! Engine configuration.
//!
//! Loaded from `<repo>/.atelier/config.toml`, falling back to the user-level
//! `~/.config/atelier/config.toml`, falling back to defaults. Every field is
//! optional.

use crate::git::GitConfig;
use crate::tracker::TrackerConfig;
use crate::watcher::WatcherConfig;
use crate::{AtelierError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directory (inside the repository and inside every worktree) owned by us.
pub const ATELIER_DIR: &str = ".atelier";

/// Isolation config name that always means "no sandbox".
pub const NO_ISOLATION: &str = "none";

/// Backend type plus the definition file handed to its adapter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IsolationProfile {
    pub backend: String,
    #[serde(default)]
    pub definition: Option<PathBuf>,
}

impl IsolationProfile {
    pub fn none() -> Self {
        Self {
            backend: NO_ISOLATION.to_string(),
            definition: None,
        }
    }
}

/// Resolves an isolation config name to a backend and definition.
pub trait IsolationConfigProvider: Send + Sync {
    fn isolation_profile(&self, name: &str) -> Option<IsolationProfile>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where worktrees live; relative paths resolve against the repository.
    pub worktree_dir: PathBuf,
    /// Prefix for worktree folders (`<prefix>-<name>`) and branches (`<prefix>/<name>`).
    pub branch_prefix: String,
    /// Command started in each agent's terminal session.
    pub agent_command: String,
    pub tracker: TrackerConfig,
    pub watcher: WatcherConfig,
    pub git: GitConfig,
    pub isolation: BTreeMap<String, IsolationProfile>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worktree_dir: PathBuf::from(ATELIER_DIR).join("worktrees"),
            branch_prefix: "atelier".to_string(),
            agent_command: "claude".to_string(),
            tracker: TrackerConfig::default(),
            watcher: WatcherConfig::default(),
            git: GitConfig::default(),
            isolation: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load the configuration that applies to `repo`.
    pub fn load(repo: impl AsRef<Path>) -> Result<Self> {
        let repo_file = repo.as_ref().join(ATELIER_DIR).join("config.toml");
        if repo_file.exists() {
            return Self::from_file(&repo_file);
        }
        if let Some(user_file) = dirs::config_dir().map(|d| d.join("atelier").join("config.toml"))
        {
            if user_file.exists() {
                return Self::from_file(&user_file);
            }
        }
        Ok(Self::default())
    }

    /// Relative isolation definitions resolve against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&text)?;
        if let Some(dir) = path.parent() {
            config.resolve_definitions(dir);
        }
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.branch_prefix.is_empty()
            || self
                .branch_prefix
                .contains(|c: char| c.is_whitespace() || c == '/' || c == '\\')
        {
            return Err(AtelierError::Config(format!(
                "branch_prefix '{}' must be a single path segment",
                self.branch_prefix
            )));
        }
        if let Some(profile) = self.isolation.get(NO_ISOLATION) {
            if profile.backend != NO_ISOLATION {
                return Err(AtelierError::Config(
                    "isolation config 'none' cannot be redefined".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn resolve_definitions(&mut self, base: &Path) {
        for profile in self.isolation.values_mut() {
            if let Some(definition) = &mut profile.definition {
                if definition.is_relative() {
                    *definition = base.join(&*definition);
                }
            }
        }
    }
}

impl IsolationConfigProvider for EngineConfig {
    fn isolation_profile(&self, name: &str) -> Option<IsolationProfile> {
        if name == NO_ISOLATION {
            return Some(IsolationProfile::none());
        }
        self.isolation.get(name).cloned()
    }
}

/// Serde adapter for `Duration` fields written as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
