//! Sandboxes agents can run in.
//!
//! Every backend implements the same [`IsolationBackend`] capability set and
//! is registered under its type string. Callers go through the
//! [`IsolationRegistry`] and never look at the backend type themselves; the
//! definition file format is private to each adapter.

mod container;
mod microvm;
mod none;

pub use container::ContainerBackend;
pub use microvm::MicroVmBackend;
pub use none::NoIsolation;

use crate::command::{CommandOutput, CommandRunner};
use crate::config::IsolationProfile;
use crate::{AtelierError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Lifecycle of a sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Creating,
    Running,
    Stopped,
    Error,
    NotCreated,
}

/// Opaque reference to a sandbox owned by the backend that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeHandle {
    pub backend: String,
    pub id: String,
    pub state: RuntimeState,
}

/// Short description of what a definition would create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    pub backend: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeStats {
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
}

#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Registry key.
    fn backend_type(&self) -> &'static str;

    async fn is_available(&self) -> bool;

    async fn display_info(&self, definition: Option<&Path>) -> Result<DisplayInfo>;

    /// Create a sandbox for `worktree`; returns the runtime id.
    async fn create(&self, definition: Option<&Path>, worktree: &Path, agent_id: u32)
    -> Result<String>;

    async fn exec(&self, runtime_id: &str, command: &str) -> Result<CommandOutput>;

    async fn destroy(&self, runtime_id: &str) -> Result<()>;

    async fn stats(&self, _runtime_id: &str) -> Result<Option<RuntimeStats>> {
        Ok(None)
    }
}

/// Backends indexed by type string.
#[derive(Default)]
pub struct IsolationRegistry {
    backends: BTreeMap<String, Arc<dyn IsolationBackend>>,
}

impl IsolationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the pass-through, container, and microVM backends.
    pub fn with_defaults(runner: Arc<dyn CommandRunner>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NoIsolation::new(runner.clone())));
        registry.register(Arc::new(ContainerBackend::new(runner.clone())));
        registry.register(Arc::new(MicroVmBackend::new(runner)));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn IsolationBackend>) {
        self.backends
            .insert(backend.backend_type().to_string(), backend);
    }

    pub fn get(&self, backend_type: &str) -> Option<Arc<dyn IsolationBackend>> {
        self.backends.get(backend_type).cloned()
    }

    fn require(&self, backend_type: &str) -> Result<Arc<dyn IsolationBackend>> {
        self.get(backend_type).ok_or_else(|| {
            AtelierError::Isolation(format!("no isolation backend '{}'", backend_type))
        })
    }

    pub fn backend_types(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    /// Types whose runtime is usable on this host.
    pub async fn available(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, backend) in &self.backends {
            if backend.is_available().await {
                out.push(name.clone());
            }
        }
        out
    }

    pub async fn describe(&self, profile: &IsolationProfile) -> Result<DisplayInfo> {
        self.require(&profile.backend)?
            .display_info(profile.definition.as_deref())
            .await
    }

    pub async fn create_runtime(
        &self,
        profile: &IsolationProfile,
        worktree: &Path,
        agent_id: u32,
    ) -> Result<RuntimeHandle> {
        let backend = self.require(&profile.backend)?;
        if !backend.is_available().await {
            return Err(AtelierError::Isolation(format!(
                "isolation backend '{}' is not available on this host",
                profile.backend
            )));
        }
        let id = backend
            .create(profile.definition.as_deref(), worktree, agent_id)
            .await?;
        tracing::info!(
            "created {} runtime {} for agent {}",
            profile.backend,
            id,
            agent_id
        );
        Ok(RuntimeHandle {
            backend: profile.backend.clone(),
            id,
            state: RuntimeState::Running,
        })
    }

    pub async fn exec(&self, handle: &RuntimeHandle, command: &str) -> Result<CommandOutput> {
        self.require(&handle.backend)?.exec(&handle.id, command).await
    }

    pub async fn stats(&self, handle: &RuntimeHandle) -> Result<Option<RuntimeStats>> {
        self.require(&handle.backend)?.stats(&handle.id).await
    }

    pub async fn destroy_runtime(&self, handle: &mut RuntimeHandle) -> Result<()> {
        let backend = self.require(&handle.backend)?;
        match backend.destroy(&handle.id).await {
            Ok(()) => {
                handle.state = RuntimeState::Stopped;
                Ok(())
            }
            Err(e) => {
                handle.state = RuntimeState::Error;
                Err(e)
            }
        }
    }
}

/// Parse sizes such as `512MiB`, `1.5GB`, `4g`, `100kB` into bytes.
pub(crate) fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1e3,
        "kib" => 1024.0,
        "m" | "mb" => 1e6,
        "mib" => 1024.0 * 1024.0,
        "g" | "gb" => 1e9,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" => 1e12,
        "tib" => 1024.0f64.powi(4),
        _ => return None,
    };
    Some((number * multiplier) as u64)
}
