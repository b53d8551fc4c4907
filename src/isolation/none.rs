//! Pass-through backend: the agent runs directly on the host.

use super::{DisplayInfo, IsolationBackend};
use crate::command::{CommandOutput, CommandRequest, CommandRunner, ShellDialect};
use crate::{AtelierError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct NoIsolation {
    runner: Arc<dyn CommandRunner>,
    /// Runtime id -> worktree the commands run in.
    worktrees: Mutex<HashMap<String, PathBuf>>,
}

impl NoIsolation {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            worktrees: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl IsolationBackend for NoIsolation {
    fn backend_type(&self) -> &'static str {
        "none"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn display_info(&self, _definition: Option<&Path>) -> Result<DisplayInfo> {
        Ok(DisplayInfo {
            backend: "none".to_string(),
            summary: "runs on the host".to_string(),
        })
    }

    async fn create(
        &self,
        _definition: Option<&Path>,
        worktree: &Path,
        agent_id: u32,
    ) -> Result<String> {
        let id = format!("host-{}", agent_id);
        self.worktrees
            .lock()
            .map_err(|_| AtelierError::Isolation("runtime table poisoned".to_string()))?
            .insert(id.clone(), worktree.to_path_buf());
        Ok(id)
    }

    async fn exec(&self, runtime_id: &str, command: &str) -> Result<CommandOutput> {
        let cwd = self
            .worktrees
            .lock()
            .map_err(|_| AtelierError::Isolation("runtime table poisoned".to_string()))?
            .get(runtime_id)
            .cloned()
            .ok_or_else(|| AtelierError::Isolation(format!("unknown runtime {}", runtime_id)))?;
        self.runner
            .run(CommandRequest::shell(command, ShellDialect::native()).cwd(cwd))
            .await
    }

    async fn destroy(&self, runtime_id: &str) -> Result<()> {
        self.worktrees
            .lock()
            .map_err(|_| AtelierError::Isolation("runtime table poisoned".to_string()))?
            .remove(runtime_id);
        Ok(())
    }
}
