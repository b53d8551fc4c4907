//! Terminal sessions
//!
//! Each agent gets a tmux session named after its durable session id, never
//! its display name, so renaming an agent leaves the live session reachable.

use crate::command::{CommandOutput, CommandRequest, CommandRunner};
use crate::{AtelierError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SESSION_PREFIX: &str = "atl";
const ID_CHARS: usize = 12;
const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Stable tmux session name for a session id.
pub fn session_name(session_id: &str) -> String {
    let id: String = session_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(ID_CHARS)
        .collect();
    format!("{}-{}", SESSION_PREFIX, id.to_ascii_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Created,
    /// A session with that name was already running.
    Existing,
}

pub struct TmuxSessions {
    runner: Arc<dyn CommandRunner>,
}

impl TmuxSessions {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn tmux<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner
            .run(CommandRequest::new("tmux").args(args).timeout(TMUX_TIMEOUT))
            .await
    }

    /// Attach to the agent's session, creating it first if needed.
    ///
    /// Uses `new-session -A` so existence check and creation are one tmux
    /// operation. Takes over the caller's terminal until detach.
    pub async fn create_or_attach(
        &self,
        session_id: &str,
        cwd: &Path,
        command: Option<&str>,
    ) -> Result<()> {
        let name = session_name(session_id);
        let mut request = CommandRequest::new("tmux")
            .args(["new-session", "-A", "-s", name.as_str(), "-c"])
            .arg(cwd.to_string_lossy())
            .interactive();
        if let Some(command) = command {
            request = request.arg(command);
        }
        let output = self.runner.run(request).await?;
        if output.success() {
            Ok(())
        } else {
            Err(AtelierError::Session(format!(
                "tmux session {} exited with {:?}: {}",
                name,
                output.code,
                output.stderr.trim()
            )))
        }
    }

    /// Start the agent's session in the background without attaching.
    pub async fn create_detached(
        &self,
        session_id: &str,
        cwd: &Path,
        command: Option<&str>,
    ) -> Result<SessionOutcome> {
        let name = session_name(session_id);
        let mut args = vec![
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            name.clone(),
            "-c".to_string(),
            cwd.to_string_lossy().into_owned(),
        ];
        if let Some(command) = command {
            args.push(command.to_string());
        }
        let output = self.tmux(args).await?;
        if output.success() {
            tracing::info!("started tmux session {}", name);
            Ok(SessionOutcome::Created)
        } else if output.stderr.contains("duplicate session") {
            Ok(SessionOutcome::Existing)
        } else {
            Err(AtelierError::Session(format!(
                "could not start tmux session {}: {}",
                name,
                output.stderr.trim()
            )))
        }
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        let target = format!("={}", session_name(session_id));
        matches!(
            self.tmux(["has-session", "-t", target.as_str()]).await,
            Ok(out) if out.success()
        )
    }

    /// Kill the agent's session. Returns `false` when there was none.
    pub async fn kill(&self, session_id: &str) -> Result<bool> {
        let target = format!("={}", session_name(session_id));
        let output = self.tmux(["kill-session", "-t", target.as_str()]).await?;
        if output.success() {
            return Ok(true);
        }
        let stderr = output.stderr.to_ascii_lowercase();
        if stderr.contains("can't find session")
            || stderr.contains("no server running")
            || stderr.contains("session not found")
        {
            Ok(false)
        } else {
            Err(AtelierError::Session(format!(
                "could not kill tmux session {}: {}",
                target,
                output.stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeRunner;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Runner that keeps a tmux server's session table.
    fn fake_tmux() -> (FakeRunner, Arc<Mutex<HashSet<String>>>) {
        let sessions = Arc::new(Mutex::new(HashSet::new()));
        let table = sessions.clone();
        let runner = FakeRunner::new(move |req| {
            let args = &req.args;
            let value_of = |flag: &str| {
                args.iter()
                    .position(|a| a == flag)
                    .and_then(|i| args.get(i + 1))
                    .map(|v| v.trim_start_matches('=').to_string())
                    .unwrap_or_default()
            };
            let mut table = table.lock().unwrap();
            Ok(match args[0].as_str() {
                "new-session" => {
                    let name = value_of("-s");
                    let attach = args.iter().any(|a| a == "-A");
                    if table.contains(&name) && !attach {
                        CommandOutput::failed(1, format!("duplicate session: {}", name))
                    } else {
                        table.insert(name);
                        CommandOutput::ok("")
                    }
                }
                "has-session" if table.contains(&value_of("-t")) => CommandOutput::ok(""),
                "kill-session" if table.remove(&value_of("-t")) => CommandOutput::ok(""),
                _ => CommandOutput::failed(1, "can't find session"),
            })
        });
        (runner, sessions)
    }

    #[test]
    fn name_follows_session_id_only() {
        assert_eq!(session_name("9F3a1c77e0b24d5c8a"), "atl-9f3a1c77e0b2");
        assert_eq!(session_name("ab:cd.ef"), "atl-abcdef");
    }

    #[tokio::test]
    async fn create_or_attach_twice_makes_one_session() {
        let (runner, sessions) = fake_tmux();
        let tmux = TmuxSessions::new(Arc::new(runner.clone()));
        let id = "0123456789abcdef0123456789abcdef";

        tmux.create_or_attach(id, Path::new("/wt"), Some("claude")).await.unwrap();
        tmux.create_or_attach(id, Path::new("/wt"), Some("claude")).await.unwrap();

        assert_eq!(sessions.lock().unwrap().len(), 1);
        let calls = runner.calls();
        assert!(calls.iter().all(|c| c.interactive));
        assert_eq!(calls[0].args.last().map(String::as_str), Some("claude"));
    }

    #[tokio::test]
    async fn detached_create_reports_existing() {
        let (runner, _) = fake_tmux();
        let tmux = TmuxSessions::new(Arc::new(runner));
        let id = "feedfacefeedface";

        assert_eq!(
            tmux.create_detached(id, Path::new("/wt"), None).await.unwrap(),
            SessionOutcome::Created
        );
        assert_eq!(
            tmux.create_detached(id, Path::new("/wt"), None).await.unwrap(),
            SessionOutcome::Existing
        );
        assert!(tmux.has_session(id).await);

        assert!(tmux.kill(id).await.unwrap());
        assert!(!tmux.kill(id).await.unwrap());
        assert!(!tmux.has_session(id).await);
    }
}
