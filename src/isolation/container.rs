//! Container backend driving the `docker` (or `podman`) CLI.
//!
//! Definition file (TOML):
//!
//! ```toml
//! image = "ghcr.io/acme/agent:latest"
//! engine = "podman"        # optional, defaults to docker
//! cpus = 2.0
//! memory = "4g"
//! network = "none"         # none | bridge | host
//! workdir = "/workspace"
//! mounts = [{ source = "~/.cache/cargo", target = "/cargo", read_only = true }]
//! env = { RUST_LOG = "info" }
//! ```
//!
//! The worktree is bind-mounted at `workdir` and the container is kept alive
//! with `sleep infinity` so commands can be exec'd into it.

use super::{DisplayInfo, IsolationBackend, RuntimeStats, parse_size};
use crate::command::{CommandOutput, CommandRequest, CommandRunner};
use crate::{AtelierError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CREATE_TIMEOUT: Duration = Duration::from_secs(300);
const EXEC_TIMEOUT: Duration = Duration::from_secs(600);
const QUICK_TIMEOUT: Duration = Duration::from_secs(30);

/// Engines tried, after the configured default, when a definition names none.
const FALLBACK_ENGINES: &[&str] = &["docker", "podman"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NetworkMode {
    None,
    #[default]
    Bridge,
    Host,
}

impl NetworkMode {
    fn as_str(self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Mount {
    source: PathBuf,
    target: String,
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ContainerDefinition {
    image: String,
    #[serde(default)]
    engine: Option<String>,
    #[serde(default)]
    cpus: Option<f64>,
    #[serde(default)]
    memory: Option<String>,
    #[serde(default)]
    network: NetworkMode,
    #[serde(default = "default_workdir")]
    workdir: String,
    #[serde(default)]
    mounts: Vec<Mount>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

impl ContainerDefinition {
    fn parse(text: &str) -> Result<Self> {
        let def: Self = toml::from_str(text)?;
        if def.image.trim().is_empty() {
            return Err(AtelierError::Isolation(
                "container definition needs an image".to_string(),
            ));
        }
        if let Some(memory) = &def.memory {
            if parse_size(memory).is_none() {
                return Err(AtelierError::Isolation(format!(
                    "invalid memory limit '{}'",
                    memory
                )));
            }
        }
        Ok(def)
    }

    async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.ok_or_else(|| {
            AtelierError::Isolation("container isolation needs a definition file".to_string())
        })?;
        Self::parse(&tokio::fs::read_to_string(path).await?)
    }

    fn run_args(&self, name: &str, worktree: &Path, agent_id: u32) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("atelier.agent={}", agent_id),
            "-v".to_string(),
            format!("{}:{}", worktree.display(), self.workdir),
            "-w".to_string(),
            self.workdir.clone(),
            "--network".to_string(),
            self.network.as_str().to_string(),
        ];
        if let Some(cpus) = self.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory) = &self.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        for mount in &self.mounts {
            args.push("-v".to_string());
            let source = expand_home(&mount.source);
            if mount.read_only {
                args.push(format!("{}:{}:ro", source.display(), mount.target));
            } else {
                args.push(format!("{}:{}", source.display(), mount.target));
            }
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());
        args
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

pub struct ContainerBackend {
    runner: Arc<dyn CommandRunner>,
    default_engine: String,
    /// Container id -> engine that created it.
    engines: Mutex<HashMap<String, String>>,
}

impl ContainerBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_engine(runner, "docker")
    }

    pub fn with_engine(runner: Arc<dyn CommandRunner>, engine: impl Into<String>) -> Self {
        Self {
            runner,
            default_engine: engine.into(),
            engines: Mutex::new(HashMap::new()),
        }
    }

    fn engine_for(&self, runtime_id: &str) -> String {
        self.engines
            .lock()
            .ok()
            .and_then(|m| m.get(runtime_id).cloned())
            .unwrap_or_else(|| self.default_engine.clone())
    }

    async fn engine_available(&self, engine: &str) -> bool {
        self.engine_cmd(
            engine,
            &["info", "--format", "{{.ServerVersion}}"],
            QUICK_TIMEOUT,
        )
        .await
        .is_ok()
    }

    /// Candidate engines in preference order, default first.
    fn candidates(&self) -> Vec<&str> {
        let mut engines = vec![self.default_engine.as_str()];
        for engine in FALLBACK_ENGINES {
            if !engines.contains(engine) {
                engines.push(*engine);
            }
        }
        engines
    }

    /// The engine a definition runs on: its own choice, or the first one
    /// installed on this host.
    async fn resolve_engine(&self, requested: Option<&str>) -> Result<String> {
        if let Some(engine) = requested {
            return Ok(engine.to_string());
        }
        for engine in self.candidates() {
            if self.engine_available(engine).await {
                return Ok(engine.to_string());
            }
        }
        Err(AtelierError::Isolation(format!(
            "no container engine found (tried {})",
            self.candidates().join(", ")
        )))
    }

    async fn engine_cmd(&self, engine: &str, args: &[&str], timeout: Duration) -> Result<String> {
        let request = CommandRequest::new(engine)
            .args(args.iter().copied())
            .timeout(timeout);
        let label = request.display();
        let output = self.runner.run(request).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(AtelierError::Isolation(format!(
                "`{}` failed: {}",
                label,
                output.stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn backend_type(&self) -> &'static str {
        "container"
    }

    /// True when any supported engine answers; the definition picks which
    /// one is actually used.
    async fn is_available(&self) -> bool {
        for engine in self.candidates() {
            if self.engine_available(engine).await {
                return true;
            }
        }
        false
    }

    async fn display_info(&self, definition: Option<&Path>) -> Result<DisplayInfo> {
        let def = ContainerDefinition::load(definition).await?;
        let mut parts = vec![
            def.engine.clone().unwrap_or_else(|| self.default_engine.clone()),
            def.image.clone(),
        ];
        if let Some(cpus) = def.cpus {
            parts.push(format!("{} cpu", cpus));
        }
        if let Some(memory) = &def.memory {
            parts.push(memory.clone());
        }
        parts.push(format!("net:{}", def.network.as_str()));
        Ok(DisplayInfo {
            backend: "container".to_string(),
            summary: parts.join(" · "),
        })
    }

    async fn create(
        &self,
        definition: Option<&Path>,
        worktree: &Path,
        agent_id: u32,
    ) -> Result<String> {
        let def = ContainerDefinition::load(definition).await?;
        let engine = self.resolve_engine(def.engine.as_deref()).await?;
        let suffix: u32 = rand::random::<u32>() & 0xffffff;
        let name = format!("atelier-agent-{}-{:06x}", agent_id, suffix);
        let args = def.run_args(&name, worktree, agent_id);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let stdout = self.engine_cmd(&engine, &arg_refs, CREATE_TIMEOUT).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(AtelierError::Isolation(format!(
                "{} run printed no container id",
                engine
            )));
        }
        if let Ok(mut engines) = self.engines.lock() {
            engines.insert(id.clone(), engine);
        }
        Ok(id)
    }

    async fn exec(&self, runtime_id: &str, command: &str) -> Result<CommandOutput> {
        let engine = self.engine_for(runtime_id);
        self.runner
            .run(
                CommandRequest::new(engine)
                    .args(["exec", runtime_id, "sh", "-c", command])
                    .timeout(EXEC_TIMEOUT),
            )
            .await
    }

    async fn destroy(&self, runtime_id: &str) -> Result<()> {
        let engine = self.engine_for(runtime_id);
        match self
            .engine_cmd(&engine, &["rm", "-f", runtime_id], QUICK_TIMEOUT)
            .await
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("No such container") => {}
            Err(e) => return Err(e),
        }
        if let Ok(mut engines) = self.engines.lock() {
            engines.remove(runtime_id);
        }
        Ok(())
    }

    async fn stats(&self, runtime_id: &str) -> Result<Option<RuntimeStats>> {
        let engine = self.engine_for(runtime_id);
        let stdout = self
            .engine_cmd(
                &engine,
                &["stats", "--no-stream", "--format", "{{json .}}", runtime_id],
                QUICK_TIMEOUT,
            )
            .await?;
        Ok(stdout.lines().find_map(parse_stats_line))
    }
}

#[derive(Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu: String,
    #[serde(rename = "MemUsage", default)]
    mem: String,
}

fn parse_stats_line(line: &str) -> Option<RuntimeStats> {
    let raw: StatsLine = serde_json::from_str(line.trim()).ok()?;
    let cpu_percent = raw.cpu.trim().trim_end_matches('%').parse().ok();
    let mut mem = raw.mem.split('/');
    let memory_bytes = mem.next().and_then(parse_size);
    let memory_limit_bytes = mem.next().and_then(parse_size);
    Some(RuntimeStats {
        cpu_percent,
        memory_bytes,
        memory_limit_bytes,
    })
}
