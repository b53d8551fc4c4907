//! MicroVM backend running agents under Firecracker.
//!
//! Definition file (TOML):
//!
//! ```toml
//! kernel = "/var/lib/atelier/vmlinux"
//! rootfs = "/var/lib/atelier/agent-rootfs.ext4"
//! vcpus = 2
//! memory_mib = 2048
//! vsock_port = 5000
//! ```
//!
//! Commands reach the guest over the Firecracker vsock bridge: the host
//! connects to the VM's Unix socket, sends `CONNECT <port>`, and exchanges one
//! JSON line each way with the guest agent listening on that port.

use super::{DisplayInfo, IsolationBackend};
use crate::command::{CommandOutput, CommandRequest, CommandRunner, CommandStream, OutputLine};
use crate::{AtelierError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const BOOT_TIMEOUT: Duration = Duration::from_secs(15);
const EXEC_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct VmDefinition {
    kernel: PathBuf,
    rootfs: PathBuf,
    #[serde(default = "default_vcpus")]
    vcpus: u32,
    #[serde(default = "default_memory")]
    memory_mib: u32,
    #[serde(default)]
    boot_args: Option<String>,
    #[serde(default = "default_vsock_port")]
    vsock_port: u32,
    #[serde(default = "default_guest_cid")]
    guest_cid: u32,
}

fn default_vcpus() -> u32 {
    2
}

fn default_memory() -> u32 {
    1024
}

fn default_vsock_port() -> u32 {
    5000
}

fn default_guest_cid() -> u32 {
    3
}

impl VmDefinition {
    fn parse(text: &str) -> Result<Self> {
        let def: Self = toml::from_str(text)?;
        if def.vcpus == 0 || def.memory_mib < 128 {
            return Err(AtelierError::Isolation(format!(
                "microvm needs at least 1 vcpu and 128 MiB (got {} / {})",
                def.vcpus, def.memory_mib
            )));
        }
        Ok(def)
    }

    async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.ok_or_else(|| {
            AtelierError::Isolation("microvm isolation needs a definition file".to_string())
        })?;
        Self::parse(&tokio::fs::read_to_string(path).await?)
    }

    /// Firecracker `--config-file` document.
    fn firecracker_config(&self, worktree: &Path, vsock_uds: &Path) -> serde_json::Value {
        let boot_args = format!(
            "{} atelier.worktree={}",
            self.boot_args.as_deref().unwrap_or(DEFAULT_BOOT_ARGS),
            worktree.display()
        );
        serde_json::json!({
            "boot-source": {
                "kernel_image_path": self.kernel,
                "boot_args": boot_args,
            },
            "drives": [{
                "drive_id": "rootfs",
                "path_on_host": self.rootfs,
                "is_root_device": true,
                "is_read_only": false,
            }],
            "machine-config": {
                "vcpu_count": self.vcpus,
                "mem_size_mib": self.memory_mib,
            },
            "vsock": {
                "guest_cid": self.guest_cid,
                "uds_path": vsock_uds,
            },
        })
    }
}

struct VmInstance {
    process: CommandStream,
    dir: PathBuf,
    vsock_uds: PathBuf,
    port: u32,
}

pub struct MicroVmBackend {
    runner: Arc<dyn CommandRunner>,
    state_dir: PathBuf,
    instances: Mutex<HashMap<String, VmInstance>>,
}

impl MicroVmBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        let state_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("atelier")
            .join("vms");
        Self::with_state_dir(runner, state_dir)
    }

    pub fn with_state_dir(runner: Arc<dyn CommandRunner>, state_dir: PathBuf) -> Self {
        Self {
            runner,
            state_dir,
            instances: Mutex::new(HashMap::new()),
        }
    }

    async fn wait_for_socket(id: &str, process: &mut CommandStream, socket: &Path) -> Result<()> {
        let deadline = tokio::time::Instant::now() + BOOT_TIMEOUT;
        loop {
            if socket.exists() {
                return Ok(());
            }
            if let Some(code) = process.try_wait()? {
                return Err(AtelierError::Isolation(format!(
                    "firecracker for {} exited during boot (code {})",
                    id, code
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AtelierError::Timeout {
                    command: format!("boot {}", id),
                    after: BOOT_TIMEOUT,
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[async_trait]
impl IsolationBackend for MicroVmBackend {
    fn backend_type(&self) -> &'static str {
        "microvm"
    }

    async fn is_available(&self) -> bool {
        if !cfg!(target_os = "linux") || !Path::new("/dev/kvm").exists() {
            return false;
        }
        matches!(
            self.runner
                .run(
                    CommandRequest::new("firecracker")
                        .arg("--version")
                        .timeout(Duration::from_secs(10))
                )
                .await,
            Ok(out) if out.success()
        )
    }

    async fn display_info(&self, definition: Option<&Path>) -> Result<DisplayInfo> {
        let def = VmDefinition::load(definition).await?;
        let kernel = def
            .kernel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(DisplayInfo {
            backend: "microvm".to_string(),
            summary: format!(
                "firecracker · {} vcpu · {} MiB · {}",
                def.vcpus, def.memory_mib, kernel
            ),
        })
    }

    async fn create(
        &self,
        definition: Option<&Path>,
        worktree: &Path,
        agent_id: u32,
    ) -> Result<String> {
        let def = VmDefinition::load(definition).await?;
        let id = format!("vm-{}-{:06x}", agent_id, rand::random::<u32>() & 0xffffff);
        let dir = self.state_dir.join(&id);
        tokio::fs::create_dir_all(&dir).await?;

        let api_sock = dir.join("api.sock");
        let vsock_uds = dir.join("vsock.sock");
        let config_path = dir.join("config.json");
        let config = def.firecracker_config(worktree, &vsock_uds);
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&config)?).await?;

        let request = CommandRequest::new("firecracker")
            .arg("--api-sock")
            .arg(api_sock.to_string_lossy())
            .arg("--config-file")
            .arg(config_path.to_string_lossy())
            .cwd(&dir);
        let mut process = match self.runner.stream(request).await {
            Ok(p) => p,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        };

        let mut console = process.take_lines();
        let console_id = id.clone();
        tokio::spawn(async move {
            while let Some(line) = console.recv().await {
                match line {
                    OutputLine::Stdout(l) => tracing::debug!("[{}] {}", console_id, l),
                    OutputLine::Stderr(l) => tracing::debug!("[{}] stderr: {}", console_id, l),
                }
            }
        });

        if let Err(e) = Self::wait_for_socket(&id, &mut process, &vsock_uds).await {
            let _ = process.kill().await;
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        self.instances.lock().await.insert(
            id.clone(),
            VmInstance {
                process,
                dir,
                vsock_uds,
                port: def.vsock_port,
            },
        );
        Ok(id)
    }

    async fn exec(&self, runtime_id: &str, command: &str) -> Result<CommandOutput> {
        let (uds, port) = {
            let instances = self.instances.lock().await;
            let vm = instances
                .get(runtime_id)
                .ok_or_else(|| AtelierError::Isolation(format!("unknown vm {}", runtime_id)))?;
            (vm.vsock_uds.clone(), vm.port)
        };
        vsock_exec(&uds, port, command, EXEC_TIMEOUT).await
    }

    async fn destroy(&self, runtime_id: &str) -> Result<()> {
        let Some(mut vm) = self.instances.lock().await.remove(runtime_id) else {
            return Ok(());
        };
        vm.process.kill().await?;
        match tokio::fs::remove_dir_all(&vm.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
}

#[derive(Deserialize)]
struct ExecResponse {
    code: Option<i32>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// Run `command` through the guest agent behind a Firecracker vsock socket.
#[cfg(unix)]
pub(crate) async fn vsock_exec(
    uds: &Path,
    port: u32,
    command: &str,
    limit: Duration,
) -> Result<CommandOutput> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    let exchange = async {
        let stream = UnixStream::connect(uds).await?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        write
            .write_all(format!("CONNECT {}\n", port).as_bytes())
            .await?;
        let mut ack = String::new();
        reader.read_line(&mut ack).await?;
        if !ack.starts_with("OK ") {
            return Err(AtelierError::Isolation(format!(
                "vsock handshake refused on port {}: {}",
                port,
                ack.trim()
            )));
        }

        let mut line = serde_json::to_string(&ExecRequest { command })?;
        line.push('\n');
        write.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        if reader.read_line(&mut reply).await? == 0 {
            return Err(AtelierError::Isolation(
                "guest closed vsock connection without a reply".to_string(),
            ));
        }
        let response: ExecResponse = serde_json::from_str(reply.trim())?;
        Ok::<_, AtelierError>(CommandOutput {
            code: response.code,
            stdout: response.stdout,
            stderr: response.stderr,
        })
    };

    tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| AtelierError::Timeout {
            command: format!("vsock exec `{}`", command),
            after: limit,
        })?
}

#[cfg(not(unix))]
pub(crate) async fn vsock_exec(
    _uds: &Path,
    _port: u32,
    _command: &str,
    _limit: Duration,
) -> Result<CommandOutput> {
    Err(AtelierError::Isolation(
        "microvm isolation requires a unix host".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeRunner;

    const DEFINITION: &str = r#"
        kernel = "/images/vmlinux"
        rootfs = "/images/rootfs.ext4"
        memory_mib = 2048
    "#;

    #[test]
    fn definition_defaults_and_validation() {
        let def = VmDefinition::parse(DEFINITION).unwrap();
        assert_eq!(def.vcpus, 2);
        assert_eq!(def.memory_mib, 2048);
        assert_eq!(def.vsock_port, 5000);
        assert!(VmDefinition::parse("kernel = \"k\"\nrootfs = \"r\"\nvcpus = 0").is_err());
        assert!(VmDefinition::parse("kernel = \"k\"").is_err());
    }

    #[test]
    fn firecracker_config_shape() {
        let def = VmDefinition::parse(DEFINITION).unwrap();
        let config = def.firecracker_config(Path::new("/repo/wt"), Path::new("/state/v.sock"));
        assert_eq!(config["machine-config"]["mem_size_mib"], 2048);
        assert_eq!(config["drives"][0]["path_on_host"], "/images/rootfs.ext4");
        assert_eq!(config["vsock"]["uds_path"], "/state/v.sock");
        let boot_args = config["boot-source"]["boot_args"].as_str().unwrap();
        assert!(boot_args.starts_with("console=ttyS0"));
        assert!(boot_args.ends_with("atelier.worktree=/repo/wt"));
    }

    #[tokio::test]
    async fn display_info_summarises_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.toml");
        std::fs::write(&path, DEFINITION).unwrap();
        let backend = MicroVmBackend::new(Arc::new(FakeRunner::succeeding()));
        let info = backend.display_info(Some(&path)).await.unwrap();
        assert_eq!(info.summary, "firecracker · 2 vcpu · 2048 MiB · vmlinux");
    }

    #[tokio::test]
    async fn failed_spawn_cleans_up_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.toml");
        std::fs::write(&path, DEFINITION).unwrap();
        let state = dir.path().join("vms");
        let backend =
            MicroVmBackend::with_state_dir(Arc::new(FakeRunner::succeeding()), state.clone());

        assert!(backend.create(Some(&path), Path::new("/wt"), 1).await.is_err());
        assert_eq!(std::fs::read_dir(&state).unwrap().count(), 0);
        // Unknown runtimes are already gone.
        backend.destroy("vm-1-000000").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_over_vsock_bridge() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let uds = dir.path().join("v.sock");
        let listener = UnixListener::bind(&uds).unwrap();

        let guest = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "CONNECT 5000\n");
            write.write_all(b"OK 1073741824\n").await.unwrap();

            line.clear();
            reader.read_line(&mut line).await.unwrap();
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request["command"], "cargo test");
            write
                .write_all(b"{\"code\":0,\"stdout\":\"ok\\n\",\"stderr\":\"\"}\n")
                .await
                .unwrap();
        });

        let out = vsock_exec(&uds, 5000, "cargo test", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "ok\n");
        guest.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn refused_handshake_is_an_error() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let uds = dir.path().join("v.sock");
        let listener = UnixListener::bind(&uds).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read).read_line(&mut line).await.unwrap();
            write.write_all(b"FAILURE\n").await.unwrap();
        });

        let err = vsock_exec(&uds, 5000, "true", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("handshake refused"));
    }
}
