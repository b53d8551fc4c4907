//! Command runner
//!
//! Every external process the engine starts (git, tmux, container engines,
//! VMMs) goes through a [`CommandRunner`]. Requests always carry an upper
//! bound: when a request names no timeout the runner's default applies.

#[cfg(test)]
pub(crate) mod testing;

use crate::platform;
use crate::{AtelierError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Default upper bound for a single invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Shell flavour used by [`CommandRequest::shell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellDialect {
    Posix,
    Cmd,
    PowerShell,
}

impl ShellDialect {
    /// The dialect native to the host we were built for.
    pub fn native() -> Self {
        if cfg!(windows) {
            ShellDialect::Cmd
        } else {
            ShellDialect::Posix
        }
    }

    fn program_and_flag(self) -> (&'static str, &'static [&'static str]) {
        match self {
            ShellDialect::Posix => ("sh", &["-c"]),
            ShellDialect::Cmd => ("cmd", &["/C"]),
            ShellDialect::PowerShell => ("powershell", &["-NoProfile", "-NonInteractive", "-Command"]),
        }
    }
}

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    /// Inherit the caller's terminal instead of capturing output.
    pub interactive: bool,
}

impl CommandRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            stdin: None,
            timeout: None,
            interactive: false,
        }
    }

    /// Run `script` through the given shell.
    pub fn shell(script: impl Into<String>, dialect: ShellDialect) -> Self {
        let (program, flags) = dialect.program_and_flag();
        Self::new(program).args(flags.iter().copied()).arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// Human readable form used in logs and errors.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(char::is_whitespace) {
                out.push_str(&format!("{:?}", arg));
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// One line of output from a streaming command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// A running command whose output arrives line by line.
pub struct CommandStream {
    pub lines: mpsc::Receiver<OutputLine>,
    child: Child,
}

impl CommandStream {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Detach the output channel so it can be drained elsewhere while this
    /// handle keeps control of the process.
    pub fn take_lines(&mut self) -> mpsc::Receiver<OutputLine> {
        let (_closed, empty) = mpsc::channel(1);
        std::mem::replace(&mut self.lines, empty)
    }

    /// Returns the exit code if the process has finished.
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(|s| s.code().unwrap_or(-1)))
    }

    pub async fn kill(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStream")
            .field("pid", &self.child.id())
            .finish()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output.
    async fn run(&self, request: CommandRequest) -> Result<CommandOutput>;

    /// Start a long-lived process and stream its output.
    async fn stream(&self, request: CommandRequest) -> Result<CommandStream>;
}

/// How paths handed to child processes must be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    Native,
    /// Linux userland under WSL: Windows drive paths become `/mnt/<drive>/...`.
    Wsl,
}

impl PathStyle {
    pub fn detect() -> Self {
        if platform::is_wsl() {
            PathStyle::Wsl
        } else {
            PathStyle::Native
        }
    }
}

/// Convert a path written for the other side of a WSL bridge.
///
/// `C:\Users\me\repo` becomes `/mnt/c/Users/me/repo` under [`PathStyle::Wsl`];
/// anything else is returned unchanged.
pub fn translate_path(path: &str, style: PathStyle) -> String {
    if style != PathStyle::Wsl {
        return path.to_string();
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        let rest = path[2..].replace('\\', "/");
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            format!("/mnt/{}", drive)
        } else {
            format!("/mnt/{}/{}", drive, rest)
        }
    } else {
        path.to_string()
    }
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    default_timeout: Duration,
    path_style: PathStyle,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            path_style: PathStyle::detect(),
        }
    }

    fn build(&self, request: &CommandRequest) -> Command {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(translate_path(&cwd.to_string_lossy(), self.path_style));
        }
        cmd.envs(&request.env);
        cmd.kill_on_drop(true);
        cmd
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, request: CommandRequest) -> Result<CommandOutput> {
        let limit = request.timeout.unwrap_or(self.default_timeout);
        let label = request.display();
        let mut cmd = self.build(&request);

        if request.interactive {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            let status = cmd
                .status()
                .await
                .map_err(|e| AtelierError::Command(format!("failed to start `{}`: {}", label, e)))?;
            return Ok(CommandOutput {
                code: status.code(),
                ..Default::default()
            });
        }

        cmd.stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| AtelierError::Command(format!("failed to start `{}`: {}", label, e)))?;

        if let (Some(input), Some(mut pipe)) = (request.stdin.as_ref(), child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            drop(pipe);
        }

        tracing::debug!("running `{}`", label);
        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(CommandOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            // Dropping the future drops the child, which kills it.
            Err(_) => Err(AtelierError::Timeout {
                command: label,
                after: limit,
            }),
        }
    }

    async fn stream(&self, request: CommandRequest) -> Result<CommandStream> {
        let label = request.display();
        let mut cmd = self.build(&request);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| AtelierError::Command(format!("failed to start `{}`: {}", label, e)))?;

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Stdout(line)).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Stderr(line)).await.is_err() {
                        break;
                    }
                }
            });
        }

        tracing::debug!("streaming `{}` (pid {:?})", label, child.id());
        Ok(CommandStream { lines: rx, child })
    }
}
