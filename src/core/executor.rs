/// Runtime command execution
///
/// Every interaction with the container runtime goes through [`CommandRunner`].
/// Arguments always travel as a discrete list handed to the process, never as
/// a shell string, so volume or image names cannot inject extra commands.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::error::{VolumeError, VolumeResult};
use crate::utils::constants::{DAEMON_UNREACHABLE_MARKERS, NO_SUCH_VOLUME_MARKERS};

/// Captured outcome of one runtime invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl CommandResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn daemon_unreachable(&self) -> bool {
        DAEMON_UNREACHABLE_MARKERS
            .iter()
            .any(|marker| self.stderr.contains(marker))
    }

    pub fn no_such_volume(&self) -> bool {
        NO_SUCH_VOLUME_MARKERS
            .iter()
            .any(|marker| self.stderr.contains(marker))
    }

    /// Turn a nonzero exit into the matching error, keep successes as they are
    pub fn check(self, context: &str) -> VolumeResult<Self> {
        if self.success() {
            return Ok(self);
        }

        if self.daemon_unreachable() {
            return Err(VolumeError::RuntimeUnavailable(self.stderr.trim().to_string()));
        }

        Err(VolumeError::CommandFailed {
            context: context.to_string(),
            exit_code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// Runs external programs on behalf of the service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture stdout, stderr and the exit code.
    ///
    /// A nonzero exit is not an error at this level; failing to start the
    /// program at all is.
    async fn execute(&self, program: &str, args: &[String]) -> VolumeResult<CommandResult>;

    /// Forward stdout line by line into `lines` until the process exits.
    ///
    /// Resolves with the exit code once the output stream is closed.
    async fn execute_streaming(
        &self,
        program: &str,
        args: &[String],
        lines: mpsc::Sender<String>,
    ) -> VolumeResult<Option<i32>>;
}

/// Human readable rendering of an invocation, for logs and error messages
pub fn describe(program: &str, args: &[String]) -> String {
    let mut out = program.to_string();
    for arg in args {
        out.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            out.push_str(&format!("{:?}", arg));
        } else {
            out.push_str(arg);
        }
    }
    out
}

/// [`CommandRunner`] backed by real child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    fn command(program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn execute(&self, program: &str, args: &[String]) -> VolumeResult<CommandResult> {
        debug!("exec: {}", describe(program, args));

        let child = Self::command(program, args)
            .spawn()
            .map_err(|source| VolumeError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it
        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| VolumeError::Timeout {
                    command: describe(program, args),
                    limit,
                })?,
            None => child.wait_with_output().await,
        };

        let output = waited.map_err(|e| VolumeError::CommandFailed {
            context: describe(program, args),
            exit_code: None,
            stderr: e.to_string(),
        })?;

        let result = CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        };

        if !result.success() {
            debug!(
                "exit {:?} from {}: {}",
                result.exit_code,
                program,
                result.stderr.trim()
            );
        }

        Ok(result)
    }

    async fn execute_streaming(
        &self,
        program: &str,
        args: &[String],
        lines: mpsc::Sender<String>,
    ) -> VolumeResult<Option<i32>> {
        debug!("stream: {}", describe(program, args));

        let mut child = Self::command(program, args)
            .spawn()
            .map_err(|source| VolumeError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| VolumeError::CommandFailed {
            context: describe(program, args),
            exit_code: None,
            stderr: "stdout was not captured".to_string(),
        })?;

        // Drain stderr on the side so a chatty process never blocks on a full pipe
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut reader = BufReader::new(stdout).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if lines.send(line).await.is_err() {
                        // Nobody is listening anymore
                        let _ = child.start_kill();
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("error reading output of {}: {}", program, e);
                    break;
                }
            }
        }

        let status = child.wait().await.map_err(|e| VolumeError::CommandFailed {
            context: describe(program, args),
            exit_code: None,
            stderr: e.to_string(),
        })?;

        if let Some(task) = stderr_task {
            if let Ok(stderr) = task.await {
                if !stderr.trim().is_empty() {
                    debug!("{} stderr: {}", program, stderr.trim());
                }
            }
        }

        Ok(status.code())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Typed access to the runtime CLI
#[derive(Clone)]
pub struct DockerCli {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl DockerCli {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    /// Run a CLI command, returning the raw result whatever the exit code
    pub async fn run(&self, args: &[String]) -> VolumeResult<CommandResult> {
        self.runner.execute(&self.binary, args).await
    }

    /// Run a CLI command and return stdout, failing on a nonzero exit
    pub async fn run_checked(&self, args: &[String], context: &str) -> VolumeResult<String> {
        Ok(self.run(args).await?.check(context)?.stdout)
    }

    /// Stream stdout lines of a long-running CLI command
    pub async fn stream(
        &self,
        args: &[String],
        lines: mpsc::Sender<String>,
    ) -> VolumeResult<Option<i32>> {
        self.runner.execute_streaming(&self.binary, args, lines).await
    }

    pub async fn volume_exists(&self, name: &str) -> VolumeResult<bool> {
        let result = self
            .run(&args(&["volume", "inspect", "--format", "{{.Name}}", name]))
            .await?;

        if result.success() {
            return Ok(true);
        }
        if result.daemon_unreachable() {
            return Err(VolumeError::RuntimeUnavailable(result.stderr.trim().to_string()));
        }
        Ok(false)
    }

    pub async fn create_volume(&self, name: &str) -> VolumeResult<()> {
        self.run_checked(
            &args(&["volume", "create", name]),
            &format!("create volume {}", name),
        )
        .await?;
        Ok(())
    }

    /// Remove a volume; the runtime itself refuses volumes that are in use
    pub async fn remove_volume(&self, name: &str) -> VolumeResult<()> {
        let result = self.run(&args(&["volume", "rm", name])).await?;

        if result.no_such_volume() {
            return Err(VolumeError::NotFound(format!("volume {} does not exist", name)));
        }
        if !result.success() && result.stderr.contains("in use") {
            return Err(VolumeError::conflict(format!(
                "volume {} is in use: {}",
                name,
                result.stderr.trim()
            )));
        }

        result.check(&format!("remove volume {}", name))?;
        Ok(())
    }

    pub async fn image_exists(&self, image: &str) -> VolumeResult<bool> {
        let result = self
            .run(&args(&["image", "inspect", "--format", "{{.Id}}", image]))
            .await?;

        if result.success() {
            return Ok(true);
        }
        if result.daemon_unreachable() {
            return Err(VolumeError::RuntimeUnavailable(result.stderr.trim().to_string()));
        }
        Ok(false)
    }

    /// Names of all containers (running or not) that mount the volume
    pub async fn containers_using(&self, volume: &str) -> VolumeResult<Vec<String>> {
        let stdout = self
            .run_checked(
                &args(&[
                    "ps",
                    "--all",
                    "--filter",
                    &format!("volume={}", volume),
                    "--format",
                    "{{.Names}}",
                ]),
                &format!("list containers using {}", volume),
            )
            .await?;

        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}
