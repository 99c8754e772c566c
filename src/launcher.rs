/// Server launch: resolve the entry script, build the command line, spawn the
/// interpreter with captured output, and hand the output to the log watcher.
use crate::config::{ConfigError, LaunchConfig};
use crate::watcher::{self, ConsoleSink, DetectedEndpoint, WatchSummary};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Entry scripts, most preferred first.
pub const ENTRY_POINTS: [&str; 2] = ["main.py", "server.py"];

/// How long to wait after spawning before declaring the start successful.
const EARLY_EXIT_CHECK: Duration = Duration::from_millis(200);

/// Upper bound on draining output from a process that already exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace period between SIGTERM and a hard kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Errors that can occur while starting or stopping the server.
#[derive(Debug)]
pub enum LaunchError {
    /// Configuration was unusable (missing directory or entry script).
    Config(ConfigError),
    /// The interpreter could not be found.
    InterpreterNotFound {
        program: String,
        source: std::io::Error,
    },
    /// Spawning failed for any other reason (permissions, bad cwd...).
    Spawn { source: std::io::Error },
    /// The server exited during the startup check.
    ExitedEarly { code: Option<i32> },
    /// Waiting on or signalling the child failed.
    Io { source: std::io::Error },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Config(e) => write!(f, "{e}"),
            LaunchError::InterpreterNotFound { program, source } => {
                write!(f, "Failed to launch (python not found?): {program}: {source}")
            }
            LaunchError::Spawn { source } => write!(f, "Failed to launch: {source}"),
            LaunchError::ExitedEarly { code: Some(code) } => {
                write!(f, "Server exited immediately with code: {code}")
            }
            LaunchError::ExitedEarly { code: None } => {
                write!(f, "Server exited immediately (killed by signal)")
            }
            LaunchError::Io { source } => write!(f, "I/O error while managing server: {source}"),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Config(e) => Some(e),
            LaunchError::InterpreterNotFound { source, .. } => Some(source),
            LaunchError::Spawn { source } => Some(source),
            LaunchError::Io { source } => Some(source),
            LaunchError::ExitedEarly { .. } => None,
        }
    }
}

impl From<ConfigError> for LaunchError {
    fn from(e: ConfigError) -> Self {
        LaunchError::Config(e)
    }
}

/// Pick the first entry script that exists in `dir`.
pub fn resolve_entry_point(dir: &Path) -> Result<PathBuf, ConfigError> {
    if !dir.is_dir() {
        return Err(ConfigError::MissingWorkingDirectory {
            path: dir.to_path_buf(),
        });
    }
    let candidates: Vec<PathBuf> = ENTRY_POINTS.iter().map(|name| dir.join(name)).collect();
    match candidates.iter().find(|p| p.is_file()) {
        Some(entry) => Ok(entry.clone()),
        None => Err(ConfigError::MissingEntryPoint {
            dir: dir.to_path_buf(),
            candidates,
        }),
    }
}

/// Full command line, interpreter first.
fn build_command_line(config: &LaunchConfig, entry: &Path) -> Vec<String> {
    let mut parts = vec![
        config.interpreter().to_string(),
        // Unbuffered child output so lines arrive as they are printed.
        "-u".to_string(),
        entry.display().to_string(),
        "--listen".to_string(),
        config.bind_ip.clone(),
        "--port".to_string(),
        config.bind_port.to_string(),
    ];
    parts.extend(config.extra_flags.iter().cloned());
    parts
}

#[cfg(windows)]
fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(windows))]
fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Starts servers described by a `LaunchConfig`.
pub struct Launcher {
    config: LaunchConfig,
}

impl Launcher {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// The command that `start` would run. Fails if no entry script exists.
    pub fn command_line(&self) -> Result<Vec<String>, ConfigError> {
        let entry = resolve_entry_point(&self.config.working_directory)?;
        Ok(build_command_line(&self.config, &entry))
    }

    /// Spawn the server in the background and start watching its output.
    ///
    /// Returns once the process has survived a short startup check. Output
    /// keeps flowing to `sink` from a background task; the ready line is
    /// reported there and in `ServerHandle::into_summary`.
    pub async fn start(&self, sink: Arc<dyn ConsoleSink>) -> Result<ServerHandle, LaunchError> {
        let parts = self.command_line()?;
        watcher::status(
            sink.as_ref(),
            &format!("Launching: {}", shell_words::join(&parts)),
        );
        tracing::info!(
            command = %parts[0],
            args = ?&parts[1..],
            cwd = %self.config.working_directory.display(),
            "spawning server"
        );

        let mut cmd = Command::new(&parts[0]);
        cmd.args(&parts[1..])
            .current_dir(&self.config.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LaunchError::InterpreterNotFound {
                    program: parts[0].clone(),
                    source: e,
                }
            } else {
                LaunchError::Spawn { source: e }
            }
        })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "server subprocess started");

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                return Err(LaunchError::Io {
                    source: std::io::Error::other("child output pipes were not captured"),
                })
            }
        };
        let lines = watcher::combined_output(stdout, stderr);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let watch_task = tokio::spawn(watcher::watch(lines, Arc::clone(&sink), Some(endpoint_tx)));

        tokio::time::sleep(EARLY_EXIT_CHECK).await;
        if let Some(status) = child
            .try_wait()
            .map_err(|e| LaunchError::Io { source: e })?
        {
            // Let whatever the server printed reach the console first.
            if tokio::time::timeout(DRAIN_TIMEOUT, watch_task).await.is_err() {
                tracing::debug!(pid, "output still open after early exit");
            }
            tracing::warn!(pid, exit_code = ?status.code(), "server exited during startup");
            return Err(LaunchError::ExitedEarly {
                code: status.code(),
            });
        }

        watcher::status(
            sink.as_ref(),
            &format!("Server process started (PID: {pid}). Waiting for URL..."),
        );

        Ok(ServerHandle {
            child,
            pid,
            watch_task,
            endpoint_rx: Some(endpoint_rx),
        })
    }
}

/// A running server. Dropping the handle kills the process.
pub struct ServerHandle {
    child: Child,
    pid: u32,
    watch_task: JoinHandle<WatchSummary>,
    endpoint_rx: Option<oneshot::Receiver<DetectedEndpoint>>,
}

impl ServerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Receiver for the ready endpoint. Resolves with an error if output
    /// ends without a URL. Can only be taken once.
    #[cfg(test)]
    pub fn take_endpoint(&mut self) -> Option<oneshot::Receiver<DetectedEndpoint>> {
        self.endpoint_rx.take()
    }

    /// Wait for the server to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus, LaunchError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| LaunchError::Io { source: e })?;
        tracing::info!(pid = self.pid, exit_code = ?status.code(), "server exited");
        Ok(status)
    }

    /// Ask the server to stop, then kill it if it has not exited within
    /// the grace period.
    pub async fn stop(&mut self) -> Result<ExitStatus, LaunchError> {
        if let Some(status) = self
            .child
            .try_wait()
            .map_err(|e| LaunchError::Io { source: e })?
        {
            return Ok(status);
        }

        self.terminate()?;
        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(result) => result.map_err(|e| LaunchError::Io { source: e }),
            Err(_) => {
                tracing::warn!(pid = self.pid, "server ignored terminate, killing");
                self.child
                    .kill()
                    .await
                    .map_err(|e| LaunchError::Io { source: e })?;
                self.child
                    .wait()
                    .await
                    .map_err(|e| LaunchError::Io { source: e })
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<(), LaunchError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        tracing::debug!(pid = self.pid, "sending SIGTERM");
        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(LaunchError::Io {
                source: std::io::Error::from(e),
            }),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<(), LaunchError> {
        self.child
            .start_kill()
            .map_err(|e| LaunchError::Io { source: e })
    }

    /// Wait for the output watcher to finish and return what it saw.
    ///
    /// Call after the process has exited. The watcher normally ends when the
    /// output pipes close, but a process the server left behind can keep
    /// them open. After `DRAIN_TIMEOUT` the watcher is abandoned and the
    /// summary carries only the endpoint it already reported (`lines` is 0).
    pub async fn into_summary(mut self) -> WatchSummary {
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut self.watch_task).await {
            Ok(Ok(summary)) => return summary,
            Ok(Err(e)) => tracing::warn!(error = %e, "log watcher task failed"),
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    "output still open after server exit, abandoning log watcher"
                );
                self.watch_task.abort();
            }
        }
        WatchSummary {
            lines: 0,
            endpoint: self.endpoint_rx.and_then(|mut rx| rx.try_recv().ok()),
        }
    }
}
