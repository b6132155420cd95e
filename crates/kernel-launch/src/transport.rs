//! Long-lived process transport for the marimo server.
//!
//! A transport runs one shell command at a time and can re-attach to a
//! process launched by an earlier run of the host (matched by pid). All
//! operations take the same lock, so commands are never dispatched
//! concurrently.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::process::{pid_is_alive, terminate_pid};

/// Grace period between SIGTERM and a hard kill.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Errors from launching or stopping the server process.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Spawned process has no pid (exited immediately?)")]
    NoPid,

    #[error("Failed to stop process {pid}: {source}")]
    Stop {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Runs a long-lived shell command and supports recovering a previously
/// launched instance by pid.
#[async_trait]
pub trait ProcessTransport: Send + Sync {
    /// Launch `command`, stopping whatever this transport was running first.
    /// Returns the pid of the new process.
    async fn spawn(&self, command: &str) -> Result<u32, LaunchError>;

    /// Adopt a process started by an earlier run. Returns `false` when no
    /// such process is alive.
    async fn attach(&self, pid: u32) -> Result<bool, LaunchError>;

    /// Stop the current process, if any. Stopping an idle transport is a no-op.
    async fn stop(&self) -> Result<(), LaunchError>;

    /// Pid of the current process.
    async fn pid(&self) -> Option<u32>;

    /// Whether the current process is still alive.
    async fn is_running(&self) -> bool;
}

enum Launched {
    Owned {
        child: Child,
        pid: u32,
        log_tasks: Vec<JoinHandle<()>>,
    },
    Attached {
        pid: u32,
    },
}

impl Launched {
    fn pid(&self) -> u32 {
        match self {
            Launched::Owned { pid, .. } | Launched::Attached { pid } => *pid,
        }
    }
}

/// Transport that runs the command through the platform shell.
pub struct ShellTransport {
    cwd: Option<PathBuf>,
    current: Mutex<Option<Launched>>,
}

impl ShellTransport {
    pub fn new(cwd: Option<PathBuf>) -> Self {
        Self {
            cwd,
            current: Mutex::new(None),
        }
    }

    fn shell_command(command: &str) -> Command {
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", command]);
            cmd
        }

        #[cfg(not(windows))]
        {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        }
    }

    async fn stop_launched(launched: Launched) -> Result<(), LaunchError> {
        match launched {
            Launched::Owned {
                mut child,
                pid,
                log_tasks,
            } => {
                info!("[transport] Stopping process {}", pid);
                terminate_pid(pid).map_err(|source| LaunchError::Stop { pid, source })?;
                match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                    Ok(Ok(status)) => debug!("[transport] Process {} exited: {}", pid, status),
                    Ok(Err(e)) => warn!("[transport] Failed to reap {}: {}", pid, e),
                    Err(_) => {
                        warn!("[transport] Process {} ignored SIGTERM, killing", pid);
                        child
                            .kill()
                            .await
                            .map_err(|source| LaunchError::Stop { pid, source })?;
                    }
                }
                for task in log_tasks {
                    task.abort();
                }
                Ok(())
            }
            Launched::Attached { pid } => {
                info!("[transport] Stopping recovered process {}", pid);
                terminate_pid(pid).map_err(|source| LaunchError::Stop { pid, source })
            }
        }
    }
}

impl Default for ShellTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Forward a child's output stream into the log, line by line.
fn forward_output<R>(reader: R, pid: u32) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!("[marimo:{}] {}", pid, line),
                Ok(None) => break,
                Err(e) => {
                    debug!("[marimo:{}] output closed: {}", pid, e);
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl ProcessTransport for ShellTransport {
    async fn spawn(&self, command: &str) -> Result<u32, LaunchError> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            Self::stop_launched(previous).await?;
        }

        let mut cmd = Self::shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        info!("[transport] Running: {}", command);
        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let pid = child.id().ok_or(LaunchError::NoPid)?;

        let mut log_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(forward_output(stdout, pid));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(forward_output(stderr, pid));
        }

        *current = Some(Launched::Owned {
            child,
            pid,
            log_tasks,
        });
        Ok(pid)
    }

    async fn attach(&self, pid: u32) -> Result<bool, LaunchError> {
        let mut current = self.current.lock().await;
        if !pid_is_alive(pid) {
            debug!("[transport] Process {} is gone, nothing to attach", pid);
            return Ok(false);
        }
        if let Some(previous) = current.take() {
            if previous.pid() != pid {
                Self::stop_launched(previous).await?;
            }
        }
        info!("[transport] Attached to process {}", pid);
        *current = Some(Launched::Attached { pid });
        Ok(true)
    }

    async fn stop(&self) -> Result<(), LaunchError> {
        let mut current = self.current.lock().await;
        match current.take() {
            Some(launched) => Self::stop_launched(launched).await,
            None => Ok(()),
        }
    }

    async fn pid(&self) -> Option<u32> {
        self.current.lock().await.as_ref().map(Launched::pid)
    }

    async fn is_running(&self) -> bool {
        let mut current = self.current.lock().await;
        match current.as_mut() {
            Some(Launched::Owned { child, .. }) => matches!(child.try_wait(), Ok(None)),
            Some(Launched::Attached { pid }) => pid_is_alive(*pid),
            None => false,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let transport = ShellTransport::default();
        let pid = transport.spawn("sleep 30").await.unwrap();
        assert_eq!(transport.pid().await, Some(pid));
        assert!(transport.is_running().await);

        transport.stop().await.unwrap();
        assert_eq!(transport.pid().await, None);
        assert!(!transport.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let transport = ShellTransport::default();
        transport.stop().await.unwrap();
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_replaces_previous() {
        let transport = ShellTransport::default();
        let first = transport.spawn("sleep 30").await.unwrap();
        let second = transport.spawn("sleep 30").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(transport.pid().await, Some(second));
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_process_is_not_running() {
        let transport = ShellTransport::default();
        transport.spawn("exit 0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!transport.is_running().await);
    }

    #[tokio::test]
    async fn test_attach_to_dead_pid() {
        let transport = ShellTransport::default();
        // Pids are never this large on Linux or macOS.
        assert!(!transport.attach(u32::MAX / 2).await.unwrap());
        assert_eq!(transport.pid().await, None);
    }
}
