use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use render_gateway_error::GatewayError;
use tokio::sync::mpsc;
use tokio::time::sleep;

const MONITOR_DELAY_MS: u64 = 100;

/// What to start and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    /// Shell-like rendering used for the session `cmd` link.
    pub fn command_line(&self) -> String {
        let mut line = self.executable.to_string_lossy().replace('\\', "/");
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(pid: u32, status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            pid,
            code: status.code(),
            signal,
        }
    }
}

/// Shared handle to a spawned child. Dropping it leaves the process running.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    child: Arc<StdMutex<Option<Child>>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Sends a kill. The exit is still reported by the monitor; calling this
    /// on a process that already exited does nothing.
    pub fn terminate(&self) {
        let Ok(mut guard) = self.child.lock() else {
            return;
        };
        if let Some(child) = guard.as_mut() {
            if let Err(err) = child.kill() {
                tracing::debug!(pid = self.pid, error = %err, "kill failed");
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        match self.child.lock() {
            Ok(guard) => guard.is_some(),
            Err(_) => false,
        }
    }
}

/// Spawns runtime processes and reports their exits on one channel.
#[derive(Debug, Clone)]
pub struct Supervisor {
    exits: mpsc::UnboundedSender<ProcessExit>,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessExit>) {
        Self::with_poll_interval(Duration::from_millis(MONITOR_DELAY_MS))
    }

    pub fn with_poll_interval(
        poll_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessExit>) {
        let (exits, rx) = mpsc::unbounded_channel();
        (
            Self {
                exits,
                poll_interval,
            },
            rx,
        )
    }

    pub fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle, GatewayError> {
        tracing::info!(
            executable = %spec.executable.display(),
            args = ?spec.args,
            "launching runtime"
        );
        let child = Command::new(&spec.executable)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .spawn()
            .map_err(|err| {
                tracing::error!(
                    executable = %spec.executable.display(),
                    error = %err,
                    "failed to spawn runtime"
                );
                GatewayError::SpawnFailed {
                    executable: spec.executable.display().to_string(),
                    message: err.to_string(),
                }
            })?;

        let handle = ProcessHandle {
            pid: child.id(),
            child: Arc::new(StdMutex::new(Some(child))),
        };
        self.spawn_monitor_task(handle.clone());
        Ok(handle)
    }

    fn spawn_monitor_task(&self, handle: ProcessHandle) {
        let exits = self.exits.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            loop {
                let status = {
                    let mut guard = match handle.child.lock() {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                    let status = match guard.as_mut() {
                        Some(child) => match child.try_wait() {
                            Ok(status) => status,
                            Err(_) => None,
                        },
                        None => return,
                    };
                    if status.is_some() {
                        *guard = None;
                    }
                    status
                };

                if let Some(status) = status {
                    let exit = ProcessExit::from_status(handle.pid, status);
                    tracing::warn!(
                        pid = exit.pid,
                        code = ?exit.code,
                        signal = ?exit.signal,
                        "runtime exited"
                    );
                    let _ = exits.send(exit);
                    return;
                }

                sleep(poll_interval).await;
            }
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(executable: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            executable: PathBuf::from(executable),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            working_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn reports_natural_exit_code() {
        let (supervisor, mut exits) = Supervisor::with_poll_interval(Duration::from_millis(10));
        let handle = supervisor
            .spawn(&spec("/bin/sh", &["-c", "exit 3"]))
            .expect("spawn");
        let exit = tokio::time::timeout(Duration::from_secs(5), exits.recv())
            .await
            .expect("exit in time")
            .expect("exit");
        assert_eq!(exit.pid, handle.pid());
        assert_eq!(exit.code, Some(3));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn terminate_is_reported_and_idempotent() {
        let (supervisor, mut exits) = Supervisor::with_poll_interval(Duration::from_millis(10));
        let handle = supervisor
            .spawn(&spec("/bin/sh", &["-c", "sleep 30"]))
            .expect("spawn");
        assert!(handle.is_alive());
        handle.terminate();
        handle.terminate();
        let exit = tokio::time::timeout(Duration::from_secs(5), exits.recv())
            .await
            .expect("exit in time")
            .expect("exit");
        assert_eq!(exit.pid, handle.pid());
        assert_eq!(exit.signal, Some(9));
        handle.terminate();
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let (supervisor, _exits) = Supervisor::new();
        let err = supervisor
            .spawn(&spec("/definitely/not/here", &[]))
            .expect_err("spawn must fail");
        assert!(matches!(err, GatewayError::SpawnFailed { .. }));
    }

    #[test]
    fn command_line_joins_arguments() {
        let spec = spec("/opt/runtime", &["--port", "16050"]);
        assert_eq!(spec.command_line(), "/opt/runtime --port 16050");
    }
}
