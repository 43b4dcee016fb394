//! Process management layer
//!
//! Starts the build server as a detached, long-lived child. The server gets
//! its own stdio (stdin closed, stdout and stderr appended to a log file) so
//! it never competes with the protocol traffic on the launcher's stdio, and
//! it keeps running after the launcher exits.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{info, trace, warn};

// ============================================================================
// Process State Management
// ============================================================================

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited or was killed
    Exited { status: Option<ExitStatus> },
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open server log {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,
}

/// A build server child process
pub struct ServerProcess {
    /// Executable to run
    command: PathBuf,

    /// Command arguments
    args: Vec<String>,

    /// File receiving the server's stdout and stderr
    log_path: Option<PathBuf>,

    state: ProcessState,

    child: Option<Child>,
}

impl ServerProcess {
    /// Create a new, not yet started, server process
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            log_path: None,
            state: ProcessState::NotStarted,
            child: None,
        }
    }

    /// Append the server's output to `path` instead of discarding it
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    fn output_stdio(&self) -> Result<(Stdio, Stdio), ProcessError> {
        let Some(path) = &self.log_path else {
            return Ok((Stdio::null(), Stdio::null()));
        };

        let open = || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| ProcessError::LogFile {
                    path: path.clone(),
                    source,
                })
        };

        Ok((Stdio::from(open()?), Stdio::from(open()?)))
    }

    /// Spawn the process
    pub fn start(&mut self) -> Result<u32, ProcessError> {
        if self.state != ProcessState::NotStarted {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting server process: {} {:?}", self.command.display(), self.args);

        let (stdout, stderr) = self.output_stdio()?;
        let child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;
        info!("Server process started with PID: {}", pid);

        self.state = ProcessState::Running { pid };
        self.child = Some(child);
        Ok(pid)
    }

    /// Non-blocking check whether the process has exited
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        let child = self.child.as_mut().ok_or(ProcessError::NotStarted)?;

        match child.try_wait()? {
            Some(status) => {
                trace!("ServerProcess: exited with {}", status);
                self.state = ProcessState::Exited {
                    status: Some(status),
                };
                self.child = None;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// Kill the process and reap it
    pub async fn kill(&mut self) -> Result<(), ProcessError> {
        let mut child = self.child.take().ok_or(ProcessError::NotStarted)?;

        if let Some(pid) = self.state.pid() {
            info!("Killing server process with PID: {}", pid);
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill server process: {}", e);
            return Err(e.into());
        }

        self.state = ProcessState::Exited { status: None };
        Ok(())
    }

    /// Let the process outlive this handle
    pub fn detach(mut self) -> Option<u32> {
        let pid = self.state.pid();
        if let Some(child) = self.child.take() {
            trace!("ServerProcess: detaching PID {:?}", pid);
            drop(child);
        }
        pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_and_observe_exit() {
        let mut process = ServerProcess::new("sh", vec!["-c".to_string(), "exit 3".to_string()]);
        assert_eq!(process.state(), &ProcessState::NotStarted);

        process.start().unwrap();
        assert!(process.state().is_running());

        let mut status = None;
        for _ in 0..100 {
            status = process.try_exit_status().unwrap();
            if status.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(status.and_then(|s| s.code()), Some(3));
        assert!(!process.state().is_running());
    }

    #[tokio::test]
    async fn test_output_goes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");

        let mut process = ServerProcess::new(
            "sh",
            vec!["-c".to_string(), "echo out; echo err >&2".to_string()],
        )
        .with_log_file(&log);
        process.start().unwrap();

        for _ in 0..100 {
            if process.try_exit_status().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("out"));
        assert!(contents.contains("err"));
    }

    #[tokio::test]
    async fn test_kill_running_process() {
        let mut process = ServerProcess::new("sleep", vec!["30".to_string()]);
        process.start().unwrap();

        process.kill().await.unwrap();

        assert_eq!(process.state(), &ProcessState::Exited { status: None });
        assert!(matches!(process.kill().await, Err(ProcessError::NotStarted)));
    }

    #[tokio::test]
    async fn test_invalid_operations() {
        let mut process = ServerProcess::new("sleep", vec!["30".to_string()]);
        assert!(matches!(
            process.try_exit_status(),
            Err(ProcessError::NotStarted)
        ));

        process.start().unwrap();
        assert!(matches!(process.start(), Err(ProcessError::AlreadyStarted)));

        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_names_command() {
        let mut process = ServerProcess::new("/nonexistent/bsp-server", Vec::new());
        let err = process.start().unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/bsp-server"));
    }

    #[test]
    fn test_process_state_methods() {
        let running = ProcessState::Running { pid: 12345 };
        assert!(running.is_running());
        assert_eq!(running.pid(), Some(12345));

        let exited = ProcessState::Exited { status: None };
        assert!(!exited.is_running());
        assert!(exited.pid().is_none());
    }
}
