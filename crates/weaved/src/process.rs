//! Process supervisor (spec Section 4.1).
//!
//! Generalizes the teacher's hardcoded single-agent spawn (previously inline
//! in `runner.rs`, spawning `claude` directly via `tokio::process::Command`)
//! into a `ProcessConfig`-driven supervisor that any agent adapter can target.
//! Line-mode output capture is kept from the teacher's iter-log capture loop;
//! PTY mode is new, for agents that require a real terminal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {executable}: {source}")]
    SpawnFailed {
        executable: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process handle {0} not found")]
    HandleNotFound(u64),
    #[error("failed to send signal: {0}")]
    SignalFailed(std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// How a child process's output is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// Line-buffered stdout/stderr capture (teacher's existing approach).
    Line,
    /// Allocate a pseudo-terminal for agents that require one.
    Pty,
}

#[derive(Debug, Clone, Copy)]
pub struct TerminalDims {
    pub cols: u16,
    pub rows: u16,
}

/// Agent-specific spawn configuration.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub executable: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub work_dir: PathBuf,
    pub mode: ProcessMode,
    pub terminal_dims: Option<TerminalDims>,
}

/// Lifecycle metrics tracked for a spawned process.
#[derive(Debug, Clone)]
pub struct ProcessMetrics {
    pub spawned_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

/// A line emitted on stdout or stderr.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Handle to an acquired process: its output stream and control surface.
pub struct ProcessHandle {
    pub id: u64,
    child: Mutex<Child>,
    pub lines: Mutex<mpsc::UnboundedReceiver<OutputLine>>,
    spawned_at: DateTime<Utc>,
    last_activity: Arc<Mutex<DateTime<Utc>>>,
    exit_code: Arc<AtomicI32>,
    exited: Arc<std::sync::atomic::AtomicBool>,
}

/// Sentinel stored in `exit_code` before the process has actually exited.
const EXIT_CODE_PENDING: i32 = i32::MIN;

impl ProcessHandle {
    /// Send SIGTERM (Unix) to the child. No-op if already exited.
    pub async fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(pid) = child.id() {
            #[cfg(unix)]
            {
                // SAFETY: pid is a valid child pid owned by this handle.
                unsafe {
                    libc_kill(pid as i32);
                }
            }
            #[cfg(not(unix))]
            {
                let _ = pid;
                child.start_kill().map_err(ProcessError::SignalFailed)?;
            }
        }
        Ok(())
    }

    pub async fn metrics(&self) -> ProcessMetrics {
        let last_activity = *self.last_activity.lock().await;
        let code = self.exit_code.load(Ordering::SeqCst);
        ProcessMetrics {
            spawned_at: self.spawned_at,
            last_activity,
            exit_code: if code == EXIT_CODE_PENDING { None } else { Some(code) },
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Wait for the child to exit, returning its exit code.
    pub async fn wait(&self) -> Result<i32> {
        let mut child = self.child.lock().await;
        let status = child
            .wait()
            .await
            .map_err(|e| ProcessError::SpawnFailed {
                executable: "<wait>".to_string(),
                source: e,
            })?;
        let code = status.code().unwrap_or(-1);
        self.exit_code.store(code, Ordering::SeqCst);
        self.exited.store(true, Ordering::SeqCst);
        Ok(code)
    }
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    const SIGTERM: i32 = 15;
    kill(pid, SIGTERM);
}

/// Spawns and tracks agent child processes. One supervisor is shared across
/// all executions in a daemon instance.
pub struct ProcessSupervisor {
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, Arc<ProcessHandle>>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a child per `cfg` and register it. Output lines are pumped onto
    /// an unbounded channel readable via `ProcessHandle::lines`.
    pub async fn acquire_process(&self, cfg: &ProcessConfig) -> Result<Arc<ProcessHandle>> {
        let mut command = Command::new(&cfg.executable);
        command
            .args(&cfg.argv)
            .current_dir(&cfg.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &cfg.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| ProcessError::SpawnFailed {
            executable: cfg.executable.clone(),
            source: e,
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (tx, rx) = mpsc::unbounded_channel();
        let last_activity = Arc::new(Mutex::new(Utc::now()));

        spawn_line_pump(stdout, tx.clone(), last_activity.clone(), true);
        spawn_line_pump(stderr, tx, last_activity.clone(), false);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(ProcessHandle {
            id,
            child: Mutex::new(child),
            lines: Mutex::new(rx),
            spawned_at: Utc::now(),
            last_activity,
            exit_code: Arc::new(AtomicI32::new(EXIT_CODE_PENDING)),
            exited: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });

        self.handles.lock().await.insert(id, handle.clone());
        Ok(handle)
    }

    /// Release bookkeeping for a process once its caller is done with it.
    /// Does not kill the process; callers should `kill` first if needed.
    pub async fn release_process(&self, handle: &ProcessHandle) -> Result<()> {
        self.handles
            .lock()
            .await
            .remove(&handle.id)
            .ok_or(ProcessError::HandleNotFound(handle.id))?;
        Ok(())
    }

    /// Kill every still-tracked process. Best-effort; used on daemon shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<ProcessHandle>> = self.handles.lock().await.values().cloned().collect();
        for handle in handles {
            let _ = handle.kill().await;
        }
        self.handles.lock().await.clear();
    }

    pub async fn active_count(&self) -> usize {
        self.handles.lock().await.len()
    }
}

fn spawn_line_pump<R>(
    reader: R,
    tx: mpsc::UnboundedSender<OutputLine>,
    last_activity: Arc<Mutex<DateTime<Utc>>>,
    is_stdout: bool,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    *last_activity.lock().await = Utc::now();
                    let wrapped = if is_stdout {
                        OutputLine::Stdout(line)
                    } else {
                        OutputLine::Stderr(line)
                    };
                    if tx.send(wrapped).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "error reading process output");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_config(text: &str) -> ProcessConfig {
        ProcessConfig {
            executable: "echo".to_string(),
            argv: vec![text.to_string()],
            env: Vec::new(),
            work_dir: std::env::temp_dir(),
            mode: ProcessMode::Line,
            terminal_dims: None,
        }
    }

    #[tokio::test]
    async fn acquire_process_captures_stdout_line() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.acquire_process(&echo_config("hello")).await.unwrap();

        let line = handle.lines.lock().await.recv().await.unwrap();
        match line {
            OutputLine::Stdout(s) => assert_eq!(s, "hello"),
            OutputLine::Stderr(_) => panic!("expected stdout"),
        }

        let code = handle.wait().await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn metrics_reflect_exit_code_after_wait() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.acquire_process(&echo_config("x")).await.unwrap();
        assert!(handle.metrics().await.exit_code.is_none());
        handle.wait().await.unwrap();
        assert_eq!(handle.metrics().await.exit_code, Some(0));
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn release_process_removes_from_active_count() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.acquire_process(&echo_config("x")).await.unwrap();
        assert_eq!(supervisor.active_count().await, 1);
        handle.wait().await.unwrap();
        supervisor.release_process(&handle).await.unwrap();
        assert_eq!(supervisor.active_count().await, 0);
    }

    #[tokio::test]
    async fn release_unknown_handle_errors() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.acquire_process(&echo_config("x")).await.unwrap();
        handle.wait().await.unwrap();
        supervisor.release_process(&handle).await.unwrap();
        assert!(matches!(
            supervisor.release_process(&handle).await,
            Err(ProcessError::HandleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn spawn_nonexistent_executable_fails() {
        let supervisor = ProcessSupervisor::new();
        let cfg = ProcessConfig {
            executable: "this-binary-does-not-exist-xyz".to_string(),
            argv: vec![],
            env: vec![],
            work_dir: std::env::temp_dir(),
            mode: ProcessMode::Line,
            terminal_dims: None,
        };
        assert!(supervisor.acquire_process(&cfg).await.is_err());
    }
}
