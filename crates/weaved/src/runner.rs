//! Execution Runner (spec Section 4.4).
//!
//! Binds the process supervisor, agent adapter registry, output normalizer,
//! and event bus/transport into the single-execution lifecycle. Generalizes
//! the teacher's per-phase Claude CLI invocation (previously this file's only
//! content) and `Scheduler::claim_next_run` concurrency/claim discipline
//! (semaphore + claim-lock + `std::mem::forget(permit)` to hold a slot across
//! an async execution's lifetime, `scheduler.rs`) into a lifecycle decoupled
//! from the teacher's fixed five-phase pipeline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use weave_core::{AgUiEvent, AgUiEventType, Config, Execution, ExecutionStatus, Id};

use crate::adapters::{AdapterError, AdapterRegistry, AgentConfig};
use crate::eventbus::EventBuffer;
use crate::normalizer::Normalizer;
use crate::process::{OutputLine, ProcessError, ProcessHandle, ProcessSupervisor};
use crate::storage::{Storage, StorageError};
use crate::transport::TransportManager;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("agent {0} is not available on this host")]
    AdapterUnavailable(String),
    #[error("agent {0} does not support session resume")]
    ResumeNotSupported(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Runner-wide defaults resolved from daemon config. Grounded in the
/// teacher's `Config::model`/`claude_timeout_sec`/`claude_retries` fields
/// (`weave-core/src/config.rs`), generalized across agent types.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub model: String,
    pub timeout_sec: u32,
    pub retries: u32,
    pub retry_backoff_sec: u32,
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            timeout_sec: config.agent_timeout_sec,
            retries: config.agent_retries,
            retry_backoff_sec: config.agent_retry_backoff_sec,
        }
    }
}

/// Everything the runner needs to launch one execution.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub agent_type: String,
    pub model: String,
    pub prompt: String,
    pub work_dir: PathBuf,
}

/// Binds process supervision, the adapter registry, the normalizer, and the
/// event bus/transport into the execution lifecycle of spec Section 4.4.
pub struct Runner {
    storage: Arc<Storage>,
    events: Arc<EventBuffer>,
    transport: Arc<TransportManager>,
    processes: Arc<ProcessSupervisor>,
    adapters: Arc<AdapterRegistry>,
    config: RunnerConfig,
    /// Tracked running processes, keyed by execution id, for `cancel`.
    active: Mutex<HashMap<Id, Arc<ProcessHandle>>>,
}

impl Runner {
    pub fn new(
        storage: Arc<Storage>,
        events: Arc<EventBuffer>,
        transport: Arc<TransportManager>,
        processes: Arc<ProcessSupervisor>,
        adapters: Arc<AdapterRegistry>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            storage,
            events,
            transport,
            processes,
            adapters,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    async fn emit(&self, execution_id: &Id, event: AgUiEvent) {
        self.events.add_event(execution_id, event.clone()).await;
        self.transport.broadcast_to_run(execution_id, event).await;
    }

    fn new_event(execution_id: &Id, event_type: AgUiEventType) -> AgUiEvent {
        AgUiEvent::new(event_type, execution_id.clone(), Utc::now().timestamp_millis())
    }

    /// Run one execution to completion. Never leaves the execution `running`
    /// once this returns, even on internal error (spec Section 4.4 step 8).
    pub async fn run(&self, execution: &Execution, task: ExecutionTask) -> Result<ExecutionStatus> {
        let execution_id = execution.id.clone();

        let available = self.adapters.check_availability(&task.agent_type)?;
        if !available {
            return Err(RunnerError::AdapterUnavailable(task.agent_type));
        }

        self.emit(&execution_id, Self::new_event(&execution_id, AgUiEventType::RunStarted))
            .await;

        let snapshot = Self::new_event(&execution_id, AgUiEventType::StateSnapshot)
            .with_field("status", json!(ExecutionStatus::Running.as_str()))
            .with_field("model", json!(task.model.clone()))
            .with_field("agent_type", json!(task.agent_type.clone()))
            .with_field("workspace_root", json!(task.work_dir.to_string_lossy()));
        self.emit(&execution_id, snapshot).await;

        self.storage
            .update_execution_lifecycle(&execution_id, ExecutionStatus::Running, Some(Utc::now()), None, None)
            .await?;

        let result = self.run_inner(&execution_id, &task).await;

        let final_status = match &result {
            Ok(()) => ExecutionStatus::Completed,
            Err(_) => ExecutionStatus::Failed,
        };
        let error_message = result.as_ref().err().map(std::string::ToString::to_string);

        self.storage
            .update_execution_lifecycle(
                &execution_id,
                final_status,
                None,
                Some(Utc::now()),
                error_message.as_deref(),
            )
            .await?;

        match &result {
            Ok(()) => {
                self.emit(&execution_id, Self::new_event(&execution_id, AgUiEventType::RunFinished))
                    .await;
            }
            Err(e) => {
                let event = Self::new_event(&execution_id, AgUiEventType::RunError)
                    .with_field("error", json!(e.to_string()));
                self.emit(&execution_id, event).await;
            }
        }

        self.active.lock().await.remove(&execution_id);

        result.map(|()| final_status)
    }

    async fn run_inner(&self, execution_id: &Id, task: &ExecutionTask) -> Result<()> {
        let agent_config = AgentConfig {
            agent_type: task.agent_type.clone(),
            model: task.model.clone(),
            prompt: task.prompt.clone(),
            work_dir: task.work_dir.clone(),
            timeout_sec: self.config.timeout_sec,
            retries: self.config.retries,
            retry_backoff_sec: self.config.retry_backoff_sec,
        };
        let process_config = self.adapters.build_process_config(&agent_config)?;
        let handle = self.processes.acquire_process(&process_config).await?;
        self.active.lock().await.insert(execution_id.clone(), handle.clone());

        let mut normalizer = Normalizer::new(execution_id.clone(), task.model.clone());
        let mut persisted_tool_calls = 0usize;
        let mut persisted_file_changes = 0usize;

        let drain = async {
            loop {
                let line = {
                    let mut lines = handle.lines.lock().await;
                    lines.recv().await
                };
                let Some(line) = line else { break };
                match line {
                    OutputLine::Stdout(text) => {
                        for entry in normalizer.feed_line(&text) {
                            if let Err(e) = self.storage.insert_normalized_entry(&entry).await {
                                tracing::warn!(execution_id = %execution_id, error = %e, "failed to persist normalized entry");
                            }
                            let event = Self::new_event(execution_id, AgUiEventType::TextMessageContent)
                                .with_field("kind", json!(entry.kind.as_str()))
                                .with_field("payload", json!(entry.payload_json));
                            self.emit(execution_id, event).await;
                        }

                        let tool_calls: Vec<_> = normalizer.tool_calls().collect();
                        for call in tool_calls.iter().skip(persisted_tool_calls) {
                            if let Err(e) = self.storage.upsert_tool_call(call).await {
                                tracing::warn!(execution_id = %execution_id, error = %e, "failed to persist tool call");
                            }
                        }
                        persisted_tool_calls = tool_calls.len();

                        let file_changes = normalizer.file_changes();
                        for change in &file_changes[persisted_file_changes..] {
                            if let Err(e) = self.storage.insert_file_change(execution_id, change).await {
                                tracing::warn!(execution_id = %execution_id, error = %e, "failed to persist file change");
                            }
                        }
                        persisted_file_changes = file_changes.len();
                    }
                    OutputLine::Stderr(text) => {
                        tracing::debug!(execution_id = %execution_id, stderr = %text, "agent stderr");
                    }
                }
            }
        };

        let (_, exit_code) = tokio::join!(drain, handle.wait());
        let exit_code = exit_code?;

        self.processes.release_process(&handle).await.ok();

        if exit_code == 0 {
            Ok(())
        } else {
            Err(RunnerError::Process(ProcessError::SignalFailed(std::io::Error::other(format!(
                "agent exited with code {exit_code}"
            )))))
        }
    }

    /// Resume a stream-capable agent session. Fails immediately if the
    /// adapter doesn't advertise `supports_session_resume` (spec Section 4.4).
    pub async fn resume_with_lifecycle(
        &self,
        execution: &Execution,
        agent_type: &str,
        _session_id: &str,
        task: ExecutionTask,
    ) -> Result<ExecutionStatus> {
        let adapter = self.adapters.get(agent_type)?;
        if !adapter.supports_session_resume() {
            return Err(RunnerError::ResumeNotSupported(agent_type.to_string()));
        }
        self.run(execution, task).await
    }

    /// Send SIGTERM to the tracked process for `execution_id`, mark it
    /// `stopped`, and broadcast. Safe to call on a non-running execution.
    pub async fn cancel(&self, execution_id: &Id) -> Result<()> {
        if let Some(handle) = self.active.lock().await.get(execution_id).cloned() {
            handle.kill().await?;
        }
        self.storage
            .update_execution_status(execution_id, ExecutionStatus::Stopped)
            .await?;
        let event = Self::new_event(execution_id, AgUiEventType::RunFinished)
            .with_field("status", json!("stopped"));
        self.emit(execution_id, event).await;
        Ok(())
    }
}
