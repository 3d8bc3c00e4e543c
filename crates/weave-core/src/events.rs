//! Wire-level events and the internal audit-log event taxonomy.
//!
//! `AgUiEvent` is the envelope delivered over SSE/WS (SPEC_FULL.md Section 6.1).
//! `EventType`/`Event` is the internal audit-log row persisted per execution,
//! following the run/step event idiom.

use crate::types::{Id, WatchdogSignal, WorktreeProvider};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type names for the wire-level `AgUiEvent` envelope (Section 6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgUiEventType {
    RunStarted,
    StateSnapshot,
    StepStarted,
    StepFinished,
    StepFailed,
    StepSkipped,
    RunFinished,
    RunError,
    TextMessageStart,
    TextMessageContent,
    TextMessageEnd,
    ToolCallStart,
    ToolCallArgs,
    ToolCallEnd,
    ToolCallResult,
}

impl AgUiEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "RUN_STARTED",
            Self::StateSnapshot => "STATE_SNAPSHOT",
            Self::StepStarted => "STEP_STARTED",
            Self::StepFinished => "STEP_FINISHED",
            Self::StepFailed => "STEP_FAILED",
            Self::StepSkipped => "STEP_SKIPPED",
            Self::RunFinished => "RUN_FINISHED",
            Self::RunError => "RUN_ERROR",
            Self::TextMessageStart => "TEXT_MESSAGE_START",
            Self::TextMessageContent => "TEXT_MESSAGE_CONTENT",
            Self::TextMessageEnd => "TEXT_MESSAGE_END",
            Self::ToolCallStart => "TOOL_CALL_START",
            Self::ToolCallArgs => "TOOL_CALL_ARGS",
            Self::ToolCallEnd => "TOOL_CALL_END",
            Self::ToolCallResult => "TOOL_CALL_RESULT",
        }
    }
}

/// Wire envelope delivered over SSE and WebSocket.
///
/// `{ "type": "<EVENT_TYPE>", "runId": "<id>", "timestamp": <ms>, ...fields }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgUiEvent {
    #[serde(rename = "type")]
    pub event_type: AgUiEventType,
    #[serde(rename = "runId")]
    pub run_id: Id,
    pub timestamp: i64,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl AgUiEvent {
    pub fn new(event_type: AgUiEventType, run_id: Id, timestamp: i64) -> Self {
        Self {
            event_type,
            run_id,
            timestamp,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Event type names for the internal audit log (execution/workflow/worktree lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ExecutionCreated,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    WorkflowCreated,
    WorkflowStarted,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCancelled,
    WorkflowCompleted,
    WorkflowFailed,
    StepStarted,
    StepFailed,
    StepSkipped,
    StepCompleted,
    WatchdogRewrite,
    WorktreeProviderSelected,
    WorktreeCreated,
    WorktreeRemoved,
    FederationRequestReceived,
    FederationRequestApproved,
    FederationRequestRejected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionCreated => "EXECUTION_CREATED",
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::ExecutionCompleted => "EXECUTION_COMPLETED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::WorkflowCreated => "WORKFLOW_CREATED",
            Self::WorkflowStarted => "WORKFLOW_STARTED",
            Self::WorkflowPaused => "WORKFLOW_PAUSED",
            Self::WorkflowResumed => "WORKFLOW_RESUMED",
            Self::WorkflowCancelled => "WORKFLOW_CANCELLED",
            Self::WorkflowCompleted => "WORKFLOW_COMPLETED",
            Self::WorkflowFailed => "WORKFLOW_FAILED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepFailed => "STEP_FAILED",
            Self::StepSkipped => "STEP_SKIPPED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::WatchdogRewrite => "WATCHDOG_REWRITE",
            Self::WorktreeProviderSelected => "WORKTREE_PROVIDER_SELECTED",
            Self::WorktreeCreated => "WORKTREE_CREATED",
            Self::WorktreeRemoved => "WORKTREE_REMOVED",
            Self::FederationRequestReceived => "FEDERATION_REQUEST_RECEIVED",
            Self::FederationRequestApproved => "FEDERATION_REQUEST_APPROVED",
            Self::FederationRequestRejected => "FEDERATION_REQUEST_REJECTED",
        }
    }
}

/// Payload for `STEP_FAILED` / `STEP_SKIPPED` events (Section 4.5.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedPayload {
    pub step_id: Id,
    pub reason: String,
}

/// Payload for `WATCHDOG_REWRITE` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogRewritePayload {
    pub execution_id: Id,
    pub signal: WatchdogSignal,
    pub prompt_before: String,
    pub prompt_after: String,
}

/// Payload for worktree lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeEventPayload {
    pub execution_id: Id,
    pub provider: WorktreeProvider,
    pub worktree_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn ag_ui_event_type_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&AgUiEventType::RunStarted).unwrap(),
            "\"RUN_STARTED\""
        );
        assert_eq!(
            serde_json::to_string(&AgUiEventType::ToolCallStart).unwrap(),
            "\"TOOL_CALL_START\""
        );
    }

    #[test]
    fn ag_ui_event_envelope_matches_wire_format() {
        let ev = AgUiEvent::new(
            AgUiEventType::RunStarted,
            Id::from_string("run-1"),
            Utc::now().timestamp_millis(),
        )
        .with_field("workerId", Value::String("w1".into()));

        let json = ev.to_json().unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "RUN_STARTED");
        assert_eq!(parsed["runId"], "run-1");
        assert_eq!(parsed["workerId"], "w1");
    }

    #[test]
    fn event_type_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&EventType::StepFailed).unwrap(),
            "\"STEP_FAILED\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::FederationRequestReceived).unwrap(),
            "\"FEDERATION_REQUEST_RECEIVED\""
        );
    }

    #[test]
    fn step_failed_payload_serializes() {
        let payload = StepFailedPayload {
            step_id: Id::from_string("s1"),
            reason: "Dependency s0 failed".into(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("Dependency s0 failed"));
    }
}
