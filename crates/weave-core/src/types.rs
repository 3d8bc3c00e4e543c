//! Core types for the execution and workflow core.
//!
//! These types match the data model defined in SPEC_FULL.md Section 3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for executions, steps, workflows, events, and artifacts.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Execution (Section 3) ---

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Cancelled
        )
    }
}

/// Source for execution naming (applies to both executions and workflows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameSource {
    SpecSlug,
    #[default]
    Haiku,
}

impl NameSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecSlug => "spec_slug",
            Self::Haiku => "haiku",
        }
    }
}

/// Git merge strategy for an execution or workflow-step branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    None,
    Merge,
    #[default]
    Squash,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Merge => "merge",
            Self::Squash => "squash",
        }
    }
}

/// Worktree provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeProvider {
    /// Auto-detect: use Worktrunk if available, else fallback to git.
    #[default]
    Auto,
    /// Use Worktrunk CLI (`wt`) for worktree lifecycle.
    Worktrunk,
    /// Use native git commands for worktree lifecycle.
    Git,
}

impl WorktreeProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Worktrunk => "worktrunk",
            Self::Git => "git",
        }
    }
}

/// Queue discipline policy for execution scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// First-in, first-out: oldest pending execution is claimed first.
    #[default]
    Fifo,
    /// Newest first: most recently created pending execution is claimed first.
    NewestFirst,
}

impl QueuePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::NewestFirst => "newest_first",
        }
    }
}

/// Worktree and branch configuration for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionWorktree {
    pub base_branch: String,
    pub run_branch: String,
    pub merge_target_branch: Option<String>,
    pub merge_strategy: MergeStrategy,
    pub worktree_path: String,
    pub provider: WorktreeProvider,
}

/// One attempt of one task (issue or workflow step). Section 3 `Execution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Id,
    pub name: String,
    pub name_source: NameSource,
    pub status: ExecutionStatus,
    /// Optional issue identifier this execution is servicing.
    pub issue_id: Option<String>,
    /// Optional workflow step this execution was launched for.
    pub workflow_id: Option<Id>,
    pub workflow_step_id: Option<Id>,
    pub workspace_root: String,
    pub worktree: Option<ExecutionWorktree>,
    pub worktree_cleanup_status: Option<String>,
    pub worktree_cleaned_at: Option<DateTime<Utc>>,
    /// Commit SHA the worktree was based on.
    pub base_commit: Option<String>,
    /// Commit SHA produced by auto-commit, if any.
    pub after_commit: Option<String>,
    pub error_message: Option<String>,
    /// JSON-serialized config resolved at creation time.
    pub config_json: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Output Normalizer (Section 3 / 4.2) ---

/// Kind tag for a single record of agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    AssistantMessage,
    UserMessage,
    ToolUse,
    ToolResult,
    Thinking,
    System,
    Error,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssistantMessage => "assistant_message",
            Self::UserMessage => "user_message",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Thinking => "thinking",
            Self::System => "system",
            Self::Error => "error",
        }
    }
}

/// One immutable record of normalized agent output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEntry {
    /// Monotonically increasing index within its execution.
    pub index: u64,
    pub execution_id: Id,
    pub kind: EntryKind,
    /// Arbitrary JSON payload, shape depends on `kind`.
    pub payload_json: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated tool-call lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Success,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// A tool call aggregated from a `tool_use`/`tool_result` pair of entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Id carried by the agent stream (`toolUseId`).
    pub tool_id: String,
    pub execution_id: Id,
    pub name: String,
    pub input_json: String,
    pub status: ToolCallStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// File operation derived from a tool call name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Edit,
}

impl FileOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Edit => "edit",
        }
    }

    /// Map a tool name to the file operation it represents, if any.
    ///
    /// Section 3 `FileChange`: {Read→read, Write→write, Edit→edit, MultiEdit→edit}.
    pub fn from_tool_name(name: &str) -> Option<Self> {
        match name {
            "Read" => Some(Self::Read),
            "Write" => Some(Self::Write),
            "Edit" | "MultiEdit" => Some(Self::Edit),
            _ => None,
        }
    }
}

/// A file change derived from a completed tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub operation: FileOperation,
    pub tool_call_id: String,
    pub timestamp: DateTime<Utc>,
}

// --- Workflow Engine (Section 3 / 4.5) ---

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// How a workflow's step set was resolved at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowSource {
    Spec { path: String },
    Issues { issue_ids: Vec<String> },
    RootIssue { issue_id: String },
    /// Starts with no steps; an orchestrator inserts steps later via `appendStep`.
    Goal,
}

/// Failure policy applied when a workflow step ends in a non-completed terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Stop,
    Pause,
    SkipDependents,
    #[default]
    Continue,
}

impl OnFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::SkipDependents => "skip_dependents",
            Self::Continue => "continue",
        }
    }
}

/// Whether ready steps are executed one at a time or in a bounded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    #[default]
    Sequential,
    Parallel,
}

/// Workflow-wide execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub parallelism: Parallelism,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default = "default_true")]
    pub auto_commit_after_step: bool,
    #[serde(default)]
    pub create_base_branch: bool,
    #[serde(default)]
    pub reuse_worktree_path: Option<String>,
    #[serde(default = "default_agent_type")]
    pub default_agent_type: String,
}

fn default_max_concurrency() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_agent_type() -> String {
    "claude".to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            on_failure: OnFailure::default(),
            parallelism: Parallelism::default(),
            max_concurrency: default_max_concurrency(),
            auto_commit_after_step: true,
            create_base_branch: false,
            reuse_worktree_path: None,
            default_agent_type: default_agent_type(),
        }
    }
}

/// A DAG of steps derived from a spec, issue set, or goal. Section 3 `Workflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Id,
    pub title: String,
    pub source: WorkflowSource,
    pub base_branch: String,
    pub worktree_path: Option<String>,
    pub status: WorkflowStatus,
    pub config: WorkflowConfig,
    /// Index of the step currently (or most recently) executing; never decreases.
    pub current_step_index: u32,
    pub config_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-step status within a workflow DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

impl WorkflowStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Blocked)
    }
}

/// One node in a workflow DAG. Section 3 `WorkflowStep`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Id,
    pub workflow_id: Id,
    pub issue_id: String,
    /// Zero-based position in the workflow's step list.
    pub index: u32,
    /// Ids of other steps that must reach `completed` before this step is eligible.
    pub dependencies: Vec<Id>,
    pub status: WorkflowStepStatus,
    pub execution_id: Option<Id>,
    pub error: Option<String>,
    pub commit_sha: Option<String>,
}

// --- Federation (Section 3 / 4.6) ---

/// Peer trust classification driving auto-approval of mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Verified,
    Untrusted,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Verified => "verified",
            Self::Untrusted => "untrusted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "trusted" => Some(Self::Trusted),
            "verified" => Some(Self::Verified),
            "untrusted" => Some(Self::Untrusted),
            _ => None,
        }
    }
}

/// Peer synchronization health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Stale,
    Unreachable,
    #[default]
    Unknown,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Stale => "stale",
            Self::Unreachable => "unreachable",
            Self::Unknown => "unknown",
        }
    }
}

/// A peer repository descriptor. Section 3 `RemoteRepo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRepo {
    /// Primary key.
    pub url: String,
    pub display_name: String,
    pub trust_level: TrustLevel,
    pub rest_endpoint: String,
    pub ws_endpoint: Option<String>,
    pub git_url: Option<String>,
    pub auto_sync: bool,
    pub sync_interval_minutes: u32,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// JSON-encoded capabilities snapshot returned by `/federation/info`.
    pub capabilities_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Direction of a federation operation relative to the local repo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestDirection {
    Incoming,
    Outgoing,
}

impl RequestDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

/// Cross-repo request state machine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states are immutable (Section 3 state machine, Invariant 10).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Failed)
    }
}

/// A federation mutation in flight. Section 3 `CrossRepoRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossRepoRequest {
    pub request_id: Id,
    pub direction: RequestDirection,
    pub from_repo: String,
    pub to_repo: String,
    pub request_type: String,
    pub payload_json: String,
    pub status: RequestStatus,
    pub requires_approval: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub result_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Entity type filter used by subscriptions (exact match or wildcard).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTypeFilter {
    Issue,
    Spec,
    #[serde(rename = "*")]
    Any,
}

impl EntityTypeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Spec => "spec",
            Self::Any => "*",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "issue" => Self::Issue,
            "spec" => Self::Spec,
            _ => Self::Any,
        }
    }

    pub fn matches(&self, other: &str) -> bool {
        matches!(self, Self::Any) || self.as_str() == other
    }
}

/// Event kinds a subscription can watch for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEvent {
    Created,
    Updated,
    Closed,
    #[serde(rename = "*")]
    Any,
}

impl SubscriptionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Closed => "closed",
            Self::Any => "*",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "closed" => Self::Closed,
            _ => Self::Any,
        }
    }
}

/// A long-lived federation watch. Section 3 `Subscription`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Id,
    pub local_repo: String,
    pub remote_repo: String,
    pub entity_type: EntityTypeFilter,
    pub entity_id: Option<String>,
    pub events: Vec<SubscriptionEvent>,
    pub webhook_url: Option<String>,
    pub ws_connection_id: Option<String>,
    pub active: bool,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Invariant 9: match rules for `publishEvent`.
    pub fn matches(&self, entity_type: &str, entity_id: Option<&str>, event_type: &str) -> bool {
        if !self.active {
            return false;
        }
        if !self.entity_type.matches(entity_type) {
            return false;
        }
        if let Some(want) = &self.entity_id {
            if Some(want.as_str()) != entity_id {
                return false;
            }
        }
        self.events
            .iter()
            .any(|e| matches!(e, SubscriptionEvent::Any) || e.as_str() == event_type)
    }
}

/// One row per federation operation. Section 3 `AuditLogEntry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Id,
    pub operation: String,
    pub direction: RequestDirection,
    pub from_repo: String,
    pub to_repo: String,
    pub status: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// --- Watchdog (kept idiom for step-level non-completed terminal state handling) ---

/// Watchdog signal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogSignal {
    RepeatedTask,
    VerificationFailed,
    NoProgress,
    MalformedComplete,
}

impl WatchdogSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepeatedTask => "repeated_task",
            Self::VerificationFailed => "verification_failed",
            Self::NoProgress => "no_progress",
            Self::MalformedComplete => "malformed_complete",
        }
    }
}

/// Watchdog decision after evaluating signals for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogDecision {
    pub signal: WatchdogSignal,
    pub action: String,
    pub rewrite_count: u32,
    pub notes: Option<String>,
}

// --- Artifacts (Section 3.2 persistence support) ---

/// Artifact storage location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactLocation {
    Workspace,
    Global,
}

impl ArtifactLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Global => "global",
        }
    }
}

/// Artifact mode for storage mirroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactMode {
    Workspace,
    Global,
    #[default]
    Mirror,
}

impl ArtifactMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Global => "global",
            Self::Mirror => "mirror",
        }
    }
}

/// An artifact file reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Id,
    pub execution_id: Id,
    pub kind: String,
    pub location: ArtifactLocation,
    pub path: String,
    pub checksum: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn execution_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Running).unwrap(),
            "\"RUNNING\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Stopped).unwrap(),
            "\"STOPPED\""
        );
    }

    #[test]
    fn execution_status_terminal() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
    }

    #[test]
    fn file_operation_from_tool_name() {
        assert_eq!(FileOperation::from_tool_name("Read"), Some(FileOperation::Read));
        assert_eq!(FileOperation::from_tool_name("MultiEdit"), Some(FileOperation::Edit));
        assert_eq!(FileOperation::from_tool_name("Bash"), None);
    }

    #[test]
    fn request_status_terminal_states() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Rejected.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Approved.is_terminal());
    }

    #[test]
    fn entity_type_filter_matches_wildcard() {
        assert!(EntityTypeFilter::Any.matches("issue"));
        assert!(EntityTypeFilter::Issue.matches("issue"));
        assert!(!EntityTypeFilter::Issue.matches("spec"));
    }

    #[test]
    fn subscription_matches_invariant_9() {
        let sub = Subscription {
            subscription_id: Id::from_string("s1"),
            local_repo: "local".into(),
            remote_repo: "remote".into(),
            entity_type: EntityTypeFilter::Issue,
            entity_id: Some("42".into()),
            events: vec![SubscriptionEvent::Created, SubscriptionEvent::Updated],
            webhook_url: None,
            ws_connection_id: None,
            active: true,
            last_event_at: None,
            created_at: Utc::now(),
        };
        assert!(sub.matches("issue", Some("42"), "created"));
        assert!(!sub.matches("issue", Some("43"), "created"));
        assert!(!sub.matches("spec", Some("42"), "created"));
        assert!(!sub.matches("issue", Some("42"), "closed"));

        let mut inactive = sub.clone();
        inactive.active = false;
        assert!(!inactive.matches("issue", Some("42"), "created"));
    }

    #[test]
    fn trust_level_round_trips() {
        for level in [TrustLevel::Trusted, TrustLevel::Verified, TrustLevel::Untrusted] {
            assert_eq!(TrustLevel::from_str(level.as_str()), Some(level));
        }
    }

    #[test]
    fn workflow_config_defaults() {
        let cfg = WorkflowConfig::default();
        assert_eq!(cfg.on_failure, OnFailure::Continue);
        assert_eq!(cfg.parallelism, Parallelism::Sequential);
        assert_eq!(cfg.max_concurrency, 1);
        assert!(cfg.auto_commit_after_step);
    }

    #[test]
    fn workflow_step_status_terminal() {
        assert!(WorkflowStepStatus::Completed.is_terminal());
        assert!(WorkflowStepStatus::Skipped.is_terminal());
        assert!(WorkflowStepStatus::Blocked.is_terminal());
        assert!(!WorkflowStepStatus::Running.is_terminal());
        assert!(!WorkflowStepStatus::Ready.is_terminal());
    }
}
