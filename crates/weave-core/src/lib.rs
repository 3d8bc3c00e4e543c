pub mod artifacts;
pub mod config;
pub mod events;
pub mod jsonl;
pub mod merge;
pub mod prompt;
pub mod report;
pub mod types;

pub use artifacts::{
    global_run_dir, mirror_artifact, workspace_run_dir, write_and_mirror_artifact,
};
pub use config::Config;
pub use events::{AgUiEvent, AgUiEventType, EventType, StepFailedPayload, WatchdogRewritePayload, WorktreeEventPayload};
pub use jsonl::{export_jsonl, sort_entities, EntityKind, FeedbackEntry, JsonlEntity, Relationship};
pub use merge::{merge_three_way, resolve_entities, MergeError, ResolveResult};
pub use report::{ReportRow, ReportWriter};
pub use types::{
    Artifact, ArtifactLocation, ArtifactMode, AuditLogEntry, CrossRepoRequest, EntityTypeFilter,
    Execution, ExecutionStatus, ExecutionWorktree, EntryKind, FileChange, FileOperation, Id,
    MergeStrategy, NameSource, NormalizedEntry, OnFailure, Parallelism, QueuePolicy,
    RemoteRepo, RequestDirection, RequestStatus, Subscription, SubscriptionEvent, SyncStatus,
    ToolCall, ToolCallStatus, TrustLevel, WatchdogDecision, WatchdogSignal, Workflow,
    WorkflowConfig, WorkflowSource, WorkflowStatus, WorkflowStep, WorkflowStepStatus,
    WorktreeProvider,
};
