//! SQLite storage module for the orchestrator daemon.
//!
//! Implements persistence for executions, normalized output, tool calls,
//! file changes, the replayable event log, workflows, and the federation
//! layer's remote repos / cross-repo requests / subscriptions / audit log.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;
use weave_core::{
    AuditLogEntry, CrossRepoRequest, EntityTypeFilter, EntryKind, Execution, ExecutionStatus,
    ExecutionWorktree, FileChange, FileOperation, Id, MergeStrategy, NameSource, NormalizedEntry,
    OnFailure, Parallelism, RemoteRepo, RequestDirection, RequestStatus, Subscription,
    SubscriptionEvent, SyncStatus, ToolCall, ToolCallStatus, TrustLevel, Workflow, WorkflowConfig,
    WorkflowSource, WorkflowStatus, WorkflowStep, WorkflowStepStatus, WorktreeProvider,
};

/// Explicit column list for executions table queries.
/// Using explicit columns instead of SELECT * ensures correct mapping
/// regardless of column order in the database (important for ALTER TABLE migrations).
const EXECUTIONS_COLUMNS: &str = "id, name, name_source, status, issue_id, workflow_id, \
    workflow_step_id, workspace_root, base_branch, run_branch, merge_target_branch, \
    merge_strategy, worktree_path, worktree_provider, worktree_cleanup_status, \
    worktree_cleaned_at, base_commit, after_commit, error_message, config_json, \
    started_at, completed_at, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("workflow step not found: {0}")]
    WorkflowStepNotFound(String),
    #[error("remote repo not found: {0}")]
    RemoteRepoNotFound(String),
    #[error("cross-repo request not found: {0}")]
    CrossRepoRequestNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations to initialize/update the schema.
    pub async fn migrate(&self, migrations_path: &Path) -> Result<()> {
        let migrator = sqlx::migrate::Migrator::new(migrations_path).await?;
        migrator.run(&self.pool).await?;
        Ok(())
    }

    /// Run embedded migrations (for when migrations are compiled in).
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [
            include_str!("../../../migrations/0001_init.sql"),
            include_str!("../../../migrations/0002_workflow.sql"),
            include_str!("../../../migrations/0003_federation.sql"),
        ];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Execution operations ---

    pub async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        let name_source = execution.name_source.as_str();
        let status = execution.status.as_str();
        let (base_branch, run_branch, merge_target, merge_strategy, worktree_path, worktree_provider) =
            match &execution.worktree {
                Some(wt) => (
                    Some(wt.base_branch.as_str()),
                    Some(wt.run_branch.as_str()),
                    wt.merge_target_branch.as_deref(),
                    Some(wt.merge_strategy.as_str()),
                    Some(wt.worktree_path.as_str()),
                    Some(wt.provider.as_str()),
                ),
                None => (None, None, None, None, None, None),
            };

        sqlx::query(
            r#"
            INSERT INTO executions (id, name, name_source, status, issue_id, workflow_id,
                                     workflow_step_id, workspace_root, base_branch, run_branch,
                                     merge_target_branch, merge_strategy, worktree_path,
                                     worktree_provider, error_message, config_json, started_at,
                                     completed_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            "#,
        )
        .bind(execution.id.as_ref())
        .bind(&execution.name)
        .bind(name_source)
        .bind(status)
        .bind(&execution.issue_id)
        .bind(execution.workflow_id.as_ref().map(Id::as_ref))
        .bind(execution.workflow_step_id.as_ref().map(Id::as_ref))
        .bind(&execution.workspace_root)
        .bind(base_branch)
        .bind(run_branch)
        .bind(merge_target)
        .bind(merge_strategy)
        .bind(worktree_path)
        .bind(worktree_provider)
        .bind(&execution.error_message)
        .bind(&execution.config_json)
        .bind(execution.started_at.map(|t| t.timestamp_millis()))
        .bind(execution.completed_at.map(|t| t.timestamp_millis()))
        .bind(execution.created_at.timestamp_millis())
        .bind(execution.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_execution(&self, id: &Id) -> Result<Execution> {
        let query = format!("SELECT {} FROM executions WHERE id = ?1", EXECUTIONS_COLUMNS);
        let row = sqlx::query_as::<_, ExecutionRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ExecutionNotFound(id.to_string()))?;
        Ok(row.into_execution())
    }

    pub async fn list_executions(&self, workspace_root: Option<&str>) -> Result<Vec<Execution>> {
        let rows = match workspace_root {
            Some(ws) => {
                let query = format!(
                    "SELECT {} FROM executions WHERE workspace_root = ?1 ORDER BY created_at DESC",
                    EXECUTIONS_COLUMNS
                );
                sqlx::query_as::<_, ExecutionRow>(&query)
                    .bind(ws)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!("SELECT {} FROM executions ORDER BY created_at DESC", EXECUTIONS_COLUMNS);
                sqlx::query_as::<_, ExecutionRow>(&query).fetch_all(&self.pool).await?
            }
        };
        Ok(rows.into_iter().map(ExecutionRow::into_execution).collect())
    }

    pub async fn list_executions_for_workflow(&self, workflow_id: &Id) -> Result<Vec<Execution>> {
        let query = format!(
            "SELECT {} FROM executions WHERE workflow_id = ?1 ORDER BY created_at ASC",
            EXECUTIONS_COLUMNS
        );
        let rows = sqlx::query_as::<_, ExecutionRow>(&query)
            .bind(workflow_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ExecutionRow::into_execution).collect())
    }

    /// Count running executions for a specific workspace (per-workspace cap enforcement).
    pub async fn count_running_executions_for_workspace(&self, workspace_root: &str) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM executions WHERE workspace_root = ?1 AND status = 'RUNNING'",
        )
        .bind(workspace_root)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    pub async fn update_execution_status(&self, id: &Id, status: ExecutionStatus) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query("UPDATE executions SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(now)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_execution_lifecycle(
        &self,
        id: &Id,
        status: ExecutionStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE executions SET status = ?1, started_at = ?2, completed_at = ?3, \
             error_message = ?4, updated_at = ?5 WHERE id = ?6",
        )
        .bind(status.as_str())
        .bind(started_at.map(|t| t.timestamp_millis()))
        .bind(completed_at.map(|t| t.timestamp_millis()))
        .bind(error_message)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_execution_commits(
        &self,
        id: &Id,
        base_commit: Option<&str>,
        after_commit: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE executions SET base_commit = ?1, after_commit = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(base_commit)
        .bind(after_commit)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_execution_worktree(&self, id: &Id, worktree: &ExecutionWorktree) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE executions SET base_branch = ?1, run_branch = ?2, merge_target_branch = ?3, \
             merge_strategy = ?4, worktree_path = ?5, worktree_provider = ?6, updated_at = ?7 \
             WHERE id = ?8",
        )
        .bind(&worktree.base_branch)
        .bind(&worktree.run_branch)
        .bind(&worktree.merge_target_branch)
        .bind(worktree.merge_strategy.as_str())
        .bind(&worktree.worktree_path)
        .bind(worktree.provider.as_str())
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_execution_worktree_cleanup(
        &self,
        id: &Id,
        status: &str,
        cleaned_at: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE executions SET worktree_cleanup_status = ?1, worktree_cleaned_at = ?2, \
             updated_at = ?3 WHERE id = ?4",
        )
        .bind(status)
        .bind(cleaned_at)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Normalized entry operations (C2) ---

    pub async fn insert_normalized_entry(&self, entry: &NormalizedEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO normalized_entries (execution_id, idx, kind, payload_json, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(entry.execution_id.as_ref())
        .bind(entry.index as i64)
        .bind(entry.kind.as_str())
        .bind(&entry.payload_json)
        .bind(entry.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_normalized_entries(&self, execution_id: &Id) -> Result<Vec<NormalizedEntry>> {
        let rows = sqlx::query_as::<_, NormalizedEntryRow>(
            "SELECT execution_id, idx, kind, payload_json, timestamp FROM normalized_entries \
             WHERE execution_id = ?1 ORDER BY idx ASC",
        )
        .bind(execution_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(NormalizedEntryRow::into_entry).collect())
    }

    // --- Tool call operations (C2) ---

    pub async fn upsert_tool_call(&self, call: &ToolCall) -> Result<()> {
        sqlx::query(
            "INSERT INTO tool_calls (tool_id, execution_id, name, input_json, status, result, \
             error, started_at, completed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT (execution_id, tool_id) DO UPDATE SET \
             status = excluded.status, result = excluded.result, error = excluded.error, \
             completed_at = excluded.completed_at",
        )
        .bind(&call.tool_id)
        .bind(call.execution_id.as_ref())
        .bind(&call.name)
        .bind(&call.input_json)
        .bind(call.status.as_str())
        .bind(&call.result)
        .bind(&call.error)
        .bind(call.started_at.timestamp_millis())
        .bind(call.completed_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_tool_calls(&self, execution_id: &Id) -> Result<Vec<ToolCall>> {
        let rows = sqlx::query_as::<_, ToolCallRow>(
            "SELECT tool_id, execution_id, name, input_json, status, result, error, started_at, \
             completed_at FROM tool_calls WHERE execution_id = ?1 ORDER BY started_at ASC",
        )
        .bind(execution_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ToolCallRow::into_tool_call).collect())
    }

    // --- File change operations (C2) ---

    pub async fn insert_file_change(&self, execution_id: &Id, change: &FileChange) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_changes (execution_id, path, operation, tool_call_id, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(execution_id.as_ref())
        .bind(&change.path)
        .bind(change.operation.as_str())
        .bind(&change.tool_call_id)
        .bind(change.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_file_changes(&self, execution_id: &Id) -> Result<Vec<FileChange>> {
        let rows = sqlx::query_as::<_, FileChangeRow>(
            "SELECT path, operation, tool_call_id, timestamp FROM file_changes \
             WHERE execution_id = ?1 ORDER BY timestamp ASC",
        )
        .bind(execution_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FileChangeRow::into_file_change).collect())
    }

    // --- Event log operations (C3) ---

    /// Persist one sequenced event for replay/audit. The in-memory `EventBuffer`
    /// (`eventbus.rs`) is the hot path for live fan-out; this is the durable copy.
    pub async fn append_event(
        &self,
        execution_id: &Id,
        seq: u64,
        event_type: &str,
        payload_json: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (execution_id, seq, event_type, payload_json, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(execution_id.as_ref())
        .bind(seq as i64)
        .bind(event_type)
        .bind(payload_json)
        .bind(timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_events(&self, execution_id: &Id, from_seq: Option<u64>) -> Result<Vec<PersistedEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT execution_id, seq, event_type, payload_json, timestamp FROM events \
             WHERE execution_id = ?1 AND seq >= ?2 ORDER BY seq ASC",
        )
        .bind(execution_id.as_ref())
        .bind(from_seq.unwrap_or(0) as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_persisted).collect())
    }

    // --- Workflow operations (C5) ---

    pub async fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let source_json = serde_json::to_string(&workflow.source)?;
        sqlx::query(
            "INSERT INTO workflows (id, title, source_json, base_branch, worktree_path, status, \
             on_failure, parallelism, max_concurrency, auto_commit_after_step, \
             create_base_branch, reuse_worktree_path, default_agent_type, current_step_index, \
             config_json, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )
        .bind(workflow.id.as_ref())
        .bind(&workflow.title)
        .bind(source_json)
        .bind(&workflow.base_branch)
        .bind(&workflow.worktree_path)
        .bind(workflow.status.as_str())
        .bind(workflow.config.on_failure.as_str())
        .bind(match workflow.config.parallelism {
            Parallelism::Sequential => "sequential",
            Parallelism::Parallel => "parallel",
        })
        .bind(workflow.config.max_concurrency as i64)
        .bind(workflow.config.auto_commit_after_step)
        .bind(workflow.config.create_base_branch)
        .bind(&workflow.config.reuse_worktree_path)
        .bind(&workflow.config.default_agent_type)
        .bind(workflow.current_step_index as i64)
        .bind(&workflow.config_json)
        .bind(workflow.created_at.timestamp_millis())
        .bind(workflow.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: &Id) -> Result<Workflow> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            "SELECT id, title, source_json, base_branch, worktree_path, status, on_failure, \
             parallelism, max_concurrency, auto_commit_after_step, create_base_branch, \
             reuse_worktree_path, default_agent_type, current_step_index, config_json, \
             created_at, updated_at FROM workflows WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::WorkflowNotFound(id.to_string()))?;
        row.into_workflow()
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT id, title, source_json, base_branch, worktree_path, status, on_failure, \
             parallelism, max_concurrency, auto_commit_after_step, create_base_branch, \
             reuse_worktree_path, default_agent_type, current_step_index, config_json, \
             created_at, updated_at FROM workflows ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }

    pub async fn update_workflow_status(&self, id: &Id, status: WorkflowStatus) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query("UPDATE workflows SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(now)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::WorkflowNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_workflow_current_step_index(&self, id: &Id, index: u32) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE workflows SET current_step_index = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(index as i64)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::WorkflowNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Workflow step operations (C5) ---

    pub async fn insert_workflow_step(&self, step: &WorkflowStep) -> Result<()> {
        let deps_json = serde_json::to_string(
            &step.dependencies.iter().map(Id::to_string).collect::<Vec<_>>(),
        )?;
        sqlx::query(
            "INSERT INTO workflow_steps (id, workflow_id, issue_id, step_index, \
             dependencies_json, status, execution_id, error, commit_sha) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(step.id.as_ref())
        .bind(step.workflow_id.as_ref())
        .bind(&step.issue_id)
        .bind(step.index as i64)
        .bind(deps_json)
        .bind(step.status.as_str())
        .bind(step.execution_id.as_ref().map(Id::as_ref))
        .bind(&step.error)
        .bind(&step.commit_sha)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_workflow_step(&self, id: &Id) -> Result<WorkflowStep> {
        let row = sqlx::query_as::<_, WorkflowStepRow>(
            "SELECT id, workflow_id, issue_id, step_index, dependencies_json, status, \
             execution_id, error, commit_sha FROM workflow_steps WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::WorkflowStepNotFound(id.to_string()))?;
        row.into_step()
    }

    pub async fn list_workflow_steps(&self, workflow_id: &Id) -> Result<Vec<WorkflowStep>> {
        let rows = sqlx::query_as::<_, WorkflowStepRow>(
            "SELECT id, workflow_id, issue_id, step_index, dependencies_json, status, \
             execution_id, error, commit_sha FROM workflow_steps WHERE workflow_id = ?1 \
             ORDER BY step_index ASC",
        )
        .bind(workflow_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkflowStepRow::into_step).collect()
    }

    pub async fn update_workflow_step_status(&self, id: &Id, status: WorkflowStepStatus) -> Result<()> {
        let result = sqlx::query("UPDATE workflow_steps SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::WorkflowStepNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_workflow_step_result(
        &self,
        id: &Id,
        status: WorkflowStepStatus,
        execution_id: Option<&Id>,
        error: Option<&str>,
        commit_sha: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workflow_steps SET status = ?1, execution_id = ?2, error = ?3, \
             commit_sha = ?4 WHERE id = ?5",
        )
        .bind(status.as_str())
        .bind(execution_id.map(Id::as_ref))
        .bind(error)
        .bind(commit_sha)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::WorkflowStepNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Federation: remote repo operations (C6) ---

    pub async fn upsert_remote_repo(&self, repo: &RemoteRepo) -> Result<()> {
        sqlx::query(
            "INSERT INTO remote_repos (url, display_name, trust_level, rest_endpoint, \
             ws_endpoint, git_url, auto_sync, sync_interval_minutes, sync_status, \
             last_synced_at, capabilities_json, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT (url) DO UPDATE SET \
             display_name = excluded.display_name, trust_level = excluded.trust_level, \
             rest_endpoint = excluded.rest_endpoint, ws_endpoint = excluded.ws_endpoint, \
             git_url = excluded.git_url, auto_sync = excluded.auto_sync, \
             sync_interval_minutes = excluded.sync_interval_minutes, \
             sync_status = excluded.sync_status, last_synced_at = excluded.last_synced_at, \
             capabilities_json = excluded.capabilities_json, updated_at = excluded.updated_at",
        )
        .bind(&repo.url)
        .bind(&repo.display_name)
        .bind(repo.trust_level.as_str())
        .bind(&repo.rest_endpoint)
        .bind(&repo.ws_endpoint)
        .bind(&repo.git_url)
        .bind(repo.auto_sync)
        .bind(repo.sync_interval_minutes as i64)
        .bind(repo.sync_status.as_str())
        .bind(repo.last_synced_at.map(|t| t.timestamp_millis()))
        .bind(&repo.capabilities_json)
        .bind(repo.created_at.timestamp_millis())
        .bind(repo.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_remote_repo(&self, url: &str) -> Result<RemoteRepo> {
        let row = sqlx::query_as::<_, RemoteRepoRow>(
            "SELECT url, display_name, trust_level, rest_endpoint, ws_endpoint, git_url, \
             auto_sync, sync_interval_minutes, sync_status, last_synced_at, capabilities_json, \
             created_at, updated_at FROM remote_repos WHERE url = ?1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::RemoteRepoNotFound(url.to_string()))?;
        Ok(row.into_remote_repo())
    }

    pub async fn list_remote_repos(&self) -> Result<Vec<RemoteRepo>> {
        let rows = sqlx::query_as::<_, RemoteRepoRow>(
            "SELECT url, display_name, trust_level, rest_endpoint, ws_endpoint, git_url, \
             auto_sync, sync_interval_minutes, sync_status, last_synced_at, capabilities_json, \
             created_at, updated_at FROM remote_repos ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RemoteRepoRow::into_remote_repo).collect())
    }

    pub async fn update_remote_repo_sync_status(
        &self,
        url: &str,
        status: SyncStatus,
        synced_at: Option<DateTime<Utc>>,
        capabilities_json: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE remote_repos SET sync_status = ?1, last_synced_at = ?2, \
             capabilities_json = COALESCE(?3, capabilities_json), updated_at = ?4 WHERE url = ?5",
        )
        .bind(status.as_str())
        .bind(synced_at.map(|t| t.timestamp_millis()))
        .bind(capabilities_json)
        .bind(now)
        .bind(url)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RemoteRepoNotFound(url.to_string()));
        }
        Ok(())
    }

    // --- Federation: cross-repo request operations (C6) ---

    pub async fn insert_cross_repo_request(&self, req: &CrossRepoRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO cross_repo_requests (request_id, direction, from_repo, to_repo, \
             request_type, payload_json, status, requires_approval, approved_by, approved_at, \
             rejection_reason, result_json, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(req.request_id.as_ref())
        .bind(req.direction.as_str())
        .bind(&req.from_repo)
        .bind(&req.to_repo)
        .bind(&req.request_type)
        .bind(&req.payload_json)
        .bind(req.status.as_str())
        .bind(req.requires_approval)
        .bind(&req.approved_by)
        .bind(req.approved_at.map(|t| t.timestamp_millis()))
        .bind(&req.rejection_reason)
        .bind(&req.result_json)
        .bind(req.created_at.timestamp_millis())
        .bind(req.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_cross_repo_request(&self, id: &Id) -> Result<CrossRepoRequest> {
        let row = sqlx::query_as::<_, CrossRepoRequestRow>(
            "SELECT request_id, direction, from_repo, to_repo, request_type, payload_json, \
             status, requires_approval, approved_by, approved_at, rejection_reason, \
             result_json, created_at, updated_at FROM cross_repo_requests WHERE request_id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::CrossRepoRequestNotFound(id.to_string()))?;
        Ok(row.into_request())
    }

    pub async fn list_cross_repo_requests(&self, status: Option<RequestStatus>) -> Result<Vec<CrossRepoRequest>> {
        let rows = match status {
            Some(s) => {
                sqlx::query_as::<_, CrossRepoRequestRow>(
                    "SELECT request_id, direction, from_repo, to_repo, request_type, \
                     payload_json, status, requires_approval, approved_by, approved_at, \
                     rejection_reason, result_json, created_at, updated_at \
                     FROM cross_repo_requests WHERE status = ?1 ORDER BY created_at DESC",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, CrossRepoRequestRow>(
                    "SELECT request_id, direction, from_repo, to_repo, request_type, \
                     payload_json, status, requires_approval, approved_by, approved_at, \
                     rejection_reason, result_json, created_at, updated_at \
                     FROM cross_repo_requests ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(CrossRepoRequestRow::into_request).collect())
    }

    pub async fn update_cross_repo_request_status(
        &self,
        id: &Id,
        status: RequestStatus,
        approved_by: Option<&str>,
        rejection_reason: Option<&str>,
        result_json: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE cross_repo_requests SET status = ?1, approved_by = ?2, approved_at = ?3, \
             rejection_reason = ?4, result_json = COALESCE(?5, result_json), updated_at = ?6 \
             WHERE request_id = ?7",
        )
        .bind(status.as_str())
        .bind(approved_by)
        .bind(approved_by.map(|_| now.timestamp_millis()))
        .bind(rejection_reason)
        .bind(result_json)
        .bind(now.timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::CrossRepoRequestNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Federation: subscription operations (C6) ---

    pub async fn insert_subscription(&self, sub: &Subscription) -> Result<()> {
        let events_json = serde_json::to_string(
            &sub.events.iter().map(SubscriptionEvent::as_str).collect::<Vec<_>>(),
        )?;
        sqlx::query(
            "INSERT INTO subscriptions (subscription_id, local_repo, remote_repo, entity_type, \
             entity_id, events_json, webhook_url, ws_connection_id, active, last_event_at, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(sub.subscription_id.as_ref())
        .bind(&sub.local_repo)
        .bind(&sub.remote_repo)
        .bind(sub.entity_type.as_str())
        .bind(&sub.entity_id)
        .bind(events_json)
        .bind(&sub.webhook_url)
        .bind(&sub.ws_connection_id)
        .bind(sub.active)
        .bind(sub.last_event_at.map(|t| t.timestamp_millis()))
        .bind(sub.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_subscriptions(&self, remote_repo: Option<&str>) -> Result<Vec<Subscription>> {
        let rows = match remote_repo {
            Some(repo) => {
                sqlx::query_as::<_, SubscriptionRow>(
                    "SELECT subscription_id, local_repo, remote_repo, entity_type, entity_id, \
                     events_json, webhook_url, ws_connection_id, active, last_event_at, \
                     created_at FROM subscriptions WHERE remote_repo = ?1 AND active = 1",
                )
                .bind(repo)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SubscriptionRow>(
                    "SELECT subscription_id, local_repo, remote_repo, entity_type, entity_id, \
                     events_json, webhook_url, ws_connection_id, active, last_event_at, \
                     created_at FROM subscriptions WHERE active = 1",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(SubscriptionRow::into_subscription).collect())
    }

    pub async fn touch_subscription(&self, id: &Id, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET last_event_at = ?1 WHERE subscription_id = ?2")
            .bind(at.timestamp_millis())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deactivate_subscription(&self, id: &Id) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET active = 0 WHERE subscription_id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Federation: audit log operations (C6) ---

    pub async fn insert_audit_log_entry(&self, entry: &AuditLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO federation_audit_log (id, operation, direction, from_repo, to_repo, \
             status, duration_ms, error, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(entry.id.as_ref())
        .bind(&entry.operation)
        .bind(entry.direction.as_str())
        .bind(&entry.from_repo)
        .bind(&entry.to_repo)
        .bind(&entry.status)
        .bind(entry.duration_ms as i64)
        .bind(&entry.error)
        .bind(entry.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_audit_log_entries(&self, limit: i64) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditLogRow>(
            "SELECT id, operation, direction, from_repo, to_repo, status, duration_ms, error, \
             created_at FROM federation_audit_log ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditLogRow::into_entry).collect())
    }

    /// Count audit entries with `status = 'failed'` within the last `window_sec` seconds
    /// (federation health classifier, spec Section 4.6.4).
    pub async fn count_recent_failed_audit_entries(&self, window_sec: i64) -> Result<i64> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(window_sec)).timestamp_millis();
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM federation_audit_log WHERE status = 'failed' AND created_at >= ?1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }
}

/// A durably-persisted copy of one emitted `AgUiEvent`.
#[derive(Debug, Clone)]
pub struct PersistedEvent {
    pub execution_id: Id,
    pub seq: u64,
    pub event_type: String,
    pub payload_json: String,
    pub timestamp: DateTime<Utc>,
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    name: String,
    name_source: String,
    status: String,
    issue_id: Option<String>,
    workflow_id: Option<String>,
    workflow_step_id: Option<String>,
    workspace_root: String,
    base_branch: Option<String>,
    run_branch: Option<String>,
    merge_target_branch: Option<String>,
    merge_strategy: Option<String>,
    worktree_path: Option<String>,
    worktree_provider: Option<String>,
    worktree_cleanup_status: Option<String>,
    worktree_cleaned_at: Option<i64>,
    base_commit: Option<String>,
    after_commit: Option<String>,
    error_message: Option<String>,
    config_json: Option<String>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl ExecutionRow {
    fn into_execution(self) -> Execution {
        let name_source = match self.name_source.as_str() {
            "spec_slug" => NameSource::SpecSlug,
            _ => NameSource::Haiku,
        };
        let status = match self.status.as_str() {
            "PENDING" => ExecutionStatus::Pending,
            "RUNNING" => ExecutionStatus::Running,
            "COMPLETED" => ExecutionStatus::Completed,
            "STOPPED" => ExecutionStatus::Stopped,
            "CANCELLED" => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Failed,
        };
        let worktree = match (self.base_branch, self.run_branch, self.worktree_path) {
            (Some(base), Some(run_br), Some(wt_path)) => Some(ExecutionWorktree {
                base_branch: base,
                run_branch: run_br,
                merge_target_branch: self.merge_target_branch,
                merge_strategy: match self.merge_strategy.as_deref() {
                    Some("none") => MergeStrategy::None,
                    Some("merge") => MergeStrategy::Merge,
                    _ => MergeStrategy::Squash,
                },
                worktree_path: wt_path,
                provider: match self.worktree_provider.as_deref() {
                    Some("worktrunk") => WorktreeProvider::Worktrunk,
                    Some("git") => WorktreeProvider::Git,
                    _ => WorktreeProvider::Auto,
                },
            }),
            _ => None,
        };

        Execution {
            id: Id::from_string(self.id),
            name: self.name,
            name_source,
            status,
            issue_id: self.issue_id,
            workflow_id: self.workflow_id.map(Id::from_string),
            workflow_step_id: self.workflow_step_id.map(Id::from_string),
            workspace_root: self.workspace_root,
            worktree,
            worktree_cleanup_status: self.worktree_cleanup_status,
            worktree_cleaned_at: self.worktree_cleaned_at.and_then(DateTime::from_timestamp_millis),
            base_commit: self.base_commit,
            after_commit: self.after_commit,
            error_message: self.error_message,
            config_json: self.config_json,
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct NormalizedEntryRow {
    execution_id: String,
    idx: i64,
    kind: String,
    payload_json: String,
    timestamp: i64,
}

impl NormalizedEntryRow {
    fn into_entry(self) -> NormalizedEntry {
        NormalizedEntry {
            index: self.idx as u64,
            execution_id: Id::from_string(self.execution_id),
            kind: match self.kind.as_str() {
                "assistant_message" => EntryKind::AssistantMessage,
                "user_message" => EntryKind::UserMessage,
                "tool_use" => EntryKind::ToolUse,
                "tool_result" => EntryKind::ToolResult,
                "thinking" => EntryKind::Thinking,
                "system" => EntryKind::System,
                _ => EntryKind::Error,
            },
            payload_json: self.payload_json,
            timestamp: DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ToolCallRow {
    tool_id: String,
    execution_id: String,
    name: String,
    input_json: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    started_at: i64,
    completed_at: Option<i64>,
}

impl ToolCallRow {
    fn into_tool_call(self) -> ToolCall {
        ToolCall {
            tool_id: self.tool_id,
            execution_id: Id::from_string(self.execution_id),
            name: self.name,
            input_json: self.input_json,
            status: match self.status.as_str() {
                "success" => ToolCallStatus::Success,
                "error" => ToolCallStatus::Error,
                _ => ToolCallStatus::Pending,
            },
            result: self.result,
            error: self.error,
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FileChangeRow {
    path: String,
    operation: String,
    tool_call_id: String,
    timestamp: i64,
}

impl FileChangeRow {
    fn into_file_change(self) -> FileChange {
        FileChange {
            path: self.path,
            operation: match self.operation.as_str() {
                "write" => FileOperation::Write,
                "edit" => FileOperation::Edit,
                _ => FileOperation::Read,
            },
            tool_call_id: self.tool_call_id,
            timestamp: DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    execution_id: String,
    seq: i64,
    event_type: String,
    payload_json: String,
    timestamp: i64,
}

impl EventRow {
    fn into_persisted(self) -> PersistedEvent {
        PersistedEvent {
            execution_id: Id::from_string(self.execution_id),
            seq: self.seq as u64,
            event_type: self.event_type,
            payload_json: self.payload_json,
            timestamp: DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    title: String,
    source_json: String,
    base_branch: Option<String>,
    worktree_path: Option<String>,
    status: String,
    on_failure: String,
    parallelism: String,
    max_concurrency: i64,
    auto_commit_after_step: bool,
    create_base_branch: bool,
    reuse_worktree_path: Option<String>,
    default_agent_type: String,
    current_step_index: i64,
    config_json: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl WorkflowRow {
    fn into_workflow(self) -> Result<Workflow> {
        let source: WorkflowSource = serde_json::from_str(&self.source_json)?;
        let status = match self.status.as_str() {
            "PENDING" => WorkflowStatus::Pending,
            "RUNNING" => WorkflowStatus::Running,
            "PAUSED" => WorkflowStatus::Paused,
            "COMPLETED" => WorkflowStatus::Completed,
            "CANCELLED" => WorkflowStatus::Cancelled,
            _ => WorkflowStatus::Failed,
        };
        let config = WorkflowConfig {
            on_failure: match self.on_failure.as_str() {
                "stop" => OnFailure::Stop,
                "pause" => OnFailure::Pause,
                "skip_dependents" => OnFailure::SkipDependents,
                _ => OnFailure::Continue,
            },
            parallelism: match self.parallelism.as_str() {
                "parallel" => Parallelism::Parallel,
                _ => Parallelism::Sequential,
            },
            max_concurrency: self.max_concurrency as u32,
            auto_commit_after_step: self.auto_commit_after_step,
            create_base_branch: self.create_base_branch,
            reuse_worktree_path: self.reuse_worktree_path,
            default_agent_type: self.default_agent_type,
        };

        Ok(Workflow {
            id: Id::from_string(self.id),
            title: self.title,
            source,
            base_branch: self.base_branch.unwrap_or_default(),
            worktree_path: self.worktree_path,
            status,
            config,
            current_step_index: self.current_step_index as u32,
            config_json: self.config_json,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowStepRow {
    id: String,
    workflow_id: String,
    issue_id: String,
    step_index: i64,
    dependencies_json: String,
    status: String,
    execution_id: Option<String>,
    error: Option<String>,
    commit_sha: Option<String>,
}

impl WorkflowStepRow {
    fn into_step(self) -> Result<WorkflowStep> {
        let deps: Vec<String> = serde_json::from_str(&self.dependencies_json)?;
        Ok(WorkflowStep {
            id: Id::from_string(self.id),
            workflow_id: Id::from_string(self.workflow_id),
            issue_id: self.issue_id,
            index: self.step_index as u32,
            dependencies: deps.into_iter().map(Id::from_string).collect(),
            status: match self.status.as_str() {
                "ready" => WorkflowStepStatus::Ready,
                "running" => WorkflowStepStatus::Running,
                "completed" => WorkflowStepStatus::Completed,
                "failed" => WorkflowStepStatus::Failed,
                "skipped" => WorkflowStepStatus::Skipped,
                "blocked" => WorkflowStepStatus::Blocked,
                _ => WorkflowStepStatus::Pending,
            },
            execution_id: self.execution_id.map(Id::from_string),
            error: self.error,
            commit_sha: self.commit_sha,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RemoteRepoRow {
    url: String,
    display_name: String,
    trust_level: String,
    rest_endpoint: String,
    ws_endpoint: Option<String>,
    git_url: Option<String>,
    auto_sync: bool,
    sync_interval_minutes: i64,
    sync_status: String,
    last_synced_at: Option<i64>,
    capabilities_json: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RemoteRepoRow {
    fn into_remote_repo(self) -> RemoteRepo {
        RemoteRepo {
            url: self.url,
            display_name: self.display_name,
            trust_level: TrustLevel::from_str(&self.trust_level).unwrap_or(TrustLevel::Untrusted),
            rest_endpoint: self.rest_endpoint,
            ws_endpoint: self.ws_endpoint,
            git_url: self.git_url,
            auto_sync: self.auto_sync,
            sync_interval_minutes: self.sync_interval_minutes as u32,
            sync_status: match self.sync_status.as_str() {
                "synced" => SyncStatus::Synced,
                "stale" => SyncStatus::Stale,
                "unreachable" => SyncStatus::Unreachable,
                _ => SyncStatus::Unknown,
            },
            last_synced_at: self.last_synced_at.and_then(DateTime::from_timestamp_millis),
            capabilities_json: self.capabilities_json,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct CrossRepoRequestRow {
    request_id: String,
    direction: String,
    from_repo: String,
    to_repo: String,
    request_type: String,
    payload_json: String,
    status: String,
    requires_approval: bool,
    approved_by: Option<String>,
    approved_at: Option<i64>,
    rejection_reason: Option<String>,
    result_json: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl CrossRepoRequestRow {
    fn into_request(self) -> CrossRepoRequest {
        CrossRepoRequest {
            request_id: Id::from_string(self.request_id),
            direction: match self.direction.as_str() {
                "outgoing" => RequestDirection::Outgoing,
                _ => RequestDirection::Incoming,
            },
            from_repo: self.from_repo,
            to_repo: self.to_repo,
            request_type: self.request_type,
            payload_json: self.payload_json,
            status: match self.status.as_str() {
                "approved" => RequestStatus::Approved,
                "rejected" => RequestStatus::Rejected,
                "completed" => RequestStatus::Completed,
                "failed" => RequestStatus::Failed,
                _ => RequestStatus::Pending,
            },
            requires_approval: self.requires_approval,
            approved_by: self.approved_by,
            approved_at: self.approved_at.and_then(DateTime::from_timestamp_millis),
            rejection_reason: self.rejection_reason,
            result_json: self.result_json,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    subscription_id: String,
    local_repo: String,
    remote_repo: String,
    entity_type: String,
    entity_id: Option<String>,
    events_json: String,
    webhook_url: Option<String>,
    ws_connection_id: Option<String>,
    active: bool,
    last_event_at: Option<i64>,
    created_at: i64,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Subscription {
        let events: Vec<String> = serde_json::from_str(&self.events_json).unwrap_or_default();
        Subscription {
            subscription_id: Id::from_string(self.subscription_id),
            local_repo: self.local_repo,
            remote_repo: self.remote_repo,
            entity_type: EntityTypeFilter::from_str(&self.entity_type),
            entity_id: self.entity_id,
            events: events.iter().map(|e| SubscriptionEvent::from_str(e)).collect(),
            webhook_url: self.webhook_url,
            ws_connection_id: self.ws_connection_id,
            active: self.active,
            last_event_at: self.last_event_at.and_then(DateTime::from_timestamp_millis),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AuditLogRow {
    id: String,
    operation: String,
    direction: String,
    from_repo: String,
    to_repo: String,
    status: String,
    duration_ms: i64,
    error: Option<String>,
    created_at: i64,
}

impl AuditLogRow {
    fn into_entry(self) -> AuditLogEntry {
        AuditLogEntry {
            id: Id::from_string(self.id),
            operation: self.operation,
            direction: match self.direction.as_str() {
                "outgoing" => RequestDirection::Outgoing,
                _ => RequestDirection::Incoming,
            },
            from_repo: self.from_repo,
            to_repo: self.to_repo,
            status: self.status,
            duration_ms: self.duration_ms as u64,
            error: self.error,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir,
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn create_test_execution() -> Execution {
        let now = Utc::now();
        Execution {
            id: Id::new(),
            name: "test-execution".to_string(),
            name_source: NameSource::SpecSlug,
            status: ExecutionStatus::Pending,
            issue_id: None,
            workflow_id: None,
            workflow_step_id: None,
            workspace_root: "/workspace".to_string(),
            worktree: None,
            worktree_cleanup_status: None,
            worktree_cleaned_at: None,
            base_commit: None,
            after_commit: None,
            error_message: None,
            config_json: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_get_execution() {
        let ts = create_test_storage().await;
        let execution = create_test_execution();
        ts.storage.insert_execution(&execution).await.unwrap();
        let retrieved = ts.storage.get_execution(&execution.id).await.unwrap();
        assert_eq!(retrieved.id, execution.id);
        assert_eq!(retrieved.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn update_execution_status_transitions() {
        let ts = create_test_storage().await;
        let execution = create_test_execution();
        ts.storage.insert_execution(&execution).await.unwrap();
        ts.storage
            .update_execution_status(&execution.id, ExecutionStatus::Running)
            .await
            .unwrap();
        let retrieved = ts.storage.get_execution(&execution.id).await.unwrap();
        assert_eq!(retrieved.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn get_unknown_execution_errors() {
        let ts = create_test_storage().await;
        assert!(matches!(
            ts.storage.get_execution(&Id::new()).await,
            Err(StorageError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn normalized_entries_round_trip_in_order() {
        let ts = create_test_storage().await;
        let execution = create_test_execution();
        ts.storage.insert_execution(&execution).await.unwrap();

        for i in 0..3u64 {
            ts.storage
                .insert_normalized_entry(&NormalizedEntry {
                    index: i,
                    execution_id: execution.id.clone(),
                    kind: EntryKind::AssistantMessage,
                    payload_json: format!("{{\"text\":\"{i}\"}}"),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }

        let entries = ts.storage.list_normalized_entries(&execution.id).await.unwrap();
        let indices: Vec<u64> = entries.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn tool_call_upsert_updates_status() {
        let ts = create_test_storage().await;
        let execution = create_test_execution();
        ts.storage.insert_execution(&execution).await.unwrap();

        let mut call = ToolCall {
            tool_id: "t1".to_string(),
            execution_id: execution.id.clone(),
            name: "Read".to_string(),
            input_json: "{}".to_string(),
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        ts.storage.upsert_tool_call(&call).await.unwrap();

        call.status = ToolCallStatus::Success;
        call.result = Some("done".to_string());
        call.completed_at = Some(Utc::now());
        ts.storage.upsert_tool_call(&call).await.unwrap();

        let calls = ts.storage.list_tool_calls(&execution.id).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, ToolCallStatus::Success);
    }

    fn create_test_workflow() -> Workflow {
        let now = Utc::now();
        Workflow {
            id: Id::new(),
            title: "test workflow".to_string(),
            source: WorkflowSource::Goal,
            base_branch: "main".to_string(),
            worktree_path: None,
            status: WorkflowStatus::Pending,
            config: WorkflowConfig::default(),
            current_step_index: 0,
            config_json: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_get_workflow_round_trips_source() {
        let ts = create_test_storage().await;
        let workflow = create_test_workflow();
        ts.storage.insert_workflow(&workflow).await.unwrap();
        let retrieved = ts.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(retrieved.id, workflow.id);
        assert!(matches!(retrieved.source, WorkflowSource::Goal));
    }

    #[tokio::test]
    async fn workflow_step_dependencies_round_trip() {
        let ts = create_test_storage().await;
        let workflow = create_test_workflow();
        ts.storage.insert_workflow(&workflow).await.unwrap();

        let dep = Id::new();
        let step = WorkflowStep {
            id: Id::new(),
            workflow_id: workflow.id.clone(),
            issue_id: "issue-1".to_string(),
            index: 1,
            dependencies: vec![dep.clone()],
            status: WorkflowStepStatus::Pending,
            execution_id: None,
            error: None,
            commit_sha: None,
        };
        ts.storage.insert_workflow_step(&step).await.unwrap();

        let retrieved = ts.storage.get_workflow_step(&step.id).await.unwrap();
        assert_eq!(retrieved.dependencies, vec![dep]);
    }

    fn create_test_remote_repo() -> RemoteRepo {
        let now = Utc::now();
        RemoteRepo {
            url: "https://peer.example/repo".to_string(),
            display_name: "peer".to_string(),
            trust_level: TrustLevel::Trusted,
            rest_endpoint: "https://peer.example/api".to_string(),
            ws_endpoint: None,
            git_url: None,
            auto_sync: false,
            sync_interval_minutes: 30,
            sync_status: SyncStatus::Unknown,
            last_synced_at: None,
            capabilities_json: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn remote_repo_upsert_is_idempotent_by_url() {
        let ts = create_test_storage().await;
        let repo = create_test_remote_repo();
        ts.storage.upsert_remote_repo(&repo).await.unwrap();
        ts.storage
            .update_remote_repo_sync_status(&repo.url, SyncStatus::Synced, Some(Utc::now()), None)
            .await
            .unwrap();

        let retrieved = ts.storage.get_remote_repo(&repo.url).await.unwrap();
        assert_eq!(retrieved.sync_status, SyncStatus::Synced);

        let all = ts.storage.list_remote_repos().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn cross_repo_request_status_transitions_persist_approval() {
        let ts = create_test_storage().await;
        let now = Utc::now();
        let req = CrossRepoRequest {
            request_id: Id::new(),
            direction: RequestDirection::Incoming,
            from_repo: "https://peer.example".to_string(),
            to_repo: "self".to_string(),
            request_type: "mutate".to_string(),
            payload_json: "{}".to_string(),
            status: RequestStatus::Pending,
            requires_approval: true,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            result_json: None,
            created_at: now,
            updated_at: now,
        };
        ts.storage.insert_cross_repo_request(&req).await.unwrap();
        ts.storage
            .update_cross_repo_request_status(
                &req.request_id,
                RequestStatus::Completed,
                Some("alice"),
                None,
                Some("{\"ok\":true}"),
            )
            .await
            .unwrap();

        let retrieved = ts.storage.get_cross_repo_request(&req.request_id).await.unwrap();
        assert_eq!(retrieved.status, RequestStatus::Completed);
        assert_eq!(retrieved.approved_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn audit_log_failed_count_respects_window() {
        let ts = create_test_storage().await;
        let entry = AuditLogEntry {
            id: Id::new(),
            operation: "mutate".to_string(),
            direction: RequestDirection::Incoming,
            from_repo: "peer".to_string(),
            to_repo: "self".to_string(),
            status: "failed".to_string(),
            duration_ms: 10,
            error: Some("boom".to_string()),
            created_at: Utc::now(),
        };
        ts.storage.insert_audit_log_entry(&entry).await.unwrap();
        let count = ts.storage.count_recent_failed_audit_entries(3600).await.unwrap();
        assert_eq!(count, 1);
    }
}
