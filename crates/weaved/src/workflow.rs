//! DAG workflow engine (spec Section 4.5).
//!
//! Generalizes the teacher's `Scheduler::determine_next_phase` fixed linear
//! chain (Implementation → Review → Verification, `scheduler.rs`) into a true
//! DAG scheduler: Tarjan-style cycle detection at construction, a ready-set
//! computed every tick, the four `onFailure` policies, and external
//! pause/resume/cancel/retry/skip controls. The concurrency/claim discipline
//! (a semaphore sized by `maxConcurrency`, paired with an in-memory
//! pause/cancel flag kept separate from the persisted `WorkflowStatus`) is
//! carried from the same module's `claim_next_run` idiom. The auto-commit
//! path is carried from `git.rs` (`stage_and_commit`) and `worktree.rs`
//! (`build_worktree_config`, `prepare`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use weave_core::jsonl::JsonlEntity;
use weave_core::{
    Config, ExecutionStatus, ExecutionWorktree, Id, OnFailure, Parallelism, Workflow,
    WorkflowConfig, WorkflowSource, WorkflowStatus, WorkflowStep, WorkflowStepStatus,
};

use crate::eventbus::EventBuffer;
use crate::runner::{ExecutionTask, Runner, RunnerError};
use crate::storage::{Storage, StorageError};
use crate::transport::TransportManager;
use crate::{git, worktree};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const STEP_HARD_CAP: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("worktree error: {0}")]
    Worktree(#[from] worktree::WorktreeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// `WorkflowCycleError` (spec Section 4.5.1, E3): every offending cycle,
    /// each listed as an ordered chain of issue ids.
    #[error("workflow has dependency cycles: {0:?}")]
    Cycle(Vec<Vec<String>>),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// In-memory control flags for a running workflow, kept separate from the
/// persisted `WorkflowStatus` (mirrors `Scheduler`'s shutdown-flag idiom).
#[derive(Default)]
struct WorkflowControls {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

/// Reads/writes the `.sudocode/issues.jsonl` and `.sudocode/specs.jsonl`
/// entity logs that back workflow source resolution and step prompts.
struct EntityStore {
    issues: Vec<JsonlEntity>,
    specs: Vec<JsonlEntity>,
}

impl EntityStore {
    fn load(workspace_root: &Path) -> Result<Self> {
        let base = workspace_root.join(".sudocode");
        Ok(Self {
            issues: read_jsonl_file(&base.join("issues.jsonl"))?,
            specs: read_jsonl_file(&base.join("specs.jsonl"))?,
        })
    }

    fn issue(&self, id: &str) -> Option<&JsonlEntity> {
        self.issues.iter().find(|e| e.id == id)
    }

    fn spec_exists(&self, spec_id: &str) -> bool {
        self.specs.iter().any(|s| s.id == spec_id)
    }

    /// Issues whose relationships mark them a child of `spec_id`.
    fn children_of_spec(&self, spec_id: &str) -> Vec<String> {
        self.issues
            .iter()
            .filter(|issue| {
                issue
                    .relationships
                    .iter()
                    .any(|r| r.kind == "child_of" && r.to_type == "spec" && r.to_id == spec_id)
            })
            .map(|issue| issue.id.clone())
            .collect()
    }

    /// Transitive closure of `root_id` over `depends_on`/`child_of` edges.
    fn transitive_closure(&self, root_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![root_id.to_string()];
        let mut ordered = Vec::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            ordered.push(id.clone());
            for issue in &self.issues {
                let related = issue.relationships.iter().any(|r| {
                    (r.kind == "depends_on" || r.kind == "child_of") && r.to_id == id
                });
                if related && !seen.contains(&issue.id) {
                    stack.push(issue.id.clone());
                }
            }
        }
        ordered
    }

    /// Issue ids that `issue_id` depends on, restricted to `within`.
    fn dependency_ids(&self, issue_id: &str, within: &HashSet<String>) -> Vec<String> {
        self.issue(issue_id)
            .map(|issue| {
                issue
                    .relationships
                    .iter()
                    .filter(|r| r.kind == "depends_on" && within.contains(&r.to_id))
                    .map(|r| r.to_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn title(&self, issue_id: &str) -> String {
        self.issue(issue_id)
            .and_then(|issue| issue.extensions.get("title"))
            .and_then(Value::as_str)
            .unwrap_or(issue_id)
            .to_string()
    }

    fn content(&self, issue_id: &str) -> String {
        self.issue(issue_id)
            .and_then(|issue| issue.extensions.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Append a `closed` marker to the issue's record (non-fatal, best effort).
    fn close_issue(&self, workspace_root: &Path, issue_id: &str) -> Result<()> {
        let Some(issue) = self.issue(issue_id) else {
            return Ok(());
        };
        let mut closed = issue.clone();
        closed.updated_at = Utc::now();
        closed
            .extensions
            .insert("status".to_string(), json!("closed"));
        append_jsonl_line(&workspace_root.join(".sudocode/issues.jsonl"), &closed)?;
        Ok(())
    }
}

pub(crate) fn read_jsonl_file(path: &Path) -> Result<Vec<JsonlEntity>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut entities = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        entities.push(serde_json::from_str(line)?);
    }
    Ok(entities)
}

pub(crate) fn append_jsonl_line(path: &Path, entity: &JsonlEntity) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut canon = entity.clone();
    canon.canonicalize();
    writeln!(file, "{}", serde_json::to_string(&canon)?)?;
    Ok(())
}

/// Resolve a `WorkflowSource` to an ordered set of issue ids plus the
/// dependency edges (issue id → issue ids it depends on) restricted to that
/// set (spec Section 4.5.1).
fn resolve_source(
    source: &WorkflowSource,
    entities: &EntityStore,
) -> (Vec<String>, HashMap<String, Vec<String>>) {
    let issue_ids: Vec<String> = match source {
        WorkflowSource::Spec { path } => {
            if !entities.spec_exists(path) {
                tracing::warn!(spec_id = %path, "workflow source spec not found in specs.jsonl");
            }
            entities.children_of_spec(path)
        }
        WorkflowSource::Issues { issue_ids } => issue_ids.clone(),
        WorkflowSource::RootIssue { issue_id } => entities.transitive_closure(issue_id),
        WorkflowSource::Goal => Vec::new(),
    };

    let within: HashSet<String> = issue_ids.iter().cloned().collect();
    let mut deps = HashMap::new();
    for id in &issue_ids {
        deps.insert(id.clone(), entities.dependency_ids(id, &within));
    }
    (issue_ids, deps)
}

/// Detect cycles via DFS color-marking (white/gray/black), collecting every
/// offending cycle rather than failing on the first one found (E3).
fn detect_cycles(issue_ids: &[String], deps: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<&str, Color> = issue_ids.iter().map(|id| (id.as_str(), Color::White)).collect();
    let mut path: Vec<String> = Vec::new();
    let mut cycles = Vec::new();

    fn visit<'a>(
        node: &'a str,
        deps: &'a HashMap<String, Vec<String>>,
        color: &mut HashMap<&'a str, Color>,
        path: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        color.insert(node, Color::Gray);
        path.push(node.to_string());

        if let Some(edges) = deps.get(node) {
            for next in edges {
                match color.get(next.as_str()).copied() {
                    Some(Color::Gray) => {
                        let start = path.iter().position(|n| n == next).unwrap_or(0);
                        cycles.push(path[start..].to_vec());
                    }
                    Some(Color::White) | None => {
                        visit(next, deps, color, path, cycles);
                    }
                    Some(Color::Black) => {}
                }
            }
        }

        path.pop();
        color.insert(node, Color::Black);
    }

    for id in issue_ids {
        if color.get(id.as_str()).copied() == Some(Color::White) {
            visit(id, deps, &mut color, &mut path, &mut cycles);
        }
    }
    cycles
}

/// Binds the Execution Runner into a DAG-ordered multi-step workflow.
pub struct WorkflowEngine {
    storage: Arc<Storage>,
    runner: Arc<Runner>,
    events: Arc<EventBuffer>,
    transport: Arc<TransportManager>,
    controls: Mutex<HashMap<Id, Arc<WorkflowControls>>>,
}

impl WorkflowEngine {
    pub fn new(
        storage: Arc<Storage>,
        runner: Arc<Runner>,
        events: Arc<EventBuffer>,
        transport: Arc<TransportManager>,
    ) -> Self {
        Self {
            storage,
            runner,
            events,
            transport,
            controls: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `source`, build the step DAG, verify acyclicity, and persist
    /// the workflow and its steps (spec Section 4.5.1).
    pub async fn create_workflow(
        &self,
        workspace_root: &Path,
        title: String,
        source: WorkflowSource,
        base_branch: String,
        config: WorkflowConfig,
    ) -> Result<Workflow> {
        let entities = EntityStore::load(workspace_root)?;
        let (issue_ids, deps) = resolve_source(&source, &entities);

        let cycles = detect_cycles(&issue_ids, &deps);
        if !cycles.is_empty() {
            return Err(WorkflowError::Cycle(cycles));
        }

        let now = Utc::now();
        let workflow = Workflow {
            id: Id::new(),
            title,
            source,
            base_branch,
            worktree_path: None,
            status: WorkflowStatus::Pending,
            config,
            current_step_index: 0,
            config_json: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_workflow(&workflow).await?;

        let mut step_ids: HashMap<&str, Id> = HashMap::new();
        for issue_id in &issue_ids {
            step_ids.insert(issue_id.as_str(), Id::new());
        }

        for (index, issue_id) in issue_ids.iter().enumerate() {
            let dependencies = deps
                .get(issue_id)
                .into_iter()
                .flatten()
                .filter_map(|dep_issue_id| step_ids.get(dep_issue_id.as_str()).cloned())
                .collect();

            let step = WorkflowStep {
                id: step_ids.get(issue_id.as_str()).cloned().unwrap_or_else(Id::new),
                workflow_id: workflow.id.clone(),
                issue_id: issue_id.clone(),
                index: index as u32,
                dependencies,
                status: WorkflowStepStatus::Pending,
                execution_id: None,
                error: None,
                commit_sha: None,
            };
            self.storage.insert_workflow_step(&step).await?;
        }

        Ok(workflow)
    }

    async fn emit(&self, workflow_id: &Id, event_type: weave_core::AgUiEventType, fields: Value) {
        let mut event = weave_core::AgUiEvent::new(event_type, workflow_id.clone(), Utc::now().timestamp_millis());
        if let Value::Object(map) = fields {
            event.fields = map;
        }
        self.events.add_event(workflow_id, event.clone()).await;
        self.transport.broadcast_to_run(workflow_id, event).await;
    }

    async fn controls_for(&self, workflow_id: &Id) -> Arc<WorkflowControls> {
        let mut controls = self.controls.lock().await;
        controls
            .entry(workflow_id.clone())
            .or_insert_with(|| Arc::new(WorkflowControls::default()))
            .clone()
    }

    /// Run the main scheduling loop to completion (spec Section 4.5.2).
    /// Intended to be spawned as a background task by the caller.
    pub async fn run(&self, workflow_id: &Id, workspace_root: &Path, daemon_config: &Config) -> Result<()> {
        let controls = self.controls_for(workflow_id).await;
        self.storage
            .update_workflow_status(workflow_id, WorkflowStatus::Running)
            .await?;

        let mut worktree_path: Option<String> = None;

        loop {
            if controls.cancelled.load(Ordering::SeqCst) {
                self.storage
                    .update_workflow_status(workflow_id, WorkflowStatus::Cancelled)
                    .await?;
                return Ok(());
            }

            if controls.paused.load(Ordering::SeqCst) {
                self.storage
                    .update_workflow_status(workflow_id, WorkflowStatus::Paused)
                    .await?;
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let workflow = self.storage.get_workflow(workflow_id).await?;
            let steps = self.storage.list_workflow_steps(workflow_id).await?;

            let all_done = steps
                .iter()
                .all(|s| s.status.is_terminal() || s.status == WorkflowStepStatus::Failed);
            if all_done {
                // A `Failed` step is only fatal to the workflow when its policy is
                // `stop`/`pause`, or when it left a dependent `blocked`.
                // Under `skip_dependents`/`continue` the failure was already
                // absorbed (dependents skipped or blocked is checked separately),
                // so the workflow completes.
                let any_blocked = steps.iter().any(|s| s.status == WorkflowStepStatus::Blocked);
                let policy_is_fatal = matches!(workflow.config.on_failure, OnFailure::Stop | OnFailure::Pause);
                let any_failed = steps.iter().any(|s| s.status == WorkflowStepStatus::Failed);
                let final_status = if any_blocked || (policy_is_fatal && any_failed) {
                    WorkflowStatus::Failed
                } else {
                    WorkflowStatus::Completed
                };
                self.storage.update_workflow_status(workflow_id, final_status).await?;
                return Ok(());
            }

            let ready: Vec<&WorkflowStep> = steps
                .iter()
                .filter(|s| s.status == WorkflowStepStatus::Pending || s.status == WorkflowStepStatus::Ready)
                .filter(|s| {
                    s.dependencies.iter().all(|dep_id| {
                        steps
                            .iter()
                            .find(|other| &other.id == dep_id)
                            .map(|other| other.status == WorkflowStepStatus::Completed)
                            .unwrap_or(false)
                    })
                })
                .collect();

            if ready.is_empty() {
                let any_running = steps.iter().any(|s| s.status == WorkflowStepStatus::Running);
                if !any_running {
                    tracing::warn!(workflow_id = %workflow_id, "workflow stuck: no ready steps and none running");
                    self.storage.update_workflow_status(workflow_id, WorkflowStatus::Failed).await?;
                    return Ok(());
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let batch: Vec<Id> = match workflow.config.parallelism {
                Parallelism::Sequential => vec![ready[0].id.clone()],
                Parallelism::Parallel => ready
                    .iter()
                    .take(workflow.config.max_concurrency.max(1) as usize)
                    .map(|s| s.id.clone())
                    .collect(),
            };

            let entities = EntityStore::load(workspace_root)?;

            if worktree_path.is_none() {
                worktree_path = self
                    .ensure_worktree(&workflow, workspace_root, daemon_config)
                    .await?;
            }

            if workflow.config.parallelism == Parallelism::Sequential {
                let step_id = &batch[0];
                self.execute_step(
                    &workflow,
                    step_id,
                    workspace_root,
                    worktree_path.as_deref(),
                    &entities,
                    daemon_config,
                )
                .await?;
            } else {
                let mut handles = Vec::new();
                for step_id in &batch {
                    handles.push(self.execute_step(
                        &workflow,
                        step_id,
                        workspace_root,
                        worktree_path.as_deref(),
                        &entities,
                        daemon_config,
                    ));
                }
                for result in futures_util::future::join_all(handles).await {
                    result?;
                }
            }
        }
    }

    async fn ensure_worktree(
        &self,
        workflow: &Workflow,
        workspace_root: &Path,
        daemon_config: &Config,
    ) -> Result<Option<String>> {
        if let Some(path) = &workflow.worktree_path {
            return Ok(Some(path.clone()));
        }
        if let Some(path) = &workflow.config.reuse_worktree_path {
            return Ok(Some(path.clone()));
        }

        let provider = worktree::resolve_provider(daemon_config, workspace_root)?;
        let mut exec_worktree: ExecutionWorktree =
            git::build_worktree_config(daemon_config, workspace_root, &workflow.title, workspace_root)?;
        exec_worktree.base_branch = workflow.base_branch.clone();
        exec_worktree.provider = provider;
        worktree::prepare(workspace_root, &exec_worktree, daemon_config)?;

        Ok(Some(exec_worktree.worktree_path))
    }

    /// Execute one step: build prompt, launch via the Execution Runner, poll
    /// to terminal, apply the auto-commit path or the failure policy
    /// (spec Section 4.5.3).
    async fn execute_step(
        &self,
        workflow: &Workflow,
        step_id: &Id,
        workspace_root: &Path,
        worktree_path: Option<&str>,
        entities: &EntityStore,
        daemon_config: &Config,
    ) -> Result<()> {
        let mut step = self.storage.get_workflow_step(step_id).await?;
        let all_steps = self.storage.list_workflow_steps(&workflow.id).await?;
        let total = all_steps.len();
        let step_number = step.index + 1;

        let title = entities.title(&step.issue_id);
        let content = entities.content(&step.issue_id);
        let prompt = format!(
            "{content}\n\n--- Workflow Context ---\nWorkflow: {workflow_title}\nStep: {step_number} of {total}\nIssue: {issue_id} — {title}",
            workflow_title = workflow.title,
            issue_id = step.issue_id,
        );

        step.status = WorkflowStepStatus::Running;
        self.storage
            .update_workflow_step_status(&step.id, WorkflowStepStatus::Running)
            .await?;
        self.emit(
            &workflow.id,
            weave_core::AgUiEventType::StepStarted,
            json!({ "stepId": step.id.to_string(), "issueId": step.issue_id, "index": step.index }),
        )
        .await;

        let work_dir: PathBuf = worktree_path.map(PathBuf::from).unwrap_or_else(|| workspace_root.to_path_buf());

        let now = Utc::now();
        let execution = weave_core::Execution {
            id: Id::new(),
            name: format!("{}-step-{}", workflow.title, step_number),
            name_source: weave_core::NameSource::SpecSlug,
            status: ExecutionStatus::Pending,
            issue_id: Some(step.issue_id.clone()),
            workflow_id: Some(workflow.id.clone()),
            workflow_step_id: Some(step.id.clone()),
            workspace_root: workspace_root.to_string_lossy().to_string(),
            worktree: None,
            worktree_cleanup_status: None,
            worktree_cleaned_at: None,
            base_commit: worktree_path.map(|_| git::current_commit(&work_dir).unwrap_or_default()),
            after_commit: None,
            error_message: None,
            config_json: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_execution(&execution).await?;
        self.storage
            .update_workflow_step_result(&step.id, WorkflowStepStatus::Running, Some(&execution.id), None, None)
            .await?;

        let task = ExecutionTask {
            agent_type: workflow.config.default_agent_type.clone(),
            model: daemon_config.model.clone(),
            prompt,
            work_dir: work_dir.clone(),
        };

        let run_result = tokio::time::timeout(STEP_HARD_CAP, self.runner.run(&execution, task)).await;

        let terminal_status = match run_result {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                tracing::warn!(step_id = %step.id, error = %e, "step execution failed");
                ExecutionStatus::Failed
            }
            Err(_) => {
                tracing::warn!(step_id = %step.id, "step execution timed out");
                self.runner.cancel(&execution.id).await.ok();
                ExecutionStatus::Failed
            }
        };

        if terminal_status == ExecutionStatus::Completed {
            let mut commit_sha = None;
            if workflow.config.auto_commit_after_step {
                if let Some(path) = worktree_path {
                    let message = format!(
                        "[Workflow {step_number}/{total}] {issue_id}: {title}\n\nWorkflow: {workflow_title}\nStep: {step_number} of {total}",
                        issue_id = step.issue_id,
                        workflow_title = workflow.title,
                    );
                    commit_sha = git::stage_and_commit(Path::new(path), &message)?;
                }
            }
            self.storage
                .update_workflow_step_result(
                    &step.id,
                    WorkflowStepStatus::Completed,
                    Some(&execution.id),
                    None,
                    commit_sha.as_deref(),
                )
                .await?;

            if let Err(e) = entities.close_issue(workspace_root, &step.issue_id) {
                tracing::warn!(step_id = %step.id, error = %e, "failed to close issue (non-fatal)");
            }

            self.storage
                .update_workflow_current_step_index(&workflow.id, step.index + 1)
                .await?;
            self.emit(
                &workflow.id,
                weave_core::AgUiEventType::StepFinished,
                json!({ "stepId": step.id.to_string(), "issueId": step.issue_id }),
            )
            .await;
        } else {
            let error = "execution did not complete successfully".to_string();
            self.storage
                .update_workflow_step_result(
                    &step.id,
                    WorkflowStepStatus::Failed,
                    Some(&execution.id),
                    Some(&error),
                    None,
                )
                .await?;
            self.emit(
                &workflow.id,
                weave_core::AgUiEventType::StepFailed,
                json!({ "stepId": step.id.to_string(), "issueId": step.issue_id, "error": error }),
            )
            .await;

            self.apply_failure_policy(workflow, &step, &all_steps).await?;
        }

        Ok(())
    }

    async fn apply_failure_policy(
        &self,
        workflow: &Workflow,
        failed_step: &WorkflowStep,
        all_steps: &[WorkflowStep],
    ) -> Result<()> {
        match workflow.config.on_failure {
            OnFailure::Stop => {
                self.storage
                    .update_workflow_status(&workflow.id, WorkflowStatus::Failed)
                    .await?;
            }
            OnFailure::Pause => {
                let controls = self.controls_for(&workflow.id).await;
                controls.paused.store(true, Ordering::SeqCst);
                self.storage
                    .update_workflow_status(&workflow.id, WorkflowStatus::Paused)
                    .await?;
            }
            OnFailure::SkipDependents => {
                self.skip_transitive_dependents(all_steps, &failed_step.id, &format!("Dependency {} failed", failed_step.id))
                    .await?;
            }
            OnFailure::Continue => {
                self.block_transitive_dependents(all_steps, &failed_step.id).await?;
            }
        }
        Ok(())
    }

    async fn skip_transitive_dependents(&self, all_steps: &[WorkflowStep], root: &Id, reason: &str) -> Result<()> {
        let mut queue = vec![root.clone()];
        let mut visited = HashSet::new();
        while let Some(current) = queue.pop() {
            for step in all_steps {
                if step.dependencies.contains(&current) && visited.insert(step.id.clone()) {
                    self.storage
                        .update_workflow_step_result(
                            &step.id,
                            WorkflowStepStatus::Skipped,
                            None,
                            Some(reason),
                            None,
                        )
                        .await?;
                    self.emit(
                        &step.workflow_id,
                        weave_core::AgUiEventType::StepSkipped,
                        json!({ "stepId": step.id.to_string(), "issueId": step.issue_id, "reason": reason }),
                    )
                    .await;
                    queue.push(step.id.clone());
                }
            }
        }
        Ok(())
    }

    async fn block_transitive_dependents(&self, all_steps: &[WorkflowStep], root: &Id) -> Result<()> {
        let mut queue = vec![root.clone()];
        let mut visited = HashSet::new();
        while let Some(current) = queue.pop() {
            for step in all_steps {
                if step.dependencies.contains(&current) && visited.insert(step.id.clone()) {
                    self.storage
                        .update_workflow_step_status(&step.id, WorkflowStepStatus::Blocked)
                        .await?;
                    queue.push(step.id.clone());
                }
            }
        }
        Ok(())
    }

    // --- External controls (spec Section 4.5.4) ---

    pub async fn pause_workflow(&self, workflow_id: &Id) -> Result<()> {
        let controls = self.controls_for(workflow_id).await;
        controls.paused.store(true, Ordering::SeqCst);
        self.storage.update_workflow_status(workflow_id, WorkflowStatus::Paused).await?;
        Ok(())
    }

    pub async fn resume_workflow(&self, workflow_id: &Id) -> Result<()> {
        let controls = self.controls_for(workflow_id).await;
        controls.paused.store(false, Ordering::SeqCst);
        self.storage.update_workflow_status(workflow_id, WorkflowStatus::Running).await?;
        Ok(())
    }

    pub async fn cancel_workflow(&self, workflow_id: &Id) -> Result<()> {
        let controls = self.controls_for(workflow_id).await;
        controls.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn retry_step(&self, step_id: &Id) -> Result<()> {
        let step = self.storage.get_workflow_step(step_id).await?;
        if step.status != WorkflowStepStatus::Failed {
            return Ok(());
        }
        self.storage
            .update_workflow_step_result(step_id, WorkflowStepStatus::Pending, None, None, None)
            .await?;
        Ok(())
    }

    pub async fn skip_step(&self, step_id: &Id) -> Result<()> {
        let step = self.storage.get_workflow_step(step_id).await?;
        let all_steps = self.storage.list_workflow_steps(&step.workflow_id).await?;
        self.storage
            .update_workflow_step_result(step_id, WorkflowStepStatus::Skipped, None, None, None)
            .await?;
        self.skip_transitive_dependents(&all_steps, step_id, &format!("Dependency {step_id} was skipped"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::process::ProcessSupervisor;
    use crate::runner::RunnerConfig;

    fn entity(id: &str, deps: &[(&str, &str)]) -> JsonlEntity {
        JsonlEntity {
            entity_type: weave_core::jsonl::EntityKind::Issue,
            uuid: format!("uuid-{id}"),
            id: id.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            relationships: deps
                .iter()
                .map(|(to_id, kind)| weave_core::jsonl::Relationship {
                    to_id: to_id.to_string(),
                    to_type: "issue".to_string(),
                    kind: kind.to_string(),
                })
                .collect(),
            tags: Vec::new(),
            feedback: Vec::new(),
            archived: false,
            extensions: serde_json::Map::new(),
        }
    }

    #[test]
    fn detect_cycles_finds_three_node_cycle() {
        let issues = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let mut deps = HashMap::new();
        deps.insert("A".to_string(), vec!["B".to_string()]);
        deps.insert("B".to_string(), vec!["C".to_string()]);
        deps.insert("C".to_string(), vec!["A".to_string()]);

        let cycles = detect_cycles(&issues, &deps);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 3);
    }

    #[test]
    fn detect_cycles_empty_for_dag() {
        let issues = vec!["A".to_string(), "B".to_string()];
        let mut deps = HashMap::new();
        deps.insert("A".to_string(), vec!["B".to_string()]);
        deps.insert("B".to_string(), vec![]);

        assert!(detect_cycles(&issues, &deps).is_empty());
    }

    #[test]
    fn resolve_source_issues_returns_exact_list() {
        let entities = EntityStore {
            issues: vec![entity("A", &[]), entity("B", &[("A", "depends_on")])],
            specs: Vec::new(),
        };
        let source = WorkflowSource::Issues {
            issue_ids: vec!["A".to_string(), "B".to_string()],
        };
        let (ids, deps) = resolve_source(&source, &entities);
        assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(deps.get("B").unwrap(), &vec!["A".to_string()]);
    }

    #[test]
    fn resolve_source_root_issue_follows_depends_on_closure() {
        let entities = EntityStore {
            issues: vec![
                entity("A", &[]),
                entity("B", &[("A", "depends_on")]),
                entity("C", &[("B", "depends_on")]),
            ],
            specs: Vec::new(),
        };
        let source = WorkflowSource::RootIssue {
            issue_id: "C".to_string(),
        };
        let (ids, _) = resolve_source(&source, &entities);
        assert!(ids.contains(&"A".to_string()));
        assert!(ids.contains(&"B".to_string()));
        assert!(ids.contains(&"C".to_string()));
    }

    fn jsonl_issue(id: &str, deps: &[&str]) -> JsonlEntity {
        let now = Utc::now();
        let mut extensions = serde_json::Map::new();
        extensions.insert("title".to_string(), json!(id));
        extensions.insert("content".to_string(), json!(format!("do {id}")));
        JsonlEntity {
            entity_type: weave_core::jsonl::EntityKind::Issue,
            uuid: format!("uuid-{id}"),
            id: id.to_string(),
            created_at: now,
            updated_at: now,
            relationships: deps
                .iter()
                .map(|dep| weave_core::jsonl::Relationship {
                    to_id: dep.to_string(),
                    to_type: "issue".to_string(),
                    kind: "depends_on".to_string(),
                })
                .collect(),
            tags: Vec::new(),
            feedback: Vec::new(),
            archived: false,
            extensions,
        }
    }

    /// E4 — onFailure = skip_dependents. S1 -> S2, S1 -> S3, S1 fails (no
    /// agent adapter is registered, so every execution fails immediately).
    /// Expected: workflow completes, S2/S3 end `skipped` with a reason
    /// starting "Dependency ", and exactly one `step_failed` plus two
    /// `step_skipped` events are emitted.
    #[tokio::test]
    async fn e4_skip_dependents_completes_workflow_with_steps_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace_root = dir.path();
        std::fs::create_dir_all(workspace_root.join(".sudocode")).unwrap();
        let issues_path = workspace_root.join(".sudocode/issues.jsonl");
        for issue in [
            jsonl_issue("S1", &[]),
            jsonl_issue("S2", &["S1"]),
            jsonl_issue("S3", &["S1"]),
        ] {
            append_jsonl_line(&issues_path, &issue).unwrap();
        }

        let storage = Arc::new(Storage::new(&dir.path().join("test.db")).await.unwrap());
        storage.migrate_embedded().await.unwrap();
        let events = Arc::new(EventBuffer::new(10_000, 86_400));
        let transport = Arc::new(TransportManager::new(events.clone()));
        let processes = Arc::new(ProcessSupervisor::new());
        // Empty registry: any agent type is "not found", so every step's
        // execution fails immediately without spawning a real process.
        let adapters = Arc::new(AdapterRegistry::new());
        let runner_config = RunnerConfig {
            model: "sonnet".to_string(),
            timeout_sec: 60,
            retries: 0,
            retry_backoff_sec: 1,
        };
        let runner = Arc::new(Runner::new(
            Arc::clone(&storage),
            Arc::clone(&events),
            Arc::clone(&transport),
            processes,
            adapters,
            runner_config,
        ));
        let engine = WorkflowEngine::new(Arc::clone(&storage), runner, Arc::clone(&events), Arc::clone(&transport));

        let mut config = WorkflowConfig::default();
        config.on_failure = OnFailure::SkipDependents;

        let workflow = engine
            .create_workflow(
                workspace_root,
                "e4".to_string(),
                WorkflowSource::Issues {
                    issue_ids: vec!["S1".to_string(), "S2".to_string(), "S3".to_string()],
                },
                "main".to_string(),
                config,
            )
            .await
            .unwrap();

        let daemon_config = Config::default();
        engine.run(&workflow.id, workspace_root, &daemon_config).await.unwrap();

        let final_workflow = storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(final_workflow.status, WorkflowStatus::Completed);

        let steps = storage.list_workflow_steps(&workflow.id).await.unwrap();
        let step = |issue_id: &str| steps.iter().find(|s| s.issue_id == issue_id).unwrap();
        assert_eq!(step("S1").status, WorkflowStepStatus::Failed);
        assert_eq!(step("S2").status, WorkflowStepStatus::Skipped);
        assert_eq!(step("S3").status, WorkflowStepStatus::Skipped);
        assert!(step("S2").error.as_deref().unwrap_or("").starts_with("Dependency "));
        assert!(step("S3").error.as_deref().unwrap_or("").starts_with("Dependency "));

        let recorded = events.get_events(&workflow.id, None).await;
        let step_failed_count = recorded
            .iter()
            .filter(|e| e.event.event_type == weave_core::AgUiEventType::StepFailed)
            .count();
        let step_skipped_count = recorded
            .iter()
            .filter(|e| e.event.event_type == weave_core::AgUiEventType::StepSkipped)
            .count();
        assert_eq!(step_failed_count, 1);
        assert_eq!(step_skipped_count, 2);
    }
}
