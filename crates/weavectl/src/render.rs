//! Output rendering for weavectl CLI.
//!
//! Formats execution, workflow, and federation information for terminal
//! display (Section 7).

use weave_core::{
    CrossRepoRequest, Execution, ExecutionStatus, RemoteRepo, RequestStatus, Workflow,
    WorkflowStatus, WorkflowStep, WorkflowStepStatus,
};

pub fn print_execution_created(execution: &Execution) {
    println!("Created execution: {}", execution.id);
    println!("  Name:      {}", execution.name);
    println!("  Workspace: {}", execution.workspace_root);
    println!("  Status:    {}", format_execution_status(execution.status));
}

pub fn print_execution_list(executions: &[Execution]) {
    if executions.is_empty() {
        println!("No executions found.");
        return;
    }

    println!("{:<36}  {:<20}  {:<10}  {:<20}", "ID", "NAME", "STATUS", "CREATED");
    println!("{}", "-".repeat(90));

    for execution in executions {
        println!(
            "{:<36}  {:<20}  {:<10}  {:<20}",
            execution.id.0,
            truncate(&execution.name, 20),
            format_execution_status(execution.status),
            format_time(&execution.created_at),
        );
    }

    println!();
    println!("{} execution(s)", executions.len());
}

pub fn print_execution_details(execution: &Execution) {
    println!("Execution: {}", execution.id);
    println!();
    println!("  Name:           {}", execution.name);
    println!("  Name Source:    {}", execution.name_source.as_str());
    println!("  Status:         {}", format_execution_status(execution.status));
    println!("  Workspace:      {}", execution.workspace_root);
    if let Some(ref issue_id) = execution.issue_id {
        println!("  Issue:          {}", issue_id);
    }
    if let Some(ref workflow_id) = execution.workflow_id {
        println!("  Workflow:       {}", workflow_id);
    }

    if let Some(ref wt) = execution.worktree {
        println!();
        println!("  Worktree:");
        println!("    Base Branch:    {}", wt.base_branch);
        println!("    Run Branch:     {}", wt.run_branch);
        if let Some(ref target) = wt.merge_target_branch {
            println!("    Merge Target:   {}", target);
            println!("    Merge Strategy: {}", wt.merge_strategy.as_str());
        }
        println!("    Path:           {}", wt.worktree_path);
    }

    if let Some(ref error) = execution.error_message {
        println!();
        println!("  Error:          {}", error);
    }

    println!();
    println!("  Created:        {}", format_time(&execution.created_at));
    println!("  Updated:        {}", format_time(&execution.updated_at));
}

pub fn print_workflow_created(workflow: &Workflow) {
    println!("Created workflow: {}", workflow.id);
    println!("  Title:  {}", workflow.title);
    println!("  Status: {}", format_workflow_status(workflow.status));
}

pub fn print_workflow_list(workflows: &[Workflow]) {
    if workflows.is_empty() {
        println!("No workflows found.");
        return;
    }

    println!("{:<36}  {:<24}  {:<10}  {:<20}", "ID", "TITLE", "STATUS", "CREATED");
    println!("{}", "-".repeat(94));

    for workflow in workflows {
        println!(
            "{:<36}  {:<24}  {:<10}  {:<20}",
            workflow.id.0,
            truncate(&workflow.title, 24),
            format_workflow_status(workflow.status),
            format_time(&workflow.created_at),
        );
    }

    println!();
    println!("{} workflow(s)", workflows.len());
}

pub fn print_workflow_details(workflow: &Workflow, steps: &[WorkflowStep]) {
    println!("Workflow: {}", workflow.id);
    println!();
    println!("  Title:          {}", workflow.title);
    println!("  Status:         {}", format_workflow_status(workflow.status));
    println!("  Base Branch:    {}", workflow.base_branch);
    if let Some(ref path) = workflow.worktree_path {
        println!("  Worktree:       {}", path);
    }
    println!("  On Failure:     {}", workflow.config.on_failure.as_str());
    println!("  Current Step:   {}", workflow.current_step_index);

    println!();
    println!("  Created:        {}", format_time(&workflow.created_at));
    println!("  Updated:        {}", format_time(&workflow.updated_at));

    if !steps.is_empty() {
        println!();
        println!("  Steps:");
        println!("    {:<36}  {:<5}  {:<10}  {:<36}", "ID", "IDX", "STATUS", "EXECUTION");
        println!("    {}", "-".repeat(92));

        for step in steps {
            let execution_id = step.execution_id.as_ref().map(|id| id.0.clone()).unwrap_or_else(|| "-".to_string());
            println!(
                "    {:<36}  {:<5}  {:<10}  {:<36}",
                step.id.0,
                step.index,
                format_workflow_step_status(step.status),
                execution_id,
            );
            if let Some(ref error) = step.error {
                println!("      error: {}", error);
            }
        }
    }
}

pub fn print_remote_list(remotes: &[RemoteRepo]) {
    if remotes.is_empty() {
        println!("No remotes registered.");
        return;
    }

    println!("{:<30}  {:<10}  {:<10}  {:<40}", "NAME", "TRUST", "SYNC", "URL");
    println!("{}", "-".repeat(94));

    for remote in remotes {
        println!(
            "{:<30}  {:<10}  {:<10}  {:<40}",
            truncate(&remote.display_name, 30),
            remote.trust_level.as_str(),
            remote.sync_status.as_str(),
            truncate(&remote.url, 40),
        );
    }

    println!();
    println!("{} remote(s)", remotes.len());
}

pub fn print_request_list(requests: &[CrossRepoRequest]) {
    if requests.is_empty() {
        println!("No cross-repo requests found.");
        return;
    }

    println!("{:<36}  {:<18}  {:<10}  {:<20}", "ID", "TYPE", "STATUS", "FROM -> TO");
    println!("{}", "-".repeat(94));

    for request in requests {
        println!(
            "{:<36}  {:<18}  {:<10}  {} -> {}",
            request.request_id.0,
            truncate(&request.request_type, 18),
            format_request_status(request.status),
            request.from_repo,
            request.to_repo,
        );
    }

    println!();
    println!("{} request(s)", requests.len());
}

fn format_execution_status(status: ExecutionStatus) -> &'static str {
    status.as_str()
}

fn format_workflow_status(status: WorkflowStatus) -> &'static str {
    status.as_str()
}

fn format_workflow_step_status(status: WorkflowStepStatus) -> &'static str {
    status.as_str()
}

fn format_request_status(status: RequestStatus) -> &'static str {
    status.as_str()
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}
