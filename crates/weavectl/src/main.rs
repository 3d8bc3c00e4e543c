//! weavectl - CLI client for weaved.
//!
//! Local control plane client for the execution & workflow core daemon.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, CreateExecutionRequest, CreateWorkflowRequest, RegisterRemoteRequest};
use weave_core::{RequestStatus, TrustLevel, WorkflowSource};

#[derive(Parser)]
#[command(name = "weavectl", about = "Control plane client for the execution & workflow core daemon")]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7700)
    #[arg(long, global = true, env = "WEAVED_ADDR")]
    addr: Option<String>,

    /// Auth token for the daemon's HTTP API
    #[arg(long, global = true, env = "WEAVED_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch an execution
    Run {
        /// Agent type to launch (e.g. claude, codex)
        #[arg(long, default_value = "claude")]
        agent_type: String,

        /// Prompt text to send to the agent
        prompt: String,

        /// Workspace root the agent should operate in (defaults to cwd)
        #[arg(long)]
        workspace_root: Option<String>,

        /// Work directory within the workspace (defaults to workspace root)
        #[arg(long)]
        work_dir: Option<String>,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        /// Human-readable name for the execution
        #[arg(long)]
        name: Option<String>,

        /// Issue identifier this execution is servicing
        #[arg(long)]
        issue_id: Option<String>,
    },

    /// List executions
    List {
        /// Show only executions for current workspace
        #[arg(long)]
        workspace: bool,
    },

    /// Show detailed information about an execution
    Inspect {
        /// Execution ID
        execution_id: String,
    },

    /// Cancel a running execution
    Cancel {
        /// Execution ID
        execution_id: String,
    },

    /// Stream live AG-UI events from an execution
    Tail {
        /// Execution ID
        execution_id: String,
    },

    /// Create a workflow from a spec file, issue set, or root issue
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },

    /// Manage federation remotes and cross-repo requests
    Federation {
        #[command(subcommand)]
        command: FederationCommand,
    },
}

#[derive(Subcommand)]
enum WorkflowCommand {
    /// Create a workflow from a spec file
    Create {
        /// Workflow title
        title: String,

        /// Path to the spec file that defines the step set
        #[arg(long)]
        spec: Option<String>,

        /// Issue IDs to build the workflow from (comma-separated)
        #[arg(long, value_delimiter = ',')]
        issues: Vec<String>,

        /// Root issue ID to derive the workflow from
        #[arg(long)]
        root_issue: Option<String>,

        /// Workspace root (defaults to cwd)
        #[arg(long)]
        workspace_root: Option<String>,

        /// Base branch for the workflow's worktree
        #[arg(long)]
        base_branch: Option<String>,
    },

    /// List workflows
    List,

    /// Show detailed information about a workflow, including its steps
    Inspect {
        /// Workflow ID
        workflow_id: String,
    },

    /// Pause a running workflow
    Pause {
        /// Workflow ID
        workflow_id: String,
    },

    /// Resume a paused workflow
    Resume {
        /// Workflow ID
        workflow_id: String,
    },

    /// Cancel a workflow
    Cancel {
        /// Workflow ID
        workflow_id: String,
    },

    /// Retry a failed workflow step
    RetryStep {
        /// Workflow step ID
        step_id: String,
    },

    /// Skip a blocked or failed workflow step
    SkipStep {
        /// Workflow step ID
        step_id: String,
    },

    /// Stream live events from a workflow
    Tail {
        /// Workflow ID
        workflow_id: String,
    },
}

#[derive(Subcommand)]
enum FederationCommand {
    /// Show this daemon's federation capabilities
    Info,

    /// Report federation health (remote sync status, stale connections)
    Health,

    /// Register a remote repository peer
    Register {
        /// Remote repo identifier (e.g. its git remote URL)
        url: String,

        /// Human-readable display name
        #[arg(long)]
        name: String,

        /// Trust level granted to this peer
        #[arg(long, value_parser = parse_trust_level, default_value = "untrusted")]
        trust: TrustLevel,

        /// REST endpoint base URL for outgoing requests
        #[arg(long, default_value = "")]
        rest_endpoint: String,

        /// WebSocket endpoint for subscriptions
        #[arg(long)]
        ws_endpoint: Option<String>,

        /// Enable periodic auto-sync
        #[arg(long)]
        auto_sync: bool,

        /// Auto-sync interval in minutes
        #[arg(long, default_value_t = 15)]
        sync_interval_minutes: u32,
    },

    /// List registered remotes
    Remotes,

    /// List cross-repo requests
    Requests {
        /// Filter by status (pending, approved, rejected, completed, failed)
        #[arg(long, value_parser = parse_request_status)]
        status: Option<RequestStatus>,
    },

    /// Approve a pending cross-repo request
    Approve {
        /// Request ID
        request_id: String,

        /// Identifier of the approving operator
        #[arg(long, default_value = "weavectl")]
        approver: String,
    },

    /// Reject a pending cross-repo request
    Reject {
        /// Request ID
        request_id: String,

        /// Reason for rejection
        reason: String,
    },
}

fn parse_trust_level(s: &str) -> Result<TrustLevel, String> {
    TrustLevel::from_str(&s.to_lowercase())
        .ok_or_else(|| format!("invalid trust level '{}', expected: trusted, verified, untrusted", s))
}

fn parse_request_status(s: &str) -> Result<RequestStatus, String> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(RequestStatus::Pending),
        "approved" => Ok(RequestStatus::Approved),
        "rejected" => Ok(RequestStatus::Rejected),
        "completed" => Ok(RequestStatus::Completed),
        "failed" => Ok(RequestStatus::Failed),
        _ => Err(format!(
            "invalid status '{}', expected: pending, approved, rejected, completed, failed",
            s
        )),
    }
}

fn find_workspace_root() -> Result<std::path::PathBuf, ClientError> {
    std::env::current_dir().map_err(|e| ClientError::IoError(format!("cannot determine cwd: {}", e)))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli.addr.unwrap_or_else(|| "http://127.0.0.1:7700".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Run { agent_type, prompt, workspace_root, work_dir, model, name, issue_id } => {
            run_create(&client, agent_type, prompt, workspace_root, work_dir, model, name, issue_id).await
        }
        Command::List { workspace } => execution_list(&client, workspace).await,
        Command::Inspect { execution_id } => execution_inspect(&client, &execution_id).await,
        Command::Cancel { execution_id } => execution_cancel(&client, &execution_id).await,
        Command::Tail { execution_id } => client.tail_execution_events(&execution_id).await,
        Command::Workflow { command } => dispatch_workflow(&client, command).await,
        Command::Federation { command } => dispatch_federation(&client, command).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run_create(
    client: &Client,
    agent_type: String,
    prompt: String,
    workspace_root: Option<String>,
    work_dir: Option<String>,
    model: Option<String>,
    name: Option<String>,
    issue_id: Option<String>,
) -> Result<(), ClientError> {
    let workspace_root = match workspace_root {
        Some(ws) => ws,
        None => find_workspace_root()?.to_string_lossy().to_string(),
    };

    let req = CreateExecutionRequest { agent_type, prompt, workspace_root, work_dir, model, name, issue_id };
    let execution = client.create_execution(req).await?;
    render::print_execution_created(&execution);
    Ok(())
}

async fn execution_list(client: &Client, workspace: bool) -> Result<(), ClientError> {
    let workspace_root = if workspace { Some(find_workspace_root()?.to_string_lossy().to_string()) } else { None };
    let executions = client.list_executions(workspace_root.as_deref()).await?;
    render::print_execution_list(&executions);
    Ok(())
}

async fn execution_inspect(client: &Client, execution_id: &str) -> Result<(), ClientError> {
    let execution = client.get_execution(execution_id).await?;
    render::print_execution_details(&execution);
    Ok(())
}

async fn execution_cancel(client: &Client, execution_id: &str) -> Result<(), ClientError> {
    client.cancel_execution(execution_id).await?;
    println!("Execution {} canceled", execution_id);
    Ok(())
}

async fn dispatch_workflow(client: &Client, command: WorkflowCommand) -> Result<(), ClientError> {
    match command {
        WorkflowCommand::Create { title, spec, issues, root_issue, workspace_root, base_branch } => {
            workflow_create(client, title, spec, issues, root_issue, workspace_root, base_branch).await
        }
        WorkflowCommand::List => {
            let workflows = client.list_workflows().await?;
            render::print_workflow_list(&workflows);
            Ok(())
        }
        WorkflowCommand::Inspect { workflow_id } => {
            let workflow = client.get_workflow(&workflow_id).await?;
            let steps = client.list_workflow_steps(&workflow_id).await?;
            render::print_workflow_details(&workflow, &steps);
            Ok(())
        }
        WorkflowCommand::Pause { workflow_id } => {
            client.pause_workflow(&workflow_id).await?;
            println!("Workflow {} paused", workflow_id);
            Ok(())
        }
        WorkflowCommand::Resume { workflow_id } => {
            client.resume_workflow(&workflow_id).await?;
            println!("Workflow {} resumed", workflow_id);
            Ok(())
        }
        WorkflowCommand::Cancel { workflow_id } => {
            client.cancel_workflow(&workflow_id).await?;
            println!("Workflow {} canceled", workflow_id);
            Ok(())
        }
        WorkflowCommand::RetryStep { step_id } => {
            client.retry_workflow_step(&step_id).await?;
            println!("Step {} re-queued", step_id);
            Ok(())
        }
        WorkflowCommand::SkipStep { step_id } => {
            client.skip_workflow_step(&step_id).await?;
            println!("Step {} skipped", step_id);
            Ok(())
        }
        WorkflowCommand::Tail { workflow_id } => client.tail_workflow_events(&workflow_id).await,
    }
}

async fn workflow_create(
    client: &Client,
    title: String,
    spec: Option<String>,
    issues: Vec<String>,
    root_issue: Option<String>,
    workspace_root: Option<String>,
    base_branch: Option<String>,
) -> Result<(), ClientError> {
    let source = if let Some(path) = spec {
        WorkflowSource::Spec { path }
    } else if let Some(issue_id) = root_issue {
        WorkflowSource::RootIssue { issue_id }
    } else if !issues.is_empty() {
        WorkflowSource::Issues { issue_ids: issues }
    } else {
        WorkflowSource::Goal
    };

    let workspace_root = match workspace_root {
        Some(ws) => ws,
        None => find_workspace_root()?.to_string_lossy().to_string(),
    };

    let req = CreateWorkflowRequest {
        title,
        workspace_root,
        source,
        base_branch,
        config: weave_core::WorkflowConfig::default(),
    };
    let workflow = client.create_workflow(req).await?;
    render::print_workflow_created(&workflow);
    Ok(())
}

async fn dispatch_federation(client: &Client, command: FederationCommand) -> Result<(), ClientError> {
    match command {
        FederationCommand::Info => {
            let info = client.federation_info().await?;
            println!("{}", serde_json::to_string_pretty(&info).unwrap_or_default());
            Ok(())
        }
        FederationCommand::Health => {
            let health = client.federation_health().await?;
            println!("{}", serde_json::to_string_pretty(&health).unwrap_or_default());
            Ok(())
        }
        FederationCommand::Register { url, name, trust, rest_endpoint, ws_endpoint, auto_sync, sync_interval_minutes } => {
            let req = RegisterRemoteRequest {
                url,
                display_name: name,
                trust_level: trust,
                rest_endpoint,
                ws_endpoint,
                git_url: None,
                auto_sync,
                sync_interval_minutes,
            };
            let remote = client.register_remote(req).await?;
            println!("Registered remote: {} ({})", remote.display_name, remote.url);
            Ok(())
        }
        FederationCommand::Remotes => {
            let remotes = client.list_remotes().await?;
            render::print_remote_list(&remotes);
            Ok(())
        }
        FederationCommand::Requests { status } => {
            let requests = client.list_cross_repo_requests(status).await?;
            render::print_request_list(&requests);
            Ok(())
        }
        FederationCommand::Approve { request_id, approver } => {
            client.approve_cross_repo_request(&request_id, &approver).await?;
            println!("Request {} approved", request_id);
            Ok(())
        }
        FederationCommand::Reject { request_id, reason } => {
            client.reject_cross_repo_request(&request_id, &reason).await?;
            println!("Request {} rejected", request_id);
            Ok(())
        }
    }
}
