//! HTTP client for the weaved daemon.
//!
//! Communicates with weaved via its local HTTP API (Section 6).

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use weave_core::{
    CrossRepoRequest, Execution, RemoteRepo, RequestStatus, TrustLevel, Workflow, WorkflowConfig,
    WorkflowSource, WorkflowStep,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: weaved\n  → or set WEAVED_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check WEAVED_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure weaved is running\n  → check WEAVED_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for creating an execution (POST /executions).
#[derive(Debug, Serialize)]
pub struct CreateExecutionRequest {
    pub agent_type: String,
    pub prompt: String,
    pub workspace_root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
}

/// Request payload for creating a workflow (POST /workflows).
#[derive(Debug, Serialize)]
pub struct CreateWorkflowRequest {
    pub title: String,
    pub workspace_root: String,
    pub source: WorkflowSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub config: WorkflowConfig,
}

#[derive(Debug, Serialize)]
pub struct RegisterRemoteRequest {
    pub url: String,
    pub display_name: String,
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub rest_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,
    #[serde(default)]
    pub auto_sync: bool,
    pub sync_interval_minutes: u32,
}

#[derive(Debug, Deserialize)]
struct ExecutionResponse {
    execution: Execution,
}

#[derive(Debug, Deserialize)]
struct ListExecutionsResponse {
    executions: Vec<Execution>,
}

#[derive(Debug, Deserialize)]
struct WorkflowResponse {
    workflow: Workflow,
}

#[derive(Debug, Deserialize)]
struct ListWorkflowsResponse {
    workflows: Vec<Workflow>,
}

#[derive(Debug, Deserialize)]
struct ListWorkflowStepsResponse {
    steps: Vec<WorkflowStep>,
}

#[derive(Debug, Deserialize)]
struct RemoteRepoResponse {
    remote_repo: RemoteRepo,
}

#[derive(Debug, Deserialize)]
struct ListRemotesResponse {
    remote_repos: Vec<RemoteRepo>,
}

#[derive(Debug, Deserialize)]
struct ListRequestsResponse {
    requests: Vec<CrossRepoRequest>,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Default total timeout for daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for weaved.
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Check if the daemon is healthy by probing `/health`.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to become ready with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS).await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!("waiting for daemon at {} (retrying in {}ms)", self.base_url, backoff_ms);

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;

                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }
        if status == 404 {
            return ClientError::NotFound("resource not found".to_string());
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        ClientError::HttpError { status, message }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).headers(self.headers()).json(body).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn post_empty(&self, path: &str) -> Result<(), ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    // --- Executions (Section 4.4) ---

    pub async fn create_execution(&self, req: CreateExecutionRequest) -> Result<Execution, ClientError> {
        let body: ExecutionResponse = self.post_json("/executions", &req).await?;
        Ok(body.execution)
    }

    pub async fn list_executions(&self, workspace_root: Option<&str>) -> Result<Vec<Execution>, ClientError> {
        let path = match workspace_root {
            Some(ws) => format!("/executions?workspace_root={}", urlencoding::encode(ws)),
            None => "/executions".to_string(),
        };
        let body: ListExecutionsResponse = self.get_json(&path).await?;
        Ok(body.executions)
    }

    pub async fn get_execution(&self, id: &str) -> Result<Execution, ClientError> {
        let body: ExecutionResponse = self.get_json(&format!("/executions/{id}")).await?;
        Ok(body.execution)
    }

    pub async fn cancel_execution(&self, id: &str) -> Result<(), ClientError> {
        self.post_empty(&format!("/executions/{id}/cancel")).await
    }

    /// Tail the AG-UI event stream for an execution (SSE).
    pub async fn tail_execution_events(&self, id: &str) -> Result<(), ClientError> {
        self.tail_sse(&format!("/executions/{id}/events")).await
    }

    // --- Workflows (Section 4.5) ---

    pub async fn create_workflow(&self, req: CreateWorkflowRequest) -> Result<Workflow, ClientError> {
        let body: WorkflowResponse = self.post_json("/workflows", &req).await?;
        Ok(body.workflow)
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, ClientError> {
        let body: ListWorkflowsResponse = self.get_json("/workflows").await?;
        Ok(body.workflows)
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Workflow, ClientError> {
        let body: WorkflowResponse = self.get_json(&format!("/workflows/{id}")).await?;
        Ok(body.workflow)
    }

    pub async fn list_workflow_steps(&self, id: &str) -> Result<Vec<WorkflowStep>, ClientError> {
        let body: ListWorkflowStepsResponse = self.get_json(&format!("/workflows/{id}/steps")).await?;
        Ok(body.steps)
    }

    pub async fn pause_workflow(&self, id: &str) -> Result<(), ClientError> {
        self.post_empty(&format!("/workflows/{id}/pause")).await
    }

    pub async fn resume_workflow(&self, id: &str) -> Result<(), ClientError> {
        self.post_empty(&format!("/workflows/{id}/resume")).await
    }

    pub async fn cancel_workflow(&self, id: &str) -> Result<(), ClientError> {
        self.post_empty(&format!("/workflows/{id}/cancel")).await
    }

    pub async fn retry_workflow_step(&self, id: &str) -> Result<(), ClientError> {
        self.post_empty(&format!("/workflow-steps/{id}/retry")).await
    }

    pub async fn skip_workflow_step(&self, id: &str) -> Result<(), ClientError> {
        self.post_empty(&format!("/workflow-steps/{id}/skip")).await
    }

    pub async fn tail_workflow_events(&self, id: &str) -> Result<(), ClientError> {
        self.tail_sse(&format!("/workflows/{id}/events")).await
    }

    // --- Federation (Section 4.6) ---

    pub async fn federation_info(&self) -> Result<Value, ClientError> {
        self.get_json("/federation/info").await
    }

    pub async fn register_remote(&self, req: RegisterRemoteRequest) -> Result<RemoteRepo, ClientError> {
        let body: RemoteRepoResponse = self.post_json("/federation/remotes", &req).await?;
        Ok(body.remote_repo)
    }

    pub async fn list_remotes(&self) -> Result<Vec<RemoteRepo>, ClientError> {
        let body: ListRemotesResponse = self.get_json("/federation/remotes").await?;
        Ok(body.remote_repos)
    }

    pub async fn list_cross_repo_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<CrossRepoRequest>, ClientError> {
        let path = match status {
            Some(s) => format!("/federation/requests?status={}", s.as_str()),
            None => "/federation/requests".to_string(),
        };
        let body: ListRequestsResponse = self.get_json(&path).await?;
        Ok(body.requests)
    }

    pub async fn approve_cross_repo_request(&self, id: &str, approver: &str) -> Result<(), ClientError> {
        let req = serde_json::json!({ "approver": approver });
        let _: Value = self.post_json(&format!("/federation/requests/{id}/approve"), &req).await?;
        Ok(())
    }

    pub async fn reject_cross_repo_request(&self, id: &str, reason: &str) -> Result<(), ClientError> {
        let req = serde_json::json!({ "reason": reason });
        let _: Value = self.post_json(&format!("/federation/requests/{id}/reject"), &req).await?;
        Ok(())
    }

    pub async fn federation_health(&self) -> Result<Value, ClientError> {
        self.get_json("/federation/health").await
    }

    /// Stream an SSE endpoint to stdout, printing each event's `data` payload.
    async fn tail_sse(&self, path: &str) -> Result<(), ClientError> {
        use futures::StreamExt;

        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(end) = buffer.find("\n\n") {
                let event_str = buffer[..end].to_string();
                buffer = buffer[end + 2..].to_string();
                if let Some(data) = parse_sse_data(&event_str) {
                    println!("{data}");
                }
            }
        }

        Ok(())
    }
}

/// Extract the `data:` field of a single SSE event block.
fn parse_sse_data(event_str: &str) -> Option<String> {
    for line in event_str.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            return Some(value.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_data_extracts_payload() {
        let event_str = "event: run_started\nid: 1690000000\ndata: {\"runId\":\"abc\"}";
        assert_eq!(parse_sse_data(event_str), Some(r#"{"runId":"abc"}"#.to_string()));
    }

    #[test]
    fn parse_sse_data_ignores_comment_only_events() {
        assert_eq!(parse_sse_data(":keepalive"), None);
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:7700/", None);
        assert_eq!(client.base_url, "http://localhost:7700");
    }

    #[test]
    fn client_preserves_url_without_trailing_slash() {
        let client = Client::new("http://localhost:7700", None);
        assert_eq!(client.base_url, "http://localhost:7700");
    }

    #[test]
    fn client_stores_auth_token() {
        let client = Client::new("http://localhost:7700", Some("my-secret-token"));
        assert_eq!(client.token, Some("my-secret-token".to_string()));
    }

    #[test]
    fn client_headers_include_content_type() {
        let client = Client::new("http://localhost:7700", None);
        let headers = client.headers();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn client_headers_include_auth_when_token_set() {
        let client = Client::new("http://localhost:7700", Some("test-token"));
        let headers = client.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer test-token");
    }

    #[test]
    fn client_headers_omit_auth_when_no_token() {
        let client = Client::new("http://localhost:7700", None);
        let headers = client.headers();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn check_health_fails_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999", None);
        let result = client.check_health().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999", None);
        let result = client.wait_for_ready_with_timeout(100).await;

        match result {
            Err(ClientError::DaemonNotReady { addr, timeout_ms }) => {
                assert_eq!(addr, "http://127.0.0.1:19999");
                assert_eq!(timeout_ms, 100);
            }
            _ => panic!("expected DaemonNotReady error"),
        }
    }

    #[test]
    fn daemon_not_ready_error_message_includes_hint() {
        let err = ClientError::DaemonNotReady {
            addr: "http://127.0.0.1:7700".to_string(),
            timeout_ms: 5000,
        };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:7700"));
        assert!(msg.contains("5000ms"));
        assert!(msg.contains("WEAVED_TOKEN"));
    }

    #[test]
    fn unauthorized_error_suggests_token_options() {
        let err = ClientError::Unauthorized;
        let msg = err.to_string();
        assert!(msg.contains("WEAVED_TOKEN"));
        assert!(msg.contains("--token"));
    }
}
