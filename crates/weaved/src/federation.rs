//! Federation layer (spec Section 4.6): remote-repo registry, the
//! cross-repo request state machine, the subscription bus, and health
//! metrics.
//!
//! No teacher equivalent. The outgoing HTTP client reuses the `reqwest`
//! dependency already carried for CLI/API calls; the WS connection
//! bookkeeping (`{id, sender, subscriptions, last_ping}`, stale-sweep on
//! max idle) mirrors `transport.rs`'s `Sink`/`TransportManager` shape —
//! a sibling of the event-bus fan-out, not a copy, since federation
//! connections key off `remote_repo`/`subscriptions` rather than `run_id`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use weave_core::jsonl::{EntityKind, JsonlEntity};
use weave_core::{
    AuditLogEntry, CrossRepoRequest, Id, RemoteRepo, RequestDirection, RequestStatus, Subscription,
    SubscriptionEvent, SyncStatus, TrustLevel,
};

use crate::storage::{Storage, StorageError};

/// WS connections older than this without a ping are swept (spec Section 4.6.3).
pub const MAX_IDLE: Duration = Duration::from_secs(5 * 60);
/// Subscriptions with no event activity in this window count as idle for the
/// health classifier (spec Section 4.6.4).
const SUBSCRIPTION_IDLE_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Pending requests older than this are counted as stale for the health classifier.
const PENDING_REQUEST_STALE_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Window over which failed requests are counted for the health classifier.
const FAILED_REQUEST_WINDOW_SEC: i64 = 60 * 60;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown trust level: {0}")]
    UnknownTrustLevel(String),
    #[error("request {0} is already in a terminal state")]
    RequestTerminal(Id),
    #[error("unsupported mutation type: {0}")]
    UnsupportedMutation(String),
}

pub type Result<T> = std::result::Result<T, FederationError>;

/// Reply shape for `POST /federation/mutate` (spec Section 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutateReply {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Reply shape for `GET /federation/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoReply {
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub entity_types: Vec<String>,
}

/// Overall federation health (spec Section 4.6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pending_requests_stale: i64,
    pub failed_requests_last_hour: i64,
    pub idle_subscriptions: i64,
}

/// Is `request_type` a read query rather than a mutation, per the auto-approval
/// rule of spec Section 4.6.2? The wire protocol distinguishes `/federation/query`
/// (reads) from `/federation/mutate` (writes); we classify by the request type
/// string itself since both paths funnel into the same `CrossRepoRequest` row.
fn is_query(request_type: &str) -> bool {
    request_type == "query" || request_type.starts_with("query_")
}

/// `shouldAutoApprove(trustLevel, requestType)` — spec Section 4.6.2 default rule:
/// trusted peers auto-approve everything; verified peers auto-approve queries
/// only; untrusted peers never auto-approve.
pub fn should_auto_approve(trust_level: TrustLevel, request_type: &str) -> bool {
    match trust_level {
        TrustLevel::Trusted => true,
        TrustLevel::Verified => is_query(request_type),
        TrustLevel::Untrusted => false,
    }
}

fn read_jsonl_file(path: &Path) -> Result<Vec<JsonlEntity>> {
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

fn append_jsonl_line(path: &Path, entity: &JsonlEntity) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut canon = entity.clone();
    canon.canonicalize();
    writeln!(file, "{}", serde_json::to_string(&canon)?)?;
    Ok(())
}

/// One registered WebSocket subscription connection.
struct Connection {
    remote_repo: Option<String>,
    subscriptions: Mutex<HashSet<Id>>,
    sender: mpsc::UnboundedSender<Value>,
    last_ping: Mutex<Instant>,
}

/// Binds the remote-repo registry, the cross-repo request state machine, the
/// subscription bus, and the WS connection registry together.
pub struct FederationService {
    storage: Arc<Storage>,
    workspace_root: std::path::PathBuf,
    http: reqwest::Client,
    local_repo: String,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl FederationService {
    pub fn new(storage: Arc<Storage>, workspace_root: std::path::PathBuf, local_repo: String) -> Self {
        Self {
            storage,
            workspace_root,
            http: reqwest::Client::new(),
            local_repo,
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn audit(
        &self,
        operation: &str,
        direction: RequestDirection,
        from_repo: &str,
        to_repo: &str,
        status: &str,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        let entry = AuditLogEntry {
            id: Id::new(),
            operation: operation.to_string(),
            direction,
            from_repo: from_repo.to_string(),
            to_repo: to_repo.to_string(),
            status: status.to_string(),
            duration_ms,
            error: error.map(str::to_string),
            created_at: Utc::now(),
        };
        if let Err(e) = self.storage.insert_audit_log_entry(&entry).await {
            tracing::warn!(error = %e, "failed to persist federation audit entry");
        }
    }

    // --- 4.6.1 Remote-repo registry ---

    pub async fn register_remote_repo(&self, repo: RemoteRepo) -> Result<RemoteRepo> {
        self.storage.upsert_remote_repo(&repo).await?;
        Ok(repo)
    }

    pub async fn list_remote_repos(&self) -> Result<Vec<RemoteRepo>> {
        Ok(self.storage.list_remote_repos().await?)
    }

    pub async fn get_remote_repo(&self, url: &str) -> Result<RemoteRepo> {
        Ok(self.storage.get_remote_repo(url).await?)
    }

    /// `discover(url)`: GET the peer's `/federation/info`, store its
    /// capabilities snapshot and `synced` status; on network failure, set
    /// `unreachable` instead of failing the caller.
    pub async fn discover(&self, url: &str) -> Result<SyncStatus> {
        let endpoint = format!("{}/federation/info", url.trim_end_matches('/'));
        match self.http.get(&endpoint).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<InfoReply>().await {
                Ok(info) => {
                    let capabilities_json = serde_json::to_string(&info)?;
                    self.storage
                        .update_remote_repo_sync_status(url, SyncStatus::Synced, Some(Utc::now()), Some(&capabilities_json))
                        .await?;
                    Ok(SyncStatus::Synced)
                }
                Err(e) => {
                    tracing::warn!(url, error = %e, "federation discover: malformed /federation/info reply");
                    self.storage
                        .update_remote_repo_sync_status(url, SyncStatus::Unreachable, None, None)
                        .await?;
                    Ok(SyncStatus::Unreachable)
                }
            },
            Ok(resp) => {
                tracing::warn!(url, status = %resp.status(), "federation discover: non-success response");
                self.storage
                    .update_remote_repo_sync_status(url, SyncStatus::Unreachable, None, None)
                    .await?;
                Ok(SyncStatus::Unreachable)
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "federation discover: peer unreachable");
                self.storage
                    .update_remote_repo_sync_status(url, SyncStatus::Unreachable, None, None)
                    .await?;
                Ok(SyncStatus::Unreachable)
            }
        }
    }

    /// `GET /federation/info` capabilities payload.
    pub fn info(&self) -> InfoReply {
        InfoReply {
            protocols: vec!["rest".to_string(), "ws".to_string()],
            operations: vec!["query".to_string(), "mutate".to_string()],
            entity_types: vec!["issue".to_string(), "spec".to_string()],
        }
    }

    /// Incoming query (`POST /federation/query`): answered synchronously,
    /// gated by trust level the same way mutations are (spec Section 4.6.2 —
    /// "trusted peers auto-approve read queries ... verified peers auto-approve
    /// queries only"), rather than the pending/approve state machine mutations
    /// go through.
    pub async fn handle_incoming_query(
        &self,
        trust_level: TrustLevel,
        entity: &str,
        filters: &Value,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        if !should_auto_approve(trust_level, "query") {
            return Ok(Vec::new());
        }
        let file = match entity {
            "issue" | "issues" => "issues.jsonl",
            "spec" | "specs" => "specs.jsonl",
            _ => return Ok(Vec::new()),
        };
        let entities = read_jsonl_file(&self.workspace_root.join(".sudocode").join(file))?;
        let empty = serde_json::Map::new();
        let filter_map = filters.as_object().unwrap_or(&empty);
        let mut results: Vec<Value> = entities
            .into_iter()
            .map(|e| serde_json::to_value(&e).unwrap_or(Value::Null))
            .filter(|v| filter_map.iter().all(|(k, want)| v.get(k).map(|got| got == want).unwrap_or(false)))
            .collect();
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    // --- 4.6.2 Cross-repo request state machine ---

    /// Outgoing mutation: wrap in a `pending` request row, POST to the
    /// peer's `/federation/mutate`, and store its returned status.
    pub async fn send_mutation(
        &self,
        to_repo: &str,
        request_type: &str,
        data: Value,
    ) -> Result<CrossRepoRequest> {
        let now = Utc::now();
        let mut request = CrossRepoRequest {
            request_id: Id::new(),
            direction: RequestDirection::Outgoing,
            from_repo: self.local_repo.clone(),
            to_repo: to_repo.to_string(),
            request_type: request_type.to_string(),
            payload_json: serde_json::to_string(&data)?,
            status: RequestStatus::Pending,
            requires_approval: false,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            result_json: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_cross_repo_request(&request).await?;

        let endpoint = format!("{}/federation/mutate", to_repo.trim_end_matches('/'));
        let body = json!({
            "type": "mutate",
            "from": self.local_repo,
            "to": to_repo,
            "timestamp": now.timestamp_millis(),
            "operation": request_type,
            "data": data,
            "metadata": { "request_id": request.request_id.to_string(), "requester": self.local_repo },
        });

        let started = Instant::now();
        let outcome = self.http.post(&endpoint).json(&body).send().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, result_json, audit_status, error) = match outcome {
            Ok(resp) => match resp.json::<MutateReply>().await {
                Ok(reply) => {
                    let status = match reply.status.as_str() {
                        "pending_approval" => RequestStatus::Pending,
                        "rejected" => RequestStatus::Rejected,
                        "completed" => RequestStatus::Completed,
                        _ => RequestStatus::Failed,
                    };
                    let audit_status = if status == RequestStatus::Failed { "failed" } else { "completed" };
                    (status, Some(serde_json::to_string(&reply)?), audit_status, None)
                }
                Err(e) => (RequestStatus::Failed, None, "failed", Some(e.to_string())),
            },
            Err(e) => (RequestStatus::Failed, None, "failed", Some(e.to_string())),
        };

        self.storage
            .update_cross_repo_request_status(
                &request.request_id,
                status,
                None,
                None,
                result_json.as_deref(),
            )
            .await?;
        self.audit(
            request_type,
            RequestDirection::Outgoing,
            &self.local_repo,
            to_repo,
            audit_status,
            duration_ms,
            error.as_deref(),
        )
        .await;

        request.status = status;
        request.result_json = result_json;
        Ok(request)
    }

    /// Incoming mutation: decide auto-approval, persist, and (if approved)
    /// execute immediately. Returns the reply the caller should send back.
    pub async fn handle_incoming_mutation(
        &self,
        from_repo: &str,
        trust_level: TrustLevel,
        request_type: &str,
        data: Value,
    ) -> Result<MutateReply> {
        let started = Instant::now();
        let now = Utc::now();
        let auto_approve = should_auto_approve(trust_level, request_type);

        let request = CrossRepoRequest {
            request_id: Id::new(),
            direction: RequestDirection::Incoming,
            from_repo: from_repo.to_string(),
            to_repo: self.local_repo.clone(),
            request_type: request_type.to_string(),
            payload_json: serde_json::to_string(&data)?,
            status: RequestStatus::Pending,
            requires_approval: !auto_approve,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            result_json: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_cross_repo_request(&request).await?;

        if !auto_approve {
            self.audit(
                request_type,
                RequestDirection::Incoming,
                from_repo,
                &self.local_repo,
                "pending",
                started.elapsed().as_millis() as u64,
                None,
            )
            .await;
            return Ok(MutateReply {
                status: "pending_approval".to_string(),
                message: None,
            });
        }

        match self.execute_mutation(request_type, &data) {
            Ok(result) => {
                let result_json = serde_json::to_string(&result)?;
                self.storage
                    .update_cross_repo_request_status(
                        &request.request_id,
                        RequestStatus::Completed,
                        None,
                        None,
                        Some(&result_json),
                    )
                    .await?;
                self.audit(
                    request_type,
                    RequestDirection::Incoming,
                    from_repo,
                    &self.local_repo,
                    "completed",
                    started.elapsed().as_millis() as u64,
                    None,
                )
                .await;
                Ok(MutateReply { status: "completed".to_string(), message: None })
            }
            Err(e) => {
                self.storage
                    .update_cross_repo_request_status(&request.request_id, RequestStatus::Failed, None, None, None)
                    .await?;
                self.audit(
                    request_type,
                    RequestDirection::Incoming,
                    from_repo,
                    &self.local_repo,
                    "failed",
                    started.elapsed().as_millis() as u64,
                    Some(&e.to_string()),
                )
                .await;
                Ok(MutateReply { status: "rejected".to_string(), message: Some(e.to_string()) })
            }
        }
    }

    /// `approve(id, approver)`: execute the mutation, mark `completed`.
    pub async fn approve(&self, request_id: &Id, approver: &str) -> Result<CrossRepoRequest> {
        let request = self.storage.get_cross_repo_request(request_id).await?;
        if request.status.is_terminal() {
            return Err(FederationError::RequestTerminal(request_id.clone()));
        }
        let started = Instant::now();
        let data: Value = serde_json::from_str(&request.payload_json)?;

        let (status, result_json, audit_status, error) = match self.execute_mutation(&request.request_type, &data) {
            Ok(result) => (RequestStatus::Completed, Some(serde_json::to_string(&result)?), "completed", None),
            Err(e) => (RequestStatus::Failed, None, "failed", Some(e.to_string())),
        };

        self.storage
            .update_cross_repo_request_status(request_id, status, Some(approver), None, result_json.as_deref())
            .await?;
        self.audit(
            &request.request_type,
            request.direction,
            &request.from_repo,
            &request.to_repo,
            audit_status,
            started.elapsed().as_millis() as u64,
            error.as_deref(),
        )
        .await;

        self.storage.get_cross_repo_request(request_id).await.map_err(Into::into)
    }

    /// `reject(id, reason)`.
    pub async fn reject(&self, request_id: &Id, reason: &str) -> Result<CrossRepoRequest> {
        let request = self.storage.get_cross_repo_request(request_id).await?;
        if request.status.is_terminal() {
            return Err(FederationError::RequestTerminal(request_id.clone()));
        }
        self.storage
            .update_cross_repo_request_status(request_id, RequestStatus::Rejected, None, Some(reason), None)
            .await?;
        self.audit(
            &request.request_type,
            request.direction,
            &request.from_repo,
            &request.to_repo,
            "rejected",
            0,
            Some(reason),
        )
        .await;
        self.storage.get_cross_repo_request(request_id).await.map_err(Into::into)
    }

    /// Executes an approved mutation against the local `.sudocode` entity log.
    /// Only `create_issue`/`create_spec` are implemented; anything else is
    /// `UnsupportedMutation` (spec Non-goals: "implementing the agents
    /// themselves" leaves the full mutation surface undefined beyond entity
    /// creation).
    fn execute_mutation(&self, request_type: &str, data: &Value) -> Result<Value> {
        let (kind, file) = match request_type {
            "create_issue" => (EntityKind::Issue, "issues.jsonl"),
            "create_spec" => (EntityKind::Spec, "specs.jsonl"),
            other => return Err(FederationError::UnsupportedMutation(other.to_string())),
        };

        let now = Utc::now();
        let id = Id::new().to_string();
        let mut extensions = serde_json::Map::new();
        if let Value::Object(map) = data {
            extensions = map.clone();
        }
        let entity = JsonlEntity {
            entity_type: kind,
            uuid: id.clone(),
            id: id.clone(),
            created_at: now,
            updated_at: now,
            relationships: Vec::new(),
            tags: Vec::new(),
            feedback: Vec::new(),
            archived: false,
            extensions,
        };
        append_jsonl_line(&self.workspace_root.join(".sudocode").join(file), &entity)?;
        Ok(json!({ "id": id }))
    }

    // --- 4.6.3 Subscription bus ---

    pub async fn create_subscription(&self, mut sub: Subscription) -> Result<Subscription> {
        sub.local_repo = self.local_repo.clone();
        self.storage.insert_subscription(&sub).await?;
        Ok(sub)
    }

    /// Register a new WebSocket connection; returns the receiver the caller
    /// forwards to the socket.
    pub async fn register_connection(&self, connection_id: String, remote_repo: Option<String>) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            remote_repo,
            subscriptions: Mutex::new(HashSet::new()),
            sender: tx,
            last_ping: Mutex::new(Instant::now()),
        });
        self.connections.lock().await.insert(connection_id, conn);
        rx
    }

    /// Bind a subscription created via a WS `subscribe` message to its connection.
    pub async fn bind_subscription(&self, connection_id: &str, subscription_id: &Id) -> Result<()> {
        if let Some(conn) = self.connections.lock().await.get(connection_id) {
            conn.subscriptions.lock().await.insert(subscription_id.clone());
        }
        Ok(())
    }

    pub async fn ping(&self, connection_id: &str) {
        if let Some(conn) = self.connections.lock().await.get(connection_id) {
            *conn.last_ping.lock().await = Instant::now();
        }
    }

    /// Tear down a connection: deactivate every subscription it owns, return
    /// how many were removed (spec Section 4.6.3 connection bookkeeping).
    pub async fn disconnect(&self, connection_id: &str) -> Result<usize> {
        let Some(conn) = self.connections.lock().await.remove(connection_id) else {
            return Ok(0);
        };
        let subs = conn.subscriptions.lock().await;
        for sub_id in subs.iter() {
            self.storage.deactivate_subscription(sub_id).await?;
        }
        Ok(subs.len())
    }

    /// Sweep connections whose last ping is older than `MAX_IDLE`.
    pub async fn sweep_stale_connections(&self) -> Result<usize> {
        let stale: Vec<String> = {
            let connections = self.connections.lock().await;
            let mut stale = Vec::new();
            for (id, conn) in connections.iter() {
                if conn.last_ping.lock().await.elapsed() > MAX_IDLE {
                    stale.push(id.clone());
                }
            }
            stale
        };
        let mut swept = 0;
        for id in stale {
            swept += self.disconnect(&id).await?;
        }
        Ok(swept)
    }

    /// `publishEvent(entity, eventType, payload, localRepo)`: fan out to every
    /// active, matching subscription's bound WS connection. A send failure
    /// leaves the subscription row intact — the connection is reaped later by
    /// `sweep_stale_connections`, not immediately here.
    pub async fn publish_event(&self, entity_type: &str, entity_id: Option<&str>, event_type: &str, payload: Value) -> Result<usize> {
        let subs = self.storage.list_subscriptions(None).await?;
        let connections = self.connections.lock().await;
        let mut delivered = 0;
        for sub in subs.iter().filter(|s| s.local_repo == self.local_repo) {
            if !sub.matches(entity_type, entity_id, event_type) {
                continue;
            }
            let Some(conn_id) = &sub.ws_connection_id else { continue };
            let Some(conn) = connections.get(conn_id) else { continue };
            let message = json!({
                "entityType": entity_type,
                "entityId": entity_id,
                "eventType": event_type,
                "payload": payload,
            });
            if conn.sender.send(message).is_ok() {
                self.storage.touch_subscription(&sub.subscription_id, Utc::now()).await?;
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    // --- 4.6.4 Metrics & health ---

    pub async fn health(&self) -> Result<HealthReport> {
        let pending = self.storage.list_cross_repo_requests(Some(RequestStatus::Pending)).await?;
        let stale_cutoff = Utc::now() - chrono::Duration::from_std(PENDING_REQUEST_STALE_WINDOW).unwrap();
        let pending_requests_stale = pending.iter().filter(|r| r.created_at < stale_cutoff).count() as i64;

        let failed_requests_last_hour = self.storage.count_recent_failed_audit_entries(FAILED_REQUEST_WINDOW_SEC).await?;

        let subs = self.storage.list_subscriptions(None).await?;
        let idle_cutoff = Utc::now() - chrono::Duration::from_std(SUBSCRIPTION_IDLE_WINDOW).unwrap();
        let idle_subscriptions = subs
            .iter()
            .filter(|s| s.last_event_at.unwrap_or(s.created_at) < idle_cutoff)
            .count() as i64;

        let status = if failed_requests_last_hour > 10 {
            HealthStatus::Critical
        } else if failed_requests_last_hour > 5 || pending_requests_stale > 0 || idle_subscriptions > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Ok(HealthReport {
            status,
            pending_requests_stale,
            failed_requests_last_hour,
            idle_subscriptions,
        })
    }

    /// Aggregate request counts by status/direction plus top remote repos by
    /// activity, over the trailing `window_sec` seconds.
    pub async fn metrics_summary(&self, window_sec: i64) -> Result<FederationMetrics> {
        let cutoff = Utc::now() - chrono::Duration::seconds(window_sec);
        let requests = self.storage.list_cross_repo_requests(None).await?;

        let mut by_status: HashMap<String, i64> = HashMap::new();
        let mut by_direction: HashMap<String, i64> = HashMap::new();
        let mut by_repo: HashMap<String, i64> = HashMap::new();

        for req in requests.iter().filter(|r| r.created_at >= cutoff) {
            *by_status.entry(req.status.as_str().to_string()).or_insert(0) += 1;
            *by_direction.entry(req.direction.as_str().to_string()).or_insert(0) += 1;
            let repo = match req.direction {
                RequestDirection::Incoming => &req.from_repo,
                RequestDirection::Outgoing => &req.to_repo,
            };
            *by_repo.entry(repo.clone()).or_insert(0) += 1;
        }

        let mut top_repos: Vec<(String, i64)> = by_repo.into_iter().collect();
        top_repos.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_repos.truncate(10);

        Ok(FederationMetrics {
            by_status,
            by_direction,
            top_repos,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FederationMetrics {
    pub by_status: HashMap<String, i64>,
    pub by_direction: HashMap<String, i64>,
    pub top_repos: Vec<(String, i64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_peers_auto_approve_everything() {
        assert!(should_auto_approve(TrustLevel::Trusted, "create_issue"));
        assert!(should_auto_approve(TrustLevel::Trusted, "query"));
    }

    #[test]
    fn verified_peers_auto_approve_queries_only() {
        assert!(should_auto_approve(TrustLevel::Verified, "query"));
        assert!(!should_auto_approve(TrustLevel::Verified, "create_issue"));
    }

    #[test]
    fn untrusted_peers_never_auto_approve() {
        assert!(!should_auto_approve(TrustLevel::Untrusted, "query"));
        assert!(!should_auto_approve(TrustLevel::Untrusted, "create_issue"));
    }

    async fn test_service() -> (FederationService, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(&dir.path().join("test.db")).await.unwrap());
        storage.migrate_embedded().await.unwrap();
        let service = FederationService::new(storage, dir.path().to_path_buf(), "local-repo".to_string());
        (service, dir)
    }

    #[tokio::test]
    async fn untrusted_incoming_mutation_requires_approval_then_completes() {
        let (service, dir) = test_service().await;
        std::fs::create_dir_all(dir.path().join(".sudocode")).unwrap();

        let reply = service
            .handle_incoming_mutation("peer-repo", TrustLevel::Untrusted, "create_issue", json!({ "title": "hello" }))
            .await
            .unwrap();
        assert_eq!(reply.status, "pending_approval");

        let pending = service.storage.list_cross_repo_requests(Some(RequestStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].requires_approval);

        let approved = service.approve(&pending[0].request_id, "alice").await.unwrap();
        assert_eq!(approved.status, RequestStatus::Completed);

        let audit = service.storage.list_audit_log_entries(10).await.unwrap();
        assert_eq!(audit.len(), 2);

        let issues_path = dir.path().join(".sudocode/issues.jsonl");
        assert!(issues_path.exists());
    }

    #[tokio::test]
    async fn approving_a_terminal_request_is_rejected() {
        let (service, dir) = test_service().await;
        std::fs::create_dir_all(dir.path().join(".sudocode")).unwrap();

        service
            .handle_incoming_mutation("peer-repo", TrustLevel::Trusted, "create_issue", json!({ "title": "hi" }))
            .await
            .unwrap();
        let completed = service.storage.list_cross_repo_requests(Some(RequestStatus::Completed)).await.unwrap();
        assert_eq!(completed.len(), 1);

        let err = service.approve(&completed[0].request_id, "alice").await.unwrap_err();
        assert!(matches!(err, FederationError::RequestTerminal(_)));
    }

    #[tokio::test]
    async fn disconnect_deactivates_owned_subscriptions() {
        let (service, _dir) = test_service().await;
        let sub = Subscription {
            subscription_id: Id::new(),
            local_repo: "local-repo".to_string(),
            remote_repo: "peer-repo".to_string(),
            entity_type: weave_core::EntityTypeFilter::Any,
            entity_id: None,
            events: vec![SubscriptionEvent::Any],
            webhook_url: None,
            ws_connection_id: Some("conn-1".to_string()),
            active: true,
            last_event_at: None,
            created_at: Utc::now(),
        };
        service.storage.insert_subscription(&sub).await.unwrap();

        let _rx = service.register_connection("conn-1".to_string(), Some("peer-repo".to_string())).await;
        service.bind_subscription("conn-1", &sub.subscription_id).await.unwrap();

        let removed = service.disconnect("conn-1").await.unwrap();
        assert_eq!(removed, 1);

        let active = service.storage.list_subscriptions(None).await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn health_is_healthy_with_no_activity() {
        let (service, _dir) = test_service().await;
        let report = service.health().await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
    }
}
