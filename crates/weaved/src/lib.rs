//! weaved - Execution & Workflow Core daemon
//!
//! Library components for the daemon process: process supervision, output
//! normalization, the event bus and transport layer, the execution runner,
//! the DAG workflow engine, the federation layer, and the HTTP control plane
//! that binds them together.

pub mod adapters;
pub mod eventbus;
pub mod federation;
pub mod git;
pub mod normalizer;
pub mod process;
pub mod runner;
pub mod server;
pub mod storage;
pub mod transport;
pub mod workflow;
pub mod worktree;
pub mod worktree_worktrunk;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adapters::AdapterRegistry;
use eventbus::{EventBuffer, DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC};
use federation::FederationService;
use process::ProcessSupervisor;
use runner::{Runner, RunnerConfig};
use server::AppState;
use storage::Storage;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use transport::TransportManager;
use weave_core::Config;
use workflow::WorkflowEngine;

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Grace period for in-flight work to abort during shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Interval between federation stale-connection sweeps (spec Section 4.6.3).
const FEDERATION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Daemon configuration (spec Section 4.3, ambient stack).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the `SQLite` database.
    pub db_path: PathBuf,
    /// HTTP server port.
    pub port: u16,
    /// Auth token for the HTTP API (optional).
    pub auth_token: Option<String>,
    /// Workspace root the daemon serves. Executions and workflows may name
    /// their own workspace roots, but federation and default config
    /// resolution anchor to this one.
    pub workspace_root: PathBuf,
    /// Local repo identifier used by the federation layer.
    pub local_repo: String,
    /// Ambient execution config (model, worktree, workflow, federation
    /// defaults). Resolved once at startup via [`load_daemon_config`]'s
    /// precedence cascade and threaded into every execution/workflow that
    /// doesn't override it.
    pub execution_config: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let workspace_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            db_path: default_db_path(),
            port: 7700,
            auth_token: std::env::var("WEAVED_AUTH_TOKEN").ok(),
            local_repo: git::repo_name(&workspace_root),
            workspace_root,
            execution_config: Config::default(),
        }
    }
}

/// Get the default database path (`~/.local/share/weaved/weaved.db`).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("weaved").join("weaved.db")
}

/// Load the ambient execution [`Config`], following the precedence
/// documented on `Config` itself: an explicit `--config` file path, then
/// `<workspace_root>/.weave/config`, then struct defaults.
pub fn load_daemon_config(
    workspace_root: &std::path::Path,
    config_path: Option<&std::path::Path>,
) -> AppResult<Config> {
    let mut config = if let Some(path) = config_path {
        Config::from_file(path)?
    } else {
        let default_path = workspace_root.join(".weave/config");
        if default_path.exists() {
            Config::from_file(&default_path)?
        } else {
            Config::default()
        }
    };
    config.resolve_paths(workspace_root);
    Ok(config)
}

/// Daemon state: owns storage and the three services (`Runner`,
/// `WorkflowEngine`, `FederationService`) that share it, plus the event bus
/// and transport layer the HTTP control plane streams from.
pub struct Daemon {
    config: DaemonConfig,
    storage: Arc<Storage>,
    runner: Arc<Runner>,
    workflow_engine: Arc<WorkflowEngine>,
    federation: Arc<FederationService>,
    events: Arc<EventBuffer>,
    transport: Arc<TransportManager>,
    shutdown: tokio_util::sync::CancellationToken,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> AppResult<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let events = Arc::new(EventBuffer::new(
            config
                .execution_config
                .event_buffer_max
                .max(1)
                .min(DEFAULT_MAX_EVENTS * 100),
            i64::from(config.execution_config.event_retention_sec).max(DEFAULT_RETENTION_SEC),
        ));
        let transport = Arc::new(TransportManager::new(Arc::clone(&events)));

        let runner = Arc::new(Runner::new(
            Arc::clone(&storage),
            Arc::clone(&events),
            Arc::clone(&transport),
            Arc::new(ProcessSupervisor::new()),
            Arc::new(AdapterRegistry::default()),
            RunnerConfig::from_config(&config.execution_config),
        ));

        let workflow_engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&storage),
            Arc::clone(&runner),
            Arc::clone(&events),
            Arc::clone(&transport),
        ));

        let federation = Arc::new(FederationService::new(
            Arc::clone(&storage),
            config.workspace_root.clone(),
            config.local_repo.clone(),
        ));

        Ok(Self {
            config,
            storage,
            runner,
            workflow_engine,
            federation,
            events,
            transport,
            shutdown: tokio_util::sync::CancellationToken::new(),
        })
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Get a reference to the execution runner.
    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    /// Get a reference to the workflow engine.
    pub fn workflow_engine(&self) -> &Arc<WorkflowEngine> {
        &self.workflow_engine
    }

    /// Get a reference to the federation service.
    pub fn federation(&self) -> &Arc<FederationService> {
        &self.federation
    }

    /// Run the daemon: start the HTTP control plane and the federation
    /// stale-connection sweep, and block until shutdown is signalled.
    pub async fn run(&self) -> AppResult<()> {
        info!("weaved starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!("local repo: {}", self.config.local_repo);
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let app_state = Arc::new(AppState {
            storage: Arc::clone(&self.storage),
            runner: Arc::clone(&self.runner),
            workflow_engine: Arc::clone(&self.workflow_engine),
            federation: Arc::clone(&self.federation),
            events: Arc::clone(&self.events),
            transport: Arc::clone(&self.transport),
            config: self.config.execution_config.clone(),
            auth_token: self.config.auth_token.clone(),
        });

        let http_port = self.config.port;
        let http_handle: JoinHandle<()> = tokio::spawn(async move {
            if let Err(e) = server::start_server(app_state, http_port).await {
                error!("HTTP server error: {}", e);
            }
        });

        let sweep_federation = Arc::clone(&self.federation);
        let sweep_shutdown = self.shutdown.clone();
        let sweep_handle: JoinHandle<()> = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(FEDERATION_SWEEP_INTERVAL) => {
                        match sweep_federation.sweep_stale_connections().await {
                            Ok(swept) if swept > 0 => {
                                info!(swept, "federation stale connections swept");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "federation sweep failed"),
                        }
                    }
                    () = sweep_shutdown.cancelled() => break,
                }
            }
        });

        self.shutdown.cancelled().await;
        info!("shutdown signal received, exiting");

        info!(
            grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
            "waiting for in-flight work to abort"
        );
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;

        http_handle.abort();
        sweep_handle.abort();
        self.transport.shutdown().await;

        Ok(())
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_daemon_config_reads_auth_token_env() {
        std::env::remove_var("WEAVED_AUTH_TOKEN");
        let config = DaemonConfig::default();
        assert!(config.auth_token.is_none());
        assert_eq!(config.port, 7700);
        assert!(config.db_path.ends_with("weaved/weaved.db"));
    }

    #[test]
    fn load_daemon_config_falls_back_to_defaults_without_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_daemon_config(dir.path(), None).unwrap();
        assert_eq!(config.model, "opus");
    }

    #[test]
    fn load_daemon_config_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("weave.conf");
        std::fs::write(&config_path, "model=sonnet\n").unwrap();
        let config = load_daemon_config(dir.path(), Some(&config_path)).unwrap();
        assert_eq!(config.model, "sonnet");
    }

    #[tokio::test]
    async fn daemon_new_creates_database_and_services() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            db_path: dir.path().join("weaved.db"),
            port: 0,
            auth_token: None,
            workspace_root: dir.path().to_path_buf(),
            local_repo: "test-repo".to_string(),
            execution_config: Config::default(),
        };
        let daemon = Daemon::new(config).await.unwrap();
        assert!(daemon.storage().list_executions(None).await.unwrap().is_empty());
    }
}
