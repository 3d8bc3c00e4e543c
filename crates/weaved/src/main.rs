//! weaved - Execution & Workflow Core daemon
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};
use weaved::{load_daemon_config, Daemon, DaemonConfig};

/// CLI flags take precedence over `--config`, which takes precedence over
/// `<workspace-root>/.weave/config`, which takes precedence over defaults.
#[derive(Parser, Debug)]
#[command(name = "weaved", about = "Execution & workflow core daemon")]
struct Args {
    /// HTTP server port.
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Explicit path to an ambient execution config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Workspace root the daemon serves.
    #[arg(long, default_value = ".")]
    workspace_root: PathBuf,
}

fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let workspace_root = std::fs::canonicalize(&args.workspace_root).unwrap_or(args.workspace_root);

    let mut config = DaemonConfig::default();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    config.local_repo = weaved::git::repo_name(&workspace_root);
    config.execution_config = match load_daemon_config(&workspace_root, args.config.as_deref()) {
        Ok(execution_config) => execution_config,
        Err(e) => {
            error!("failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    config.workspace_root = workspace_root;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                let daemon_ref = &daemon;
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("daemon error: {}", e);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        daemon_ref.shutdown();
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        }
    });
}
