//! `tiger agent run` -- start a long-lived worker agent.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tiger_core::config::WorkerConfig;
use tiger_core::executor::OpencodeCli;
use tiger_core::logging::TeeSink;
use tiger_core::repo::{PrepareMode, RepoConfig};
use tiger_core::vcs::GitCli;
use tiger_core::worker::{PgQueue, Worker};

/// Options collected from the command line.
#[derive(Debug, Clone)]
pub struct AgentRunOptions {
    pub agent_id: String,
    pub role: String,
    pub mode: PrepareMode,
    pub repo_url: Option<String>,
    pub repo_path: Option<PathBuf>,
    pub base_branch: String,
    pub executor_bin: Option<String>,
    pub model: Option<String>,
}

/// Build the worker and run it until a shutdown signal arrives.
pub async fn run_agent(pool: PgPool, opts: AgentRunOptions) -> Result<()> {
    let config = WorkerConfig::from_env();

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("failed to create log dir {}", config.log_dir.display()))?;

    let sink = TeeSink::new(&config.log_dir.join(format!("{}.log", opts.agent_id)))?;

    let data_dir = config.log_dir.parent().map(PathBuf::from).unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("tiger")
    });
    let local_repo = opts
        .repo_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    let repo_config = RepoConfig {
        mode: opts.mode,
        repo_url: opts.repo_url.clone(),
        workspace_dir: data_dir.join("workspaces"),
        base_repo_dir: opts
            .repo_path
            .clone()
            .unwrap_or_else(|| data_dir.join("base-repo")),
        worktree_root: data_dir.join("worktrees"),
        local_repo_dir: local_repo,
        base_branch: opts.base_branch.clone(),
    };

    let executor = match &opts.executor_bin {
        Some(bin) => OpencodeCli::with_binary(bin.clone()),
        None => OpencodeCli::new(),
    };

    let worker = Worker {
        pool: pool.clone(),
        vcs: Arc::new(GitCli::new()),
        executor: Arc::new(executor),
        queue: Arc::new(PgQueue::new(pool)),
        config,
        repo_config,
        agent_id: opts.agent_id.clone(),
        role: opts.role.clone(),
        model: opts.model.clone(),
        log_sink: Some(sink),
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    info!(agent_id = %opts.agent_id, mode = %opts.mode, "starting agent");
    worker.run(cancel).await
}

/// Cancel the worker on SIGINT/SIGTERM. The running executor is not
/// interrupted; the worker drains the current task first.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received, shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("ctrl-c received, shutting down");
        }

        cancel.cancel();
    });
}
