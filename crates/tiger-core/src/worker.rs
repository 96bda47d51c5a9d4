//! The long-lived agent process: queue consumption, heartbeating, and the
//! lock -> lease -> run -> pipeline -> finalize bracket around each task.
//!
//! Jobs may be delivered more than once; idempotency comes from the
//! runtime lock (same host) plus the lease (cross host). A contended lock
//! inside the startup window is a duplicate delivery and is skipped
//! silently; outside the window the task is handed back to the queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use tiger_db::models::{AgentStatus, RunStatus, TaskStatus};
use tiger_db::queries::{
    agents as agents_db, finalize as finalize_db, leases as leases_db, queue as queue_db,
    runs as runs_db, tasks as tasks_db,
};

use crate::config::{LOCK_CONTENTION_WINDOW_SECONDS, WorkerConfig};
use crate::executor::Executor;
use crate::lock::RuntimeLock;
use crate::logging::{self, TeeSink};
use crate::pipeline::Pipeline;
use crate::repo::RepoConfig;
use crate::vcs::Vcs;

/// A delivered queue job.
#[derive(Debug, Clone)]
pub struct QueueJobMsg {
    pub id: i64,
    pub task_id: Uuid,
    pub agent_id: String,
}

/// Queue port. The default implementation is Postgres-backed; external
/// brokers plug in here.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Claim the next job on a queue, if any.
    async fn next_job(&self, queue: &str) -> Result<Option<QueueJobMsg>>;

    /// Acknowledge a handled job (removes it).
    async fn ack(&self, job: &QueueJobMsg) -> Result<()>;

    /// Return a job to the queue for redelivery.
    async fn nack(&self, job: &QueueJobMsg) -> Result<()>;
}

/// Conventional per-agent queue name.
pub fn agent_queue_name(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

/// Postgres-backed [`TaskQueue`] over the `queue_jobs` table.
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgQueue {
    async fn next_job(&self, queue: &str) -> Result<Option<QueueJobMsg>> {
        let job = queue_db::claim_next_job(&self.pool, queue).await?;
        Ok(job.map(|j| QueueJobMsg {
            id: j.id,
            task_id: j.task_id,
            agent_id: j.agent_id,
        }))
    }

    async fn ack(&self, job: &QueueJobMsg) -> Result<()> {
        queue_db::delete_job(&self.pool, job.id).await
    }

    async fn nack(&self, job: &QueueJobMsg) -> Result<()> {
        queue_db::release_job(&self.pool, job.id).await
    }
}

/// A long-lived worker agent.
pub struct Worker {
    pub pool: PgPool,
    pub vcs: Arc<dyn Vcs>,
    pub executor: Arc<dyn Executor>,
    pub queue: Arc<dyn TaskQueue>,
    pub config: WorkerConfig,
    pub repo_config: RepoConfig,
    pub agent_id: String,
    pub role: String,
    pub model: Option<String>,
    /// Log sink whose per-task output is switched on task boundaries.
    pub log_sink: Option<TeeSink>,
}

impl Worker {
    /// Run the agent until cancellation.
    ///
    /// Registers the agent row, heartbeats on a fixed interval, and
    /// processes queue jobs strictly serially. On cancellation the
    /// current job is allowed to finish (the hard timeout bounds it) and
    /// the agent row is marked offline.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let metadata = serde_json::json!({
            "executor": self.executor.name(),
            "model": self.model,
            "pid": std::process::id(),
        });
        agents_db::upsert_agent(&self.pool, &self.agent_id, &self.role, &metadata)
            .await
            .context("failed to register agent")?;

        info!(agent_id = %self.agent_id, "agent registered, entering work loop");

        // Heartbeat on a fixed interval until cancelled.
        let heartbeat_pool = self.pool.clone();
        let heartbeat_agent = self.agent_id.clone();
        let heartbeat_cancel = cancel.clone();
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval_seconds.max(1));
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(heartbeat_interval) => {
                        if let Err(e) = agents_db::heartbeat(&heartbeat_pool, &heartbeat_agent).await {
                            warn!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = heartbeat_cancel.cancelled() => break,
                }
            }
        });

        let queue_name = agent_queue_name(&self.agent_id);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let job = match self.queue.next_job(&queue_name).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(error = %e, "queue poll failed");
                    None
                }
            };

            match job {
                Some(job) => {
                    // Failures never crash the agent process.
                    if let Err(e) = self.handle_job(&job).await {
                        error!(
                            task_id = %job.task_id,
                            error = %format!("{e:#}"),
                            "job handling failed"
                        );
                        let _ = self.queue.ack(&job).await;
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        // Shutdown: stop heartbeating and mark the agent offline.
        heartbeat.abort();
        if let Err(e) =
            agents_db::set_agent_status(&self.pool, &self.agent_id, AgentStatus::Offline).await
        {
            warn!(error = %e, "failed to mark agent offline");
        }
        info!(agent_id = %self.agent_id, "agent stopped");
        Ok(())
    }

    /// Handle one delivered job through the full bracket.
    async fn handle_job(&self, job: &QueueJobMsg) -> Result<()> {
        let task_id = job.task_id;

        // Cross-process exclusion first.
        let Some(lock) = RuntimeLock::acquire(&self.config.lock_dir, task_id)? else {
            return self.handle_lock_contention(job).await;
        };

        let Some(mut task) = tasks_db::get_task(&self.pool, task_id).await? else {
            warn!(task_id = %task_id, "job references missing task, dropping");
            self.queue.ack(job).await?;
            return Ok(());
        };

        if task.status != TaskStatus::Queued {
            info!(task_id = %task_id, status = %task.status, "task not queued, skipping duplicate delivery");
            self.queue.ack(job).await?;
            return Ok(());
        }

        let rows = tasks_db::transition_task_status(
            &self.pool,
            task_id,
            TaskStatus::Queued,
            TaskStatus::Running,
            None,
        )
        .await?;
        if rows == 0 {
            info!(task_id = %task_id, "lost the optimistic claim, skipping");
            self.queue.ack(job).await?;
            return Ok(());
        }
        task.status = TaskStatus::Running;

        // Run + lease.
        let log_path =
            logging::task_log_path(&self.config.log_dir, task_id, &self.agent_id, Uuid::nil());
        let run = runs_db::insert_run(
            &self.pool,
            task_id,
            &self.agent_id,
            Some(&log_path.to_string_lossy()),
        )
        .await?;

        // The nil run id in the provisional path is replaced now that the
        // real id exists.
        let log_path =
            logging::task_log_path(&self.config.log_dir, task_id, &self.agent_id, run.id);
        runs_db::update_run_log_path(&self.pool, run.id, &log_path.to_string_lossy()).await?;

        let leased =
            leases_db::try_insert_lease(&self.pool, task_id, run.id, &self.agent_id).await?;
        if !leased {
            // Another host owns the task. Hand it back without touching
            // the foreign lease.
            warn!(task_id = %task_id, "lease already held elsewhere, releasing claim");
            sqlx::query("UPDATE runs SET status = 'cancelled', finished_at = now() WHERE id = $1")
                .bind(run.id)
                .execute(&self.pool)
                .await
                .context("failed to cancel run after lease conflict")?;
            tasks_db::transition_task_status(
                &self.pool,
                task_id,
                TaskStatus::Running,
                TaskStatus::Queued,
                None,
            )
            .await?;
            self.queue.ack(job).await?;
            return Ok(());
        }

        agents_db::set_agent_busy(&self.pool, &self.agent_id, task_id).await?;

        if let Some(sink) = &self.log_sink {
            if let Err(e) = sink.switch_task_log(Some(&log_path)) {
                warn!(error = %e, "failed to attach per-task log");
            }
        }

        info!(task_id = %task_id, run_id = %run.id, "starting pipeline");
        let pipeline = Pipeline {
            pool: &self.pool,
            vcs: self.vcs.as_ref(),
            executor: self.executor.as_ref(),
            config: &self.config,
            repo_config: &self.repo_config,
            agent_id: &self.agent_id,
            model: self.model.as_deref(),
            instructions_path: None,
            log_dir: &self.config.log_dir,
        };
        let outcome = pipeline.run(&mut task, run.id).await;

        if outcome.run_status == RunStatus::Failed {
            tasks_db::increment_retry_count(&self.pool, task_id).await?;
        }

        let request = finalize_db::FinalizeRequest {
            run_id: run.id,
            task_id,
            agent_id: self.agent_id.clone(),
            run_status: outcome.run_status,
            task_status: outcome.task_status,
            block_reason: outcome.block_reason,
            cost_tokens: outcome.cost_tokens,
            error_message: outcome.error_message.clone(),
            error_meta: outcome.error_meta.clone(),
        };
        finalize_db::finalize_task_state(&self.pool, &request)
            .await
            .context("finalize failed")?;

        info!(
            task_id = %task_id,
            run_status = %outcome.run_status,
            task_status = %outcome.task_status,
            "task finalized"
        );

        if let Some(sink) = &self.log_sink {
            let _ = sink.switch_task_log(None);
        }

        self.queue.ack(job).await?;
        lock.release();
        Ok(())
    }

    /// Lock contention: inside the startup window this is a duplicate
    /// delivery and is skipped silently; outside it the task is reset to
    /// queued with the lease cleared.
    async fn handle_lock_contention(&self, job: &QueueJobMsg) -> Result<()> {
        let lease = leases_db::get_lease(&self.pool, job.task_id).await?;

        let within_window = lease
            .as_ref()
            .map(|l| {
                (Utc::now() - l.acquired_at).num_seconds() < LOCK_CONTENTION_WINDOW_SECONDS
            })
            .unwrap_or(true);

        if within_window {
            info!(task_id = %job.task_id, "lock contended within startup window, skipping silently");
        } else {
            warn!(task_id = %job.task_id, "stale contended task, resetting to queued");
            leases_db::delete_lease(&self.pool, job.task_id).await?;
            tasks_db::reset_task_to_queued(&self.pool, job.task_id).await?;
        }

        self.queue.ack(job).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_is_per_agent() {
        assert_eq!(agent_queue_name("agent-1"), "agent:agent-1");
        assert_ne!(agent_queue_name("a"), agent_queue_name("b"));
    }
}
