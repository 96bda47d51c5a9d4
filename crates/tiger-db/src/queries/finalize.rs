//! Transactional close-out of a run.
//!
//! Every terminal path through the worker funnels into
//! [`finalize_task_state`]: run row, task row, lease row, and agent row are
//! mutated in a single transaction so the consistency invariants (one
//! running run per running task, lease deleted on terminal transitions,
//! agent busy iff assigned) can never be observed half-applied.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{BlockReason, ErrorMeta, RunStatus, TaskStatus};

/// Everything the finalizer needs to close out a run.
#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: String,
    pub run_status: RunStatus,
    pub task_status: TaskStatus,
    pub block_reason: Option<BlockReason>,
    pub cost_tokens: Option<i64>,
    pub error_message: Option<String>,
    pub error_meta: Option<ErrorMeta>,
}

/// Check that `(run_status, task_status, block_reason)` is one of the
/// documented terminal combinations.
pub fn is_valid_finalize_combination(
    run_status: RunStatus,
    task_status: TaskStatus,
    block_reason: Option<BlockReason>,
) -> bool {
    matches!(
        (run_status, task_status, block_reason),
        (RunStatus::Success, TaskStatus::Done, None)
            | (
                RunStatus::Success,
                TaskStatus::Blocked,
                Some(BlockReason::AwaitingJudge)
            )
            | (
                RunStatus::Failed,
                TaskStatus::Blocked,
                Some(BlockReason::QuotaWait)
            )
            | (
                RunStatus::Failed,
                TaskStatus::Blocked,
                Some(BlockReason::NeedsRework)
            )
            | (RunStatus::Failed, TaskStatus::Failed, None)
            | (RunStatus::Failed, TaskStatus::Queued, None)
            | (RunStatus::Cancelled, TaskStatus::Queued, None)
            | (RunStatus::Cancelled, TaskStatus::Cancelled, None)
    )
}

/// Atomically finalize a run: update the run, update the task, delete the
/// lease, and idle the agent.
///
/// All four mutations commit or roll back together. Rejects undocumented
/// status combinations and non-terminal run statuses up front.
pub async fn finalize_task_state(pool: &PgPool, req: &FinalizeRequest) -> Result<()> {
    if req.run_status == RunStatus::Running {
        bail!("finalize called with non-terminal run status");
    }
    if !is_valid_finalize_combination(req.run_status, req.task_status, req.block_reason) {
        bail!(
            "invalid finalize combination: run={}, task={}, block_reason={:?}",
            req.run_status,
            req.task_status,
            req.block_reason
        );
    }

    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let run_rows = sqlx::query(
        "UPDATE runs \
         SET status = $1, \
             finished_at = now(), \
             cost_tokens = COALESCE($2, cost_tokens), \
             error_message = COALESCE($3, error_message), \
             error_meta = COALESCE($4, error_meta) \
         WHERE id = $5 AND status = 'running'",
    )
    .bind(req.run_status)
    .bind(req.cost_tokens)
    .bind(&req.error_message)
    .bind(req.error_meta.as_ref().map(|m| Json(m.clone())))
    .bind(req.run_id)
    .execute(&mut *tx)
    .await
    .context("failed to update run row")?
    .rows_affected();

    if run_rows == 0 {
        bail!("run {} is not in running status (already finalized?)", req.run_id);
    }

    sqlx::query(
        "UPDATE tasks SET status = $1, block_reason = $2, updated_at = now() WHERE id = $3",
    )
    .bind(req.task_status)
    .bind(req.block_reason)
    .bind(req.task_id)
    .execute(&mut *tx)
    .await
    .context("failed to update task row")?;

    sqlx::query("DELETE FROM leases WHERE task_id = $1")
        .bind(req.task_id)
        .execute(&mut *tx)
        .await
        .context("failed to delete lease")?;

    sqlx::query(
        "UPDATE agents SET status = 'idle', current_task_id = NULL, last_heartbeat = now() \
         WHERE id = $1",
    )
    .bind(&req.agent_id)
    .execute(&mut *tx)
    .await
    .context("failed to idle agent")?;

    tx.commit().await.context("failed to commit finalize transaction")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_combinations_are_valid() {
        assert!(is_valid_finalize_combination(
            RunStatus::Success,
            TaskStatus::Done,
            None
        ));
        assert!(is_valid_finalize_combination(
            RunStatus::Success,
            TaskStatus::Blocked,
            Some(BlockReason::AwaitingJudge)
        ));
        assert!(is_valid_finalize_combination(
            RunStatus::Failed,
            TaskStatus::Blocked,
            Some(BlockReason::QuotaWait)
        ));
        assert!(is_valid_finalize_combination(
            RunStatus::Failed,
            TaskStatus::Blocked,
            Some(BlockReason::NeedsRework)
        ));
        assert!(is_valid_finalize_combination(
            RunStatus::Failed,
            TaskStatus::Failed,
            None
        ));
        assert!(is_valid_finalize_combination(
            RunStatus::Failed,
            TaskStatus::Queued,
            None
        ));
        assert!(is_valid_finalize_combination(
            RunStatus::Cancelled,
            TaskStatus::Queued,
            None
        ));
        assert!(is_valid_finalize_combination(
            RunStatus::Cancelled,
            TaskStatus::Cancelled,
            None
        ));
    }

    #[test]
    fn blocked_requires_reason() {
        assert!(!is_valid_finalize_combination(
            RunStatus::Failed,
            TaskStatus::Blocked,
            None
        ));
    }

    #[test]
    fn done_forbids_reason() {
        assert!(!is_valid_finalize_combination(
            RunStatus::Success,
            TaskStatus::Done,
            Some(BlockReason::AwaitingJudge)
        ));
    }

    #[test]
    fn success_cannot_fail_task() {
        assert!(!is_valid_finalize_combination(
            RunStatus::Success,
            TaskStatus::Failed,
            None
        ));
    }

    #[test]
    fn running_task_is_never_terminal() {
        assert!(!is_valid_finalize_combination(
            RunStatus::Failed,
            TaskStatus::Running,
            None
        ));
    }

    #[test]
    fn quota_wait_only_pairs_with_failed_run() {
        assert!(!is_valid_finalize_combination(
            RunStatus::Success,
            TaskStatus::Blocked,
            Some(BlockReason::QuotaWait)
        ));
    }
}
