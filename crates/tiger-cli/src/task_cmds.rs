//! Task tooling commands: add, show, enqueue.
//!
//! The planner normally owns task creation; these commands exist for
//! operators driving a worker by hand and for end-to-end testing.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use tiger_db::queries::{queue as queue_db, runs as runs_db, tasks as tasks_db};
use tiger_core::worker::agent_queue_name;

/// `tiger task add` -- insert a task row.
pub async fn run_task_add(
    pool: &PgPool,
    title: &str,
    goal: &str,
    allowed_paths: Option<&str>,
    commands: Option<&str>,
    timebox_minutes: i32,
    role: &str,
    retry_limit: i32,
) -> Result<()> {
    let split = |s: Option<&str>| -> Vec<String> {
        s.map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
    };

    let new = tasks_db::NewTask {
        title: title.to_owned(),
        goal: goal.to_owned(),
        allowed_paths: split(allowed_paths),
        commands: split(commands),
        timebox_minutes,
        role: role.to_owned(),
        retry_limit,
        ..Default::default()
    };

    let task = tasks_db::insert_task(pool, &new).await?;
    println!("Task created: {}", task.id);
    Ok(())
}

/// `tiger task show` -- print a task and its recent runs.
pub async fn run_task_show(pool: &PgPool, task_id: &str) -> Result<()> {
    let id = Uuid::parse_str(task_id).with_context(|| format!("invalid task ID: {task_id}"))?;
    let task = tasks_db::get_task(pool, id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("# {}", task.title);
    println!();
    println!("- id: {}", task.id);
    println!("- status: {}", task.status);
    if let Some(reason) = task.block_reason {
        println!("- block reason: {reason}");
    }
    println!("- role: {}", task.role);
    println!("- retries: {}/{}", task.retry_count, task.retry_limit);
    if !task.allowed_paths.is_empty() {
        println!("- allowed paths: {}", task.allowed_paths.join(", "));
    }
    if !task.commands.is_empty() {
        println!("- commands: {}", task.commands.join(" && "));
    }

    let runs = runs_db::list_recent_failed_runs(pool, id, 3).await?;
    if !runs.is_empty() {
        println!();
        println!("Recent failed runs:");
        for run in runs {
            println!(
                "  - {} [{}] {}",
                run.id,
                run.status,
                run.error_message.as_deref().unwrap_or("")
            );
        }
    }

    Ok(())
}

/// `tiger task enqueue` -- hand a task to an agent's queue.
pub async fn run_task_enqueue(pool: &PgPool, task_id: &str, agent_id: &str) -> Result<()> {
    let id = Uuid::parse_str(task_id).with_context(|| format!("invalid task ID: {task_id}"))?;
    tasks_db::get_task(pool, id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    let queue = agent_queue_name(agent_id);
    let job_id = queue_db::enqueue_job(pool, &queue, id, agent_id).await?;
    println!("Job {job_id} enqueued on {queue}.");
    Ok(())
}
