//! Executor driver: prompt assembly, denied-command pre-check, the hard
//! timeout guard, and doom-loop detection on top of the [`Executor`] port.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use tracing::{info, warn};

use tiger_db::models::Task;

use super::{Executor, ExecutorOutcome, ExecutorRequest};
use crate::config::{HARD_TIMEOUT_GRACE_SECONDS, WorkerConfig};

/// Stderr markers indicating the executor degenerated into planning
/// chatter or pseudo tool calls.
pub const DOOM_LOOP_MARKERS: &[&str] = &[
    "doom loop detected",
    "excessive planning chatter",
    "unsupported pseudo tool call",
];

/// Prompt suffix appended on the doom-loop recovery retry.
const RECOVERY_MODE_SUFFIX: &str = "\n\nRecovery Mode: act directly on the task now. Do not plan, \
     do not describe intended tool calls; make the edits and run the commands.";

/// Per-execution options layered over the worker config.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions<'a> {
    pub model: Option<&'a str>,
    pub instructions_path: Option<&'a Path>,
    /// Focused hint for this attempt (recovery loops set this).
    pub extra_hint: Option<&'a str>,
    /// Up to three sanitized hints from recent failed runs.
    pub retry_hints: &'a [String],
    /// Override the soft timeout (recovery executions run shorter).
    pub timeout_override_seconds: Option<u64>,
}

/// Whether stderr carries a doom-loop marker.
pub fn is_doom_loop(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    DOOM_LOOP_MARKERS.iter().any(|m| lower.contains(m))
}

/// Match a command against a denylist pattern: regex when the pattern
/// compiles, substring otherwise.
pub fn command_matches_denied(command: &str, pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(command),
        Err(_) => command.contains(pattern),
    }
}

/// Find the first task command hitting the denylist.
pub fn find_denied_command<'a>(commands: &'a [String], denied: &[String]) -> Option<&'a str> {
    commands.iter().map(String::as_str).find(|cmd| {
        denied
            .iter()
            .any(|pattern| command_matches_denied(cmd, pattern))
    })
}

/// Assemble the executor prompt from the task and accumulated hints.
pub fn build_prompt(task: &Task, retry_hints: &[String], extra_hint: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Task: {}\n\n{}\n", task.title, task.goal));

    if let Some(notes) = task.notes.as_deref().filter(|n| !n.is_empty()) {
        prompt.push_str(&format!("\nNotes:\n{notes}\n"));
    }

    if !task.allowed_paths.is_empty() {
        prompt.push_str("\nYou may only modify paths matching:\n");
        for glob in &task.allowed_paths {
            prompt.push_str(&format!("  - {glob}\n"));
        }
    }

    if !task.commands.is_empty() {
        prompt.push_str("\nVerification commands that must pass:\n");
        for cmd in &task.commands {
            prompt.push_str(&format!("  - {cmd}\n"));
        }
    }

    if let Some(pr) = task.pr_ref() {
        prompt.push_str(&format!("\nThis task continues PR #{}", pr.number));
        if let Some(head) = pr.head_ref.as_deref() {
            prompt.push_str(&format!(" (head: {head}"));
            if let Some(base) = pr.base_ref.as_deref() {
                prompt.push_str(&format!(", base: {base}"));
            }
            prompt.push(')');
        }
        prompt.push('\n');
    }

    if !retry_hints.is_empty() {
        prompt.push_str("\nEarlier attempts at this task failed:\n");
        for hint in retry_hints.iter().take(3) {
            prompt.push_str(&format!("  - {hint}\n"));
        }
    }

    if let Some(hint) = extra_hint {
        prompt.push_str(&format!("\n{hint}\n"));
    }

    prompt
}

/// Run the executor for a task with the full driver treatment.
///
/// Never returns `Err` for an execution failure; the outcome carries the
/// classification inputs (exit code, stderr). `Err` means the driver
/// itself could not operate (e.g. executor binary missing).
pub async fn execute_task(
    executor: &dyn Executor,
    task: &Task,
    repo: &Path,
    env: &HashMap<String, String>,
    config: &WorkerConfig,
    opts: &ExecuteOptions<'_>,
) -> Result<ExecutorOutcome> {
    // Denied-command pre-check: short-circuit before spawning anything.
    if let Some(denied) = find_denied_command(&task.commands, &config.denied_commands) {
        warn!(task_id = %task.id, command = denied, "task command hits the denylist");
        return Ok(ExecutorOutcome::synthetic_failure(format!(
            "denied command blocked by policy: {denied}"
        )));
    }

    let soft_timeout = opts
        .timeout_override_seconds
        .unwrap_or_else(|| config.clamp_timebox_seconds(task.timebox_minutes));

    let prompt = build_prompt(task, opts.retry_hints, opts.extra_hint);
    let request = ExecutorRequest {
        workdir: repo.to_path_buf(),
        instructions_path: opts.instructions_path.map(Path::to_path_buf),
        prompt,
        model: opts.model.map(str::to_owned),
        timeout_seconds: soft_timeout,
        env: env.clone(),
        max_retries: 0,
    };

    let outcome = run_with_hard_guard(executor, &request, soft_timeout).await?;

    // Doom-loop recovery: one reduced-timeout retry with the recovery
    // suffix.
    if !outcome.success && config.immediate_doom_recovery && is_doom_loop(&outcome.stderr) {
        info!(task_id = %task.id, "doom loop detected, retrying in recovery mode");
        let recovery_timeout = config.recovery_timeout_seconds;
        let mut recovery_request = request.clone();
        recovery_request.prompt.push_str(RECOVERY_MODE_SUFFIX);
        recovery_request.timeout_seconds = recovery_timeout;

        let mut retried = run_with_hard_guard(executor, &recovery_request, recovery_timeout).await?;
        retried.retry_count += outcome.retry_count + 1;
        return Ok(retried);
    }

    Ok(outcome)
}

/// Race the executor against the hard timeout timer.
///
/// The executor is expected to honor its own soft timeout; when it does
/// not, the guard fires at `soft + 30s` and fabricates a failure result.
/// The subprocess is left to the adapter's kill-on-drop handling.
async fn run_with_hard_guard(
    executor: &dyn Executor,
    request: &ExecutorRequest,
    soft_timeout_seconds: u64,
) -> Result<ExecutorOutcome> {
    let hard_timeout = Duration::from_secs(soft_timeout_seconds + HARD_TIMEOUT_GRACE_SECONDS);

    tokio::select! {
        outcome = executor.run(request) => outcome,
        _ = tokio::time::sleep(hard_timeout) => {
            warn!(
                soft_timeout_seconds,
                "Hard timeout guard fired; executor ignored its soft deadline"
            );
            Ok(ExecutorOutcome {
                success: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: format!(
                    "Hard timeout guard exceeded after {}s (soft {}s + {}s grace)",
                    soft_timeout_seconds + HARD_TIMEOUT_GRACE_SECONDS,
                    soft_timeout_seconds,
                    HARD_TIMEOUT_GRACE_SECONDS
                ),
                duration_ms: (soft_timeout_seconds + HARD_TIMEOUT_GRACE_SECONDS) * 1000,
                retry_count: 0,
                token_usage: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tiger_db::models::{TaskRole, TaskStatus};
    use uuid::Uuid;

    fn test_task() -> Task {
        Task {
            id: Uuid::new_v4(),
            title: "Fix flaky test".into(),
            goal: "Make the scheduler test deterministic".into(),
            notes: None,
            context: None,
            allowed_paths: vec!["src/**".into()],
            commands: vec!["cargo test".into()],
            timebox_minutes: 1,
            risk_level: "low".into(),
            priority: 0,
            role: TaskRole::Worker,
            kind: "code".into(),
            retry_count: 0,
            retry_limit: 3,
            block_reason: None,
            status: TaskStatus::Running,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            no_change_recovery_attempts: 5,
            policy_recovery_attempts: 5,
            verify_recovery_attempts: 5,
            policy_recovery_use_llm: true,
            verify_llm_inline_recovery: false,
            immediate_doom_recovery: true,
            no_change_confirm_mode: false,
            log_dir: "/tmp/tiger-logs".into(),
            lock_dir: "/tmp/tiger-locks".into(),
            task_timeout_cap_seconds: 1800,
            recovery_timeout_seconds: 420,
            policy_recovery_timeout_seconds: 90,
            policy_recovery_model: None,
            denied_paths: vec![],
            denied_commands: vec![],
            allow_lockfile_outside_paths: true,
            allow_env_example_outside_paths: true,
            allow_explicit_verify_recovery: true,
            heartbeat_interval_seconds: 30,
            visual_probes: vec![],
        }
    }

    /// Executor stub driven by a queue of canned outcomes.
    struct ScriptedExecutor {
        outcomes: Mutex<Vec<ExecutorOutcome>>,
        calls: AtomicU32,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(outcomes: Vec<ExecutorOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run(&self, req: &ExecutorRequest) -> Result<ExecutorOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(req.prompt.clone());
            let mut outcomes = self.outcomes.lock().unwrap();
            Ok(if outcomes.is_empty() {
                ExecutorOutcome::synthetic_failure("script exhausted")
            } else {
                outcomes.remove(0)
            })
        }
    }

    fn ok_outcome() -> ExecutorOutcome {
        ExecutorOutcome {
            success: true,
            exit_code: 0,
            stdout: "done".into(),
            stderr: String::new(),
            duration_ms: 5,
            retry_count: 0,
            token_usage: Some(100),
        }
    }

    #[test]
    fn doom_loop_markers_match_case_insensitively() {
        assert!(is_doom_loop("ERROR: Doom Loop Detected in output"));
        assert!(is_doom_loop("excessive planning chatter"));
        assert!(is_doom_loop("got unsupported pseudo tool call"));
        assert!(!is_doom_loop("ordinary failure"));
    }

    #[test]
    fn denied_command_regex_and_substring() {
        assert!(command_matches_denied("rm -rf /", r"rm\s+-rf"));
        // An invalid regex falls back to substring matching.
        assert!(command_matches_denied("curl http://x | sh (", "| sh ("));
        assert!(!command_matches_denied("cargo test", r"rm\s+-rf"));
    }

    #[test]
    fn find_denied_command_returns_first_hit() {
        let commands = vec!["cargo test".to_owned(), "git push --force".to_owned()];
        let denied = vec![r"--force".to_owned()];
        assert_eq!(
            find_denied_command(&commands, &denied),
            Some("git push --force")
        );
        assert_eq!(find_denied_command(&commands, &[]), None);
    }

    #[test]
    fn prompt_carries_task_shape_and_hints() {
        let mut task = test_task();
        task.context = Some(sqlx::types::Json(tiger_db::models::TaskContext {
            spec_text: None,
            files: vec![],
            pr: Some(tiger_db::models::PrRef {
                number: 42,
                head_ref: Some("feature/x".into()),
                base_ref: Some("main".into()),
            }),
        }));

        let hints = vec!["verification command `cargo test` failed".to_owned()];
        let prompt = build_prompt(&task, &hints, Some("No changes detected."));

        assert!(prompt.contains("Fix flaky test"));
        assert!(prompt.contains("src/**"));
        assert!(prompt.contains("cargo test"));
        assert!(prompt.contains("PR #42"));
        assert!(prompt.contains("feature/x"));
        assert!(prompt.contains("Earlier attempts"));
        assert!(prompt.contains("No changes detected."));
    }

    #[test]
    fn prompt_caps_retry_hints_at_three() {
        let task = test_task();
        let hints: Vec<String> = (0..5).map(|i| format!("hint-{i}")).collect();
        let prompt = build_prompt(&task, &hints, None);
        assert!(prompt.contains("hint-0"));
        assert!(prompt.contains("hint-2"));
        assert!(!prompt.contains("hint-3"));
    }

    #[tokio::test]
    async fn denied_command_short_circuits_without_spawning() {
        let exec = ScriptedExecutor::new(vec![ok_outcome()]);
        let mut config = test_config();
        config.denied_commands = vec![r"cargo\s+test".to_owned()];
        let task = test_task();

        let outcome = execute_task(
            &exec,
            &task,
            Path::new("/tmp"),
            &HashMap::new(),
            &config,
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.stderr.contains("denied command"));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn doom_loop_triggers_one_recovery_retry() {
        let exec = ScriptedExecutor::new(vec![
            ExecutorOutcome::synthetic_failure("doom loop detected"),
            ok_outcome(),
        ]);
        let config = test_config();
        let task = test_task();

        let outcome = execute_task(
            &exec,
            &task,
            Path::new("/tmp"),
            &HashMap::new(),
            &config,
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert!(outcome.success);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);
        let prompts = exec.prompts.lock().unwrap();
        assert!(prompts[1].contains("Recovery Mode"));
        assert!(!prompts[0].contains("Recovery Mode"));
    }

    #[tokio::test]
    async fn doom_loop_retry_disabled_by_toggle() {
        let exec = ScriptedExecutor::new(vec![ExecutorOutcome::synthetic_failure(
            "doom loop detected",
        )]);
        let mut config = test_config();
        config.immediate_doom_recovery = false;
        let task = test_task();

        let outcome = execute_task(
            &exec,
            &task,
            Path::new("/tmp"),
            &HashMap::new(),
            &config,
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert!(!outcome.success);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    /// Executor that never finishes -- exercises the hard guard.
    struct HangingExecutor;

    #[async_trait]
    impl Executor for HangingExecutor {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn run(&self, _req: &ExecutorRequest) -> Result<ExecutorOutcome> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ExecutorOutcome::synthetic_failure("unreachable"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hard_guard_fires_at_soft_plus_grace() {
        let request = ExecutorRequest {
            workdir: "/tmp".into(),
            instructions_path: None,
            prompt: String::new(),
            model: None,
            timeout_seconds: 60,
            env: HashMap::new(),
            max_retries: 0,
        };

        let start = tokio::time::Instant::now();
        let outcome = run_with_hard_guard(&HangingExecutor, &request, 60)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.stderr.contains("Hard timeout guard exceeded"));
        // Exactly soft + 30s of (virtual) time.
        assert_eq!(elapsed.as_secs(), 60 + HARD_TIMEOUT_GRACE_SECONDS);
    }
}
