//! Recovery orchestrator: the layered attempt to turn a failed
//! verification into a success without leaving the pipeline.
//!
//! Five modes, in order, each with its own attempt budget:
//!
//! 1. **No-change recovery** -- re-execute with a nudge when the executor
//!    produced no diff.
//! 2. **No-change verification fallback** -- accept an intentional no-op
//!    when at least one verification command passes meaningfully.
//! 3. **Policy-violation recovery** -- auto-allow, then the LLM judge
//!    (allow / discard / deny), then wholesale cleanup.
//! 4. **Generated-artifact recovery** -- single pass discarding paths that
//!    look like build output.
//! 5. **Verify recovery** -- focused re-executions for failed
//!    verification commands.
//!
//! Between attempts the orchestrator restores the pipeline-owned branch;
//! the executor is free to wander off it.

pub mod judge;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Result, bail};
use async_trait::async_trait;
use regex::Regex;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use tiger_db::models::{FailureCode, Task, TaskRole};
use tiger_db::queries::{config as config_db, events as events_db, tasks as tasks_db};

use crate::config::WorkerConfig;
use crate::executor::driver::{self, ExecuteOptions};
use crate::executor::Executor;
use crate::vcs::Vcs;
use crate::verify::{
    InlineRecovery, InlineRecoveryContext, VerificationEngine, VerifyOptions, VerifyResult,
    violation_path,
};
use judge::JudgeInputs;
pub use judge::{JudgeOutcome, PolicyJudge};

/// Hint appended on each no-change recovery attempt.
pub const NO_CHANGE_HINT: &str =
    "No changes detected. Make changes required to meet the task goal.";

/// Config-table key under which discarded artifact paths are remembered.
pub const GENERATED_HINTS_CONFIG_KEY: &str = "worker.generated_artifact_hints";

/// Hint length cap applied by [`sanitize_retry_hint`].
pub const RETRY_HINT_MAX_CHARS: usize = 400;

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("\x1b\\[[0-9;]*[A-Za-z]").expect("static regex"))
}

/// Sanitize a failure summary for reuse as a prompt hint or persisted
/// error message: strip ANSI escapes, scrub absolute paths down to their
/// final component, collapse whitespace, and cap the length.
///
/// Idempotent: sanitizing a sanitized hint returns it unchanged.
pub fn sanitize_retry_hint(s: &str) -> String {
    let no_ansi = ansi_regex().replace_all(s, "");

    let scrubbed: Vec<String> = no_ansi
        .split_whitespace()
        .map(|token| {
            if token.starts_with('/') && token[1..].contains('/') {
                token.rsplit('/').next().unwrap_or(token).to_owned()
            } else {
                token.to_owned()
            }
        })
        .collect();
    let joined = scrubbed.join(" ");

    match joined.char_indices().nth(RETRY_HINT_MAX_CHARS) {
        Some((idx, _)) => joined[..idx].to_owned(),
        None => joined,
    }
}

/// Focused hint for a verify recovery attempt.
pub fn verify_failure_hint(command: &str, stderr: &str) -> String {
    format!(
        "verification command `{command}` failed. stderr: {}. Apply the smallest possible \
         targeted fix; do NOT restructure",
        sanitize_retry_hint(stderr)
    )
}

/// Gate for verify recovery (mode 5).
///
/// Recovery is permitted only for failed verification commands whose
/// source tag is recoverable; `explicit` additionally requires the
/// toggle. Unrecoverable failure codes (execution, quota) never enter.
pub fn should_attempt_verify_recovery(result: &VerifyResult, allow_explicit: bool) -> bool {
    if result.failure_code != Some(FailureCode::VerificationCommandFailed) {
        return false;
    }
    match result.failed_command_source {
        Some(tiger_db::models::CommandSource::Explicit) => allow_explicit,
        Some(_) => true,
        None => false,
    }
}

/// File suffixes that mark a path as likely build output.
pub const GENERATED_SUFFIXES: &[&str] = &[
    ".tsbuildinfo",
    ".log",
    ".tmp",
    ".map",
    ".pyc",
    ".o",
    ".class",
    ".d.ts.map",
];

/// Directory prefixes that mark a path as likely build output.
pub const GENERATED_DIRS: &[&str] = &[
    "node_modules/",
    "dist/",
    "build/",
    "out/",
    "target/",
    "coverage/",
    ".cache/",
    ".next/",
    "__pycache__/",
];

/// Whether a path matches the static generated-artifact patterns.
pub fn matches_generated_pattern(path: &str) -> bool {
    GENERATED_SUFFIXES.iter().any(|s| path.ends_with(s))
        || GENERATED_DIRS
            .iter()
            .any(|d| path.starts_with(d) || path.contains(&format!("/{d}")))
}

/// Pick the violating paths that are safe to discard as generated
/// artifacts: static pattern match, untracked, or gitignored on disk.
///
/// A tracked path that matches none of those is never a candidate.
pub fn select_generated_artifact_recovery_candidates(
    violating_paths: &[String],
    untracked: &HashSet<String>,
    gitignored: &HashSet<String>,
) -> Vec<String> {
    violating_paths
        .iter()
        .filter(|p| {
            matches_generated_pattern(p) || untracked.contains(*p) || gitignored.contains(*p)
        })
        .cloned()
        .collect()
}

/// Role- and command-driven auto-allow heuristics for policy recovery.
///
/// Returns the subset of violating paths the platform is willing to allow
/// without consulting the judge.
pub fn auto_allow_paths(role: TaskRole, commands: &[String], violating_paths: &[String]) -> Vec<String> {
    let docs_ok = role == TaskRole::Docser
        || commands.iter().any(|c| c.contains("docs"));
    let tests_ok = role == TaskRole::Tester
        || commands.iter().any(|c| c.contains("test"));

    violating_paths
        .iter()
        .filter(|path| {
            let p = path.as_str();
            (docs_ok && (p.starts_with("docs/") || p.ends_with(".md")))
                || (tests_ok
                    && (p.starts_with("tests/")
                        || p.starts_with("test/")
                        || p.contains(".test.")
                        || p.contains(".spec.")))
        })
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Immutable collaborators for one recovery cascade.
pub struct RecoveryContext<'a> {
    pub pool: &'a PgPool,
    pub vcs: &'a dyn Vcs,
    pub executor: &'a dyn Executor,
    pub config: &'a WorkerConfig,
    pub judge: Option<&'a PolicyJudge<'a>>,
    pub repo: &'a Path,
    pub env: &'a std::collections::HashMap<String, String>,
    /// The pipeline-owned branch; `None` in in-place mode.
    pub expected_branch: Option<&'a str>,
    /// Sanitized hints from recent failed runs, carried into every
    /// execution.
    pub retry_hints: &'a [String],
    /// Whether the initial execution itself failed (gates intentional
    /// no-op detection).
    pub execute_failed: bool,
    pub model: Option<&'a str>,
}

/// Final word from the cascade.
#[derive(Debug)]
pub struct RecoveryReport {
    pub result: VerifyResult,
    /// The judge denied a path; the failure must escalate, not retry.
    pub denied: bool,
}

/// Drive the full recovery cascade over a failed verification result.
pub async fn run_recovery(
    ctx: &RecoveryContext<'_>,
    task: &mut Task,
    opts: &mut VerifyOptions,
    first: VerifyResult,
) -> Result<RecoveryReport> {
    let mut result = first;

    // (a) No-change recovery.
    let intentional_noop = opts.allow_no_changes && !ctx.execute_failed;
    if result.failure_code == Some(FailureCode::NoActionableChanges) && !intentional_noop {
        result = no_change_recovery(ctx, task, opts, result).await?;
    }

    // (b) No-change verification fallback.
    if result.failure_code == Some(FailureCode::NoActionableChanges) && !opts.commands.is_empty() {
        info!(task_id = %task.id, "running no-change verification fallback");
        let mut fallback_opts = opts.clone();
        fallback_opts.allow_no_changes = true;
        let fallback = verify(ctx, task, &fallback_opts).await?;
        if fallback.success {
            return Ok(RecoveryReport {
                result: fallback,
                denied: false,
            });
        }
    }

    // (c) Policy-violation recovery.
    if !result.policy_violations.is_empty() {
        let (recovered, denied) = policy_recovery(ctx, task, opts, result).await?;
        result = recovered;
        if denied {
            return Ok(RecoveryReport {
                result,
                denied: true,
            });
        }
    }

    // (d) Generated-artifact recovery, single pass.
    if !result.policy_violations.is_empty() {
        result = generated_artifact_recovery(ctx, task, opts, result).await?;
    }

    // (e) Verify recovery.
    let mut attempt = 0;
    while !result.success
        && should_attempt_verify_recovery(&result, ctx.config.allow_explicit_verify_recovery)
        && attempt < ctx.config.verify_recovery_attempts
    {
        attempt += 1;
        let command = result.failed_command.clone().unwrap_or_default();
        let stderr = result.failed_command_stderr.clone().unwrap_or_default();
        info!(
            task_id = %task.id,
            attempt,
            command = %command,
            "verify recovery attempt"
        );

        let hint = verify_failure_hint(&command, &stderr);
        let exec_opts = ExecuteOptions {
            model: ctx.model,
            instructions_path: None,
            extra_hint: Some(&hint),
            retry_hints: ctx.retry_hints,
            timeout_override_seconds: Some(ctx.config.recovery_timeout_seconds),
        };
        // Execution timeouts here are not fatal: partial changes still
        // get verified.
        let outcome = driver::execute_task(ctx.executor, task, ctx.repo, ctx.env, ctx.config, &exec_opts)
            .await?;
        if !outcome.success {
            debug!(task_id = %task.id, stderr = %outcome.stderr.trim(), "recovery execution failed, verifying anyway");
        }

        restore_expected_branch(ctx.vcs, ctx.repo, ctx.expected_branch).await?;
        result = verify(ctx, task, opts).await?;
        if result.success {
            break;
        }
    }

    Ok(RecoveryReport {
        result,
        denied: false,
    })
}

/// Mode (a): re-execute with the no-change hint until a diff appears.
async fn no_change_recovery(
    ctx: &RecoveryContext<'_>,
    task: &Task,
    opts: &VerifyOptions,
    mut result: VerifyResult,
) -> Result<VerifyResult> {
    for attempt in 1..=ctx.config.no_change_recovery_attempts {
        if result.failure_code != Some(FailureCode::NoActionableChanges) {
            break;
        }
        info!(task_id = %task.id, attempt, "no-change recovery attempt");

        let exec_opts = ExecuteOptions {
            model: ctx.model,
            instructions_path: None,
            extra_hint: Some(NO_CHANGE_HINT),
            retry_hints: ctx.retry_hints,
            timeout_override_seconds: Some(ctx.config.recovery_timeout_seconds),
        };
        let outcome =
            driver::execute_task(ctx.executor, task, ctx.repo, ctx.env, ctx.config, &exec_opts)
                .await?;
        if !outcome.success {
            debug!(task_id = %task.id, "no-change recovery execution failed, verifying anyway");
        }

        restore_expected_branch(ctx.vcs, ctx.repo, ctx.expected_branch).await?;
        result = verify(ctx, task, opts).await?;
        if result.success {
            break;
        }
    }
    Ok(result)
}

/// Mode (c): auto-allow, judge, cleanup.
///
/// Returns `(result, denied)`.
async fn policy_recovery(
    ctx: &RecoveryContext<'_>,
    task: &mut Task,
    opts: &mut VerifyOptions,
    mut result: VerifyResult,
) -> Result<(VerifyResult, bool)> {
    for attempt in 1..=ctx.config.policy_recovery_attempts {
        if result.policy_violations.is_empty() {
            break;
        }
        info!(
            task_id = %task.id,
            attempt,
            violations = result.policy_violations.len(),
            "policy recovery attempt"
        );

        let violating: Vec<String> = result
            .policy_violations
            .iter()
            .map(|v| violation_path(v).to_owned())
            .collect();

        // 1. Auto-allow.
        let auto = auto_allow_paths(task.role, &task.commands, &violating);
        if !auto.is_empty() {
            info!(task_id = %task.id, paths = ?auto, "auto-allowing violating paths");
            widen_allowed_paths(ctx.pool, task, opts, &auto).await?;
            result = verify(ctx, task, opts).await?;
            continue;
        }

        // 2. LLM judge.
        let decision = match ctx.judge {
            Some(judge) if ctx.config.policy_recovery_use_llm => {
                let concurrent =
                    tasks_db::list_concurrent_tasks(ctx.pool, task.id, 10).await?;
                let inputs = JudgeInputs {
                    task_id: task.id,
                    task_title: &task.title,
                    allowed_paths: &task.allowed_paths,
                    denied_paths: &ctx.config.denied_paths,
                    violating_paths: &violating,
                    policy_violations: &result.policy_violations,
                    changed_files: &result.changed_files,
                    concurrent_tasks: &concurrent,
                };
                judge.decide(&inputs).await?
            }
            _ => None,
        };

        let Some(outcome) = decision else {
            // 3. Cleanup fallback: discard everything still violating.
            warn!(task_id = %task.id, "no judge decision, discarding all violating paths");
            ctx.vcs
                .discard_changes_for_paths(ctx.repo, &violating)
                .await?;
            learn_generated_hints(ctx.pool, &violating).await?;
            result = verify(ctx, task, opts).await?;
            break;
        };

        events_db::insert_event(
            ctx.pool,
            task.id,
            "task.policy_recovery_decided",
            &serde_json::to_value(&outcome).unwrap_or_default(),
        )
        .await?;

        if !outcome.deny_paths.is_empty() {
            events_db::insert_event(
                ctx.pool,
                task.id,
                "task.policy_recovery_denied",
                &serde_json::json!({
                    "deny_paths": outcome.deny_paths,
                    "summary": outcome.summary,
                }),
            )
            .await?;
            return Ok((result, true));
        }

        if !outcome.discard_paths.is_empty() {
            ctx.vcs
                .discard_changes_for_paths(ctx.repo, &outcome.discard_paths)
                .await?;
            learn_generated_hints(ctx.pool, &outcome.discard_paths).await?;
        }
        if !outcome.allow_paths.is_empty() {
            widen_allowed_paths(ctx.pool, task, opts, &outcome.allow_paths).await?;
        }

        events_db::insert_event(
            ctx.pool,
            task.id,
            "task.policy_recovery_applied",
            &serde_json::json!({
                "allow_paths": outcome.allow_paths,
                "discard_paths": outcome.discard_paths,
                "dropped_paths": outcome.dropped_paths,
            }),
        )
        .await?;

        result = verify(ctx, task, opts).await?;
    }

    Ok((result, false))
}

/// Mode (d): discard residual violations that look like build output.
async fn generated_artifact_recovery(
    ctx: &RecoveryContext<'_>,
    task: &Task,
    opts: &VerifyOptions,
    result: VerifyResult,
) -> Result<VerifyResult> {
    let violating: Vec<String> = result
        .policy_violations
        .iter()
        .map(|v| violation_path(v).to_owned())
        .collect();

    let untracked: HashSet<String> = ctx
        .vcs
        .untracked_files(ctx.repo)
        .await?
        .into_iter()
        .collect();
    let mut gitignored = HashSet::new();
    for path in &violating {
        if ctx.vcs.check_ignored(ctx.repo, path).await? {
            gitignored.insert(path.clone());
        }
    }

    let candidates =
        select_generated_artifact_recovery_candidates(&violating, &untracked, &gitignored);
    if candidates.is_empty() {
        return Ok(result);
    }

    info!(task_id = %task.id, paths = ?candidates, "discarding generated artifacts");
    ctx.vcs
        .discard_changes_for_paths(ctx.repo, &candidates)
        .await?;
    learn_generated_hints(ctx.pool, &candidates).await?;

    verify(ctx, task, opts).await
}

/// Re-run verification, wiring in the inline recovery handler when the
/// toggle is on.
async fn verify(
    ctx: &RecoveryContext<'_>,
    task: &Task,
    opts: &VerifyOptions,
) -> Result<VerifyResult> {
    let engine = VerificationEngine::new(ctx.vcs);
    if ctx.config.verify_llm_inline_recovery {
        let fixer = InlineFixer {
            executor: ctx.executor,
            vcs: ctx.vcs,
            config: ctx.config,
            task: task.clone(),
            repo: ctx.repo.to_path_buf(),
            env: ctx.env.clone(),
            expected_branch: ctx.expected_branch.map(str::to_owned),
            model: ctx.model.map(str::to_owned),
        };
        engine.run(ctx.repo, opts, Some(&fixer)).await
    } else {
        engine.run(ctx.repo, opts, None).await
    }
}

/// Merge new paths into the task's allowed set, locally and persisted.
async fn widen_allowed_paths(
    pool: &PgPool,
    task: &mut Task,
    opts: &mut VerifyOptions,
    new_paths: &[String],
) -> Result<()> {
    for path in new_paths {
        if !task.allowed_paths.contains(path) {
            task.allowed_paths.push(path.clone());
        }
        if !opts.allowed_paths.contains(path) {
            opts.allowed_paths.push(path.clone());
        }
    }
    tasks_db::update_allowed_paths(pool, task.id, &task.allowed_paths).await
}

/// Remember discarded artifact paths for future tasks.
async fn learn_generated_hints(pool: &PgPool, paths: &[String]) -> Result<()> {
    let existing = config_db::get_value(pool, GENERATED_HINTS_CONFIG_KEY)
        .await?
        .unwrap_or_default();
    let mut hints: Vec<String> = existing
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    for path in paths {
        if !hints.iter().any(|h| h == path) {
            hints.push(path.clone());
        }
    }
    config_db::set_value(pool, GENERATED_HINTS_CONFIG_KEY, &hints.join(",")).await
}

/// Put the working tree back on the pipeline-owned branch if the executor
/// switched away from it.
pub async fn restore_expected_branch(
    vcs: &dyn Vcs,
    repo: &Path,
    expected: Option<&str>,
) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let current = vcs.current_branch(repo).await?;
    if current.as_deref() == Some(expected) {
        return Ok(());
    }

    warn!(
        current = current.as_deref().unwrap_or("<detached>"),
        expected, "executor drifted off the task branch, restoring"
    );
    let output = vcs.checkout_branch(repo, expected).await?;
    if !output.success {
        bail!(
            "could not restore expected branch {expected}: {}",
            output.stderr.trim()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Inline recovery handler
// ---------------------------------------------------------------------------

/// Within-pass self-repair handed to the verification engine: a single
/// focused execution followed by a branch integrity check.
struct InlineFixer<'a> {
    executor: &'a dyn Executor,
    vcs: &'a dyn Vcs,
    config: &'a WorkerConfig,
    task: Task,
    repo: PathBuf,
    env: std::collections::HashMap<String, String>,
    expected_branch: Option<String>,
    model: Option<String>,
}

#[async_trait]
impl InlineRecovery for InlineFixer<'_> {
    async fn attempt_fix(&self, ctx: &InlineRecoveryContext) -> Result<bool> {
        let mut hint = verify_failure_hint(&ctx.failed_command, &ctx.stderr);
        if let Some(prev) = ctx.previous_execute_failure_hint.as_deref() {
            hint.push_str("\nPrevious failure: ");
            hint.push_str(prev);
        }

        let exec_opts = ExecuteOptions {
            model: self.model.as_deref(),
            instructions_path: None,
            extra_hint: Some(&hint),
            retry_hints: &[],
            timeout_override_seconds: Some(self.config.recovery_timeout_seconds),
        };
        let outcome = driver::execute_task(
            self.executor,
            &self.task,
            &self.repo,
            &self.env,
            self.config,
            &exec_opts,
        )
        .await?;

        restore_expected_branch(self.vcs, &self.repo, self.expected_branch.as_deref()).await?;

        // Even a timed-out execution may have left useful partial edits;
        // a re-run of the failed command is cheap either way.
        if !outcome.success {
            debug!(
                command = %ctx.failed_command,
                stderr = %outcome.stderr.trim(),
                "inline recovery execution did not succeed"
            );
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiger_db::models::CommandSource;

    #[test]
    fn sanitize_strips_ansi() {
        let input = "\x1b[31merror\x1b[0m: test failed";
        let out = sanitize_retry_hint(input);
        assert_eq!(out, "error: test failed");
    }

    #[test]
    fn sanitize_scrubs_absolute_paths() {
        let input = "error in /home/agent/workspace/task-1/src/lib.rs at line 3";
        let out = sanitize_retry_hint(input);
        assert_eq!(out, "error in lib.rs at line 3");
    }

    #[test]
    fn sanitize_caps_length() {
        let input = "x".repeat(1000);
        let out = sanitize_retry_hint(&input);
        assert_eq!(out.chars().count(), RETRY_HINT_MAX_CHARS);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "\x1b[31mred\x1b[0m /a/b/c.rs   spaced\ttabs",
            &"y".repeat(900),
            "already clean text",
        ];
        for input in inputs {
            let once = sanitize_retry_hint(input);
            let twice = sanitize_retry_hint(&once);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn verify_hint_names_command_and_stderr() {
        let hint = verify_failure_hint("npm test", "1 failing\n");
        assert!(hint.contains("`npm test`"));
        assert!(hint.contains("1 failing"));
        assert!(hint.contains("smallest possible"));
    }

    fn failed_result(source: Option<CommandSource>, code: Option<FailureCode>) -> VerifyResult {
        VerifyResult {
            success: false,
            failed_command: Some("cmd".into()),
            failed_command_source: source,
            failure_code: code,
            ..Default::default()
        }
    }

    #[test]
    fn verify_recovery_gate_allows_recoverable_sources() {
        for source in [
            CommandSource::Auto,
            CommandSource::LightCheck,
            CommandSource::Guard,
        ] {
            let result = failed_result(
                Some(source),
                Some(FailureCode::VerificationCommandFailed),
            );
            assert!(should_attempt_verify_recovery(&result, false));
        }
    }

    #[test]
    fn verify_recovery_gate_explicit_needs_toggle() {
        let result = failed_result(
            Some(CommandSource::Explicit),
            Some(FailureCode::VerificationCommandFailed),
        );
        assert!(should_attempt_verify_recovery(&result, true));
        assert!(!should_attempt_verify_recovery(&result, false));
    }

    #[test]
    fn verify_recovery_gate_rejects_unrecoverable_codes() {
        for code in [
            FailureCode::ExecutionFailed,
            FailureCode::QuotaFailure,
            FailureCode::PolicyViolation,
            FailureCode::NoActionableChanges,
        ] {
            let result = failed_result(Some(CommandSource::Explicit), Some(code));
            assert!(!should_attempt_verify_recovery(&result, true));
        }
        let no_code = failed_result(Some(CommandSource::Auto), None);
        assert!(!should_attempt_verify_recovery(&no_code, true));
    }

    #[test]
    fn generated_patterns_match_suffixes_and_dirs() {
        assert!(matches_generated_pattern("packages/db/tsconfig.tsbuildinfo"));
        assert!(matches_generated_pattern("dist/bundle.js"));
        assert!(matches_generated_pattern("apps/web/dist/x.js"));
        assert!(matches_generated_pattern("debug.log"));
        assert!(!matches_generated_pattern("src/logging.rs"));
        assert!(!matches_generated_pattern("docs/README.md"));
    }

    #[test]
    fn candidates_require_generated_untracked_or_ignored() {
        let violating = vec![
            "dist/out.js".to_owned(),          // generated pattern
            "scratch.txt".to_owned(),          // untracked
            "vendor/blob.bin".to_owned(),      // gitignored
            "src/tracked_source.rs".to_owned(), // none of the above
        ];
        let untracked: HashSet<String> = ["scratch.txt".to_owned()].into();
        let gitignored: HashSet<String> = ["vendor/blob.bin".to_owned()].into();

        let candidates =
            select_generated_artifact_recovery_candidates(&violating, &untracked, &gitignored);

        assert_eq!(
            candidates,
            vec![
                "dist/out.js".to_owned(),
                "scratch.txt".to_owned(),
                "vendor/blob.bin".to_owned()
            ]
        );
        assert!(!candidates.contains(&"src/tracked_source.rs".to_owned()));
    }

    #[test]
    fn candidate_selection_never_leaks_plain_tracked_paths() {
        // Spec property: a path that is tracked and matches none of the
        // generated/untracked/gitignored sets is never returned.
        let violating: Vec<String> = (0..50).map(|i| format!("src/file_{i}.rs")).collect();
        let candidates = select_generated_artifact_recovery_candidates(
            &violating,
            &HashSet::new(),
            &HashSet::new(),
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn auto_allow_docser_gets_docs() {
        let violating = vec!["docs/guide.md".to_owned(), "src/a.rs".to_owned()];
        let allowed = auto_allow_paths(TaskRole::Docser, &[], &violating);
        assert_eq!(allowed, vec!["docs/guide.md".to_owned()]);
    }

    #[test]
    fn auto_allow_tester_gets_tests() {
        let violating = vec![
            "tests/new_test.rs".to_owned(),
            "src/app.spec.ts".to_owned(),
            "src/app.ts".to_owned(),
        ];
        let allowed = auto_allow_paths(TaskRole::Tester, &[], &violating);
        assert_eq!(
            allowed,
            vec!["tests/new_test.rs".to_owned(), "src/app.spec.ts".to_owned()]
        );
    }

    #[test]
    fn auto_allow_worker_without_signals_gets_nothing() {
        let violating = vec!["docs/guide.md".to_owned(), "tests/x.rs".to_owned()];
        let allowed = auto_allow_paths(TaskRole::Worker, &["cargo build".to_owned()], &violating);
        assert!(allowed.is_empty());
    }

    #[test]
    fn auto_allow_worker_with_test_command_gets_tests() {
        let violating = vec!["tests/x.rs".to_owned()];
        let allowed = auto_allow_paths(TaskRole::Worker, &["cargo test".to_owned()], &violating);
        assert_eq!(allowed, vec!["tests/x.rs".to_owned()]);
    }
}
