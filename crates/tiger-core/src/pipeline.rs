//! Task pipeline: the seven-step state machine that turns a claimed task
//! into a reviewed change or a classified failure.
//!
//! Steps: checkout, branch, execute, validate expected files, verify (plus
//! the recovery cascade), commit & push, PR create. Every exit funnels
//! into a [`PipelineOutcome`] that the worker hands to the finalizer --
//! the pipeline itself never updates terminal state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use tiger_db::models::{
    ArtifactKind, BlockReason, CommandSource, ErrorMeta, FailureCode, RunStatus, Task, TaskStatus,
};
use tiger_db::queries::{artifacts as artifacts_db, config as config_db, runs as runs_db,
    tasks as tasks_db};

use crate::config::WorkerConfig;
use crate::environment::{self, EnvComposeOptions, EXECUTOR_CONFIG_KEYS};
use crate::executor::driver::{self, ExecuteOptions};
use crate::executor::Executor;
use crate::recovery::{self, PolicyJudge, RecoveryContext, sanitize_retry_hint};
use crate::repo::{PrepareMode, PreparedRepo, RepoConfig, RepoPreparer};
use crate::vcs::{Vcs, snapshot};
use crate::verify::{VerificationEngine, VerifyCommand, VerifyOptions, VerifyResult};

/// Marker prefix appended (once) to task notes when a verification or
/// policy failure parks the task for rework.
pub const REWORK_MARKER_PREFIX: &str = "[verify-rework-json]";

/// Terminal decision produced by the pipeline; consumed by the finalizer.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub run_status: RunStatus,
    pub task_status: TaskStatus,
    pub block_reason: Option<BlockReason>,
    pub error_message: Option<String>,
    pub error_meta: Option<ErrorMeta>,
    pub cost_tokens: Option<i64>,
}

impl PipelineOutcome {
    fn success(task_status: TaskStatus, block_reason: Option<BlockReason>) -> Self {
        Self {
            run_status: RunStatus::Success,
            task_status,
            block_reason,
            error_message: None,
            error_meta: None,
            cost_tokens: None,
        }
    }

    fn failure(
        task_status: TaskStatus,
        block_reason: Option<BlockReason>,
        message: String,
        meta: ErrorMeta,
    ) -> Self {
        Self {
            run_status: RunStatus::Failed,
            task_status,
            block_reason,
            error_message: Some(sanitize_retry_hint(&message)),
            error_meta: Some(meta),
            cost_tokens: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Classification helpers
// ---------------------------------------------------------------------------

fn quota_regexes() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"(?i)quota",
            r"(?i)rate.?limit",
            r"(?i)resource exhausted",
            r"(?i)too many requests",
            r"\b429\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
    })
}

/// Whether executor stderr indicates quota/rate-limit exhaustion.
pub fn is_quota_failure(stderr: &str) -> bool {
    quota_regexes().iter().any(|re| re.is_match(stderr))
}

/// Parse a conflict-autofix task title: `[AutoFix-Conflict] PR #<N>`.
pub fn parse_conflict_autofix_title(title: &str) -> Option<i64> {
    let rest = title.trim().strip_prefix("[AutoFix-Conflict] PR #")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Percent-encode for the rework marker payload (RFC 3986 unreserved set
/// passes through).
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Build the context-notes rework marker for a failure.
pub fn build_rework_marker(meta: &ErrorMeta) -> String {
    let json = serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_owned());
    format!("{REWORK_MARKER_PREFIX}{}", percent_encode(&json))
}

/// Whether the task notes already carry a rework marker.
pub fn rework_marker_present(notes: Option<&str>) -> bool {
    notes.is_some_and(|n| n.contains(REWORK_MARKER_PREFIX))
}

/// Infer artifact directories from verification commands so git can be
/// taught to ignore them (e.g. `cmake -B build-headless` contributes
/// `build-headless/`).
pub fn infer_artifact_dirs(commands: &[String]) -> Vec<String> {
    let mut dirs = Vec::new();
    for command in commands {
        let tokens: Vec<&str> = command.split_whitespace().collect();
        for (i, token) in tokens.iter().enumerate() {
            let dir = match *token {
                "-B" | "--target-dir" | "--out-dir" | "--output-dir" => {
                    tokens.get(i + 1).copied()
                }
                _ => token
                    .strip_prefix("-B")
                    .filter(|rest| !rest.is_empty()),
            };
            if let Some(dir) = dir {
                let clean = dir.trim_end_matches('/');
                if !clean.is_empty() && !clean.starts_with('-') {
                    let entry = format!("{clean}/");
                    if !dirs.contains(&entry) {
                        dirs.push(entry);
                    }
                }
            }
        }
    }
    dirs
}

/// Resolve the `info/exclude` location for a checkout. In a worktree the
/// `.git` entry is a pointer file naming the real git dir.
fn git_info_exclude_path(repo: &Path) -> Result<std::path::PathBuf> {
    let dot_git = repo.join(".git");
    if dot_git.is_file() {
        let contents = std::fs::read_to_string(&dot_git)
            .with_context(|| format!("failed to read {}", dot_git.display()))?;
        let gitdir = contents
            .trim()
            .strip_prefix("gitdir: ")
            .with_context(|| format!("unexpected gitdir pointer in {}", dot_git.display()))?;
        let gitdir_path = Path::new(gitdir);
        let gitdir_abs = if gitdir_path.is_absolute() {
            gitdir_path.to_path_buf()
        } else {
            repo.join(gitdir_path)
        };
        Ok(gitdir_abs.join("info").join("exclude"))
    } else {
        Ok(dot_git.join("info").join("exclude"))
    }
}

/// Append missing lines to `.git/info/exclude`. Never rewrites existing
/// content.
pub fn append_git_exclude(repo: &Path, dirs: &[String]) -> Result<()> {
    if dirs.is_empty() {
        return Ok(());
    }
    let exclude_path = git_info_exclude_path(repo)?;
    if let Some(parent) = exclude_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let existing = std::fs::read_to_string(&exclude_path).unwrap_or_default();
    let existing_lines: Vec<&str> = existing.lines().collect();

    let mut additions = String::new();
    for dir in dirs {
        if !existing_lines.contains(&dir.as_str()) {
            additions.push_str(dir);
            additions.push('\n');
        }
    }
    if additions.is_empty() {
        return Ok(());
    }

    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&exclude_path)
        .with_context(|| format!("failed to open {}", exclude_path.display()))?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.write_all(additions.as_bytes())?;
    Ok(())
}

/// Commit message derived from the task and its changed files.
pub fn build_commit_message(task: &Task, changed_files: &[String]) -> String {
    let mut message = format!("{}\n\nTask: {}\n", task.title, task.id);
    if !changed_files.is_empty() {
        message.push_str("\nChanged files:\n");
        for file in changed_files.iter().take(20) {
            message.push_str(&format!("  - {file}\n"));
        }
        if changed_files.len() > 20 {
            message.push_str(&format!("  ... and {} more\n", changed_files.len() - 20));
        }
    }
    message
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Collaborators and configuration for pipeline runs.
pub struct Pipeline<'a> {
    pub pool: &'a PgPool,
    pub vcs: &'a dyn Vcs,
    pub executor: &'a dyn Executor,
    pub config: &'a WorkerConfig,
    pub repo_config: &'a RepoConfig,
    pub agent_id: &'a str,
    pub model: Option<&'a str>,
    pub instructions_path: Option<&'a Path>,
    pub log_dir: &'a Path,
}

impl Pipeline<'_> {
    /// Run the pipeline for a claimed task.
    ///
    /// Infallible by contract: every internal error is converted into a
    /// classified [`PipelineOutcome`] so the worker always reaches the
    /// finalizer.
    pub async fn run(&self, task: &mut Task, run_id: Uuid) -> PipelineOutcome {
        match self.run_inner(task, run_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id = %task.id, error = %format!("{e:#}"), "pipeline failed with error");
                PipelineOutcome::failure(
                    TaskStatus::Failed,
                    None,
                    format!("{e:#}"),
                    ErrorMeta {
                        source: Some("pipeline".to_owned()),
                        failure_code: Some(FailureCode::ExecutionFailed),
                        ..Default::default()
                    },
                )
            }
        }
    }

    async fn run_inner(&self, task: &mut Task, run_id: Uuid) -> Result<PipelineOutcome> {
        // Step 1: checkout.
        info!(task_id = %task.id, step = 1, "checkout");
        let preparer = RepoPreparer::new(self.vcs, self.repo_config);
        let prepared = preparer.prepare(task, self.agent_id).await?;

        // Step 2: branch + artifacts.
        info!(task_id = %task.id, step = 2, branch = ?prepared.branch, "branch");
        self.record_prepare_artifacts(run_id, &prepared).await;
        append_git_exclude(&prepared.path, &infer_artifact_dirs(&task.commands))?;

        // Step 3: execute.
        info!(task_id = %task.id, step = 3, "execute");
        let retry_hints = self.gather_retry_hints(task.id).await?;
        let env = self.compose_executor_env(&prepared.path).await?;

        let snapshot_before = if prepared.mode == PrepareMode::InPlace {
            Some(snapshot::take_snapshot(&prepared.path)?)
        } else {
            None
        };

        let exec_opts = ExecuteOptions {
            model: self.model,
            instructions_path: self.instructions_path,
            extra_hint: None,
            retry_hints: &retry_hints,
            timeout_override_seconds: None,
        };
        let outcome = driver::execute_task(
            self.executor,
            task,
            &prepared.path,
            &env,
            self.config,
            &exec_opts,
        )
        .await?;
        let cost_tokens = outcome.token_usage;
        let execute_failed = !outcome.success;

        if execute_failed && is_quota_failure(&outcome.stderr) {
            info!(task_id = %task.id, "quota exhaustion detected, parking task");
            let mut result = PipelineOutcome::failure(
                TaskStatus::Blocked,
                Some(BlockReason::QuotaWait),
                outcome.stderr.clone(),
                ErrorMeta {
                    source: Some("executor".to_owned()),
                    failure_code: Some(FailureCode::QuotaFailure),
                    ..Default::default()
                },
            );
            result.cost_tokens = cost_tokens;
            return Ok(result);
        }

        recovery::restore_expected_branch(self.vcs, &prepared.path, prepared.branch.as_deref())
            .await?;

        // Step 4: validate expected files (non-fatal).
        info!(task_id = %task.id, step = 4, "validate expected files");
        if let Some(ctx) = task.context() {
            for file in &ctx.files {
                if !prepared.path.join(file).exists() {
                    warn!(task_id = %task.id, file = %file, "declared context file missing after execution");
                }
            }
        }

        // Step 5: verify + recovery cascade.
        info!(task_id = %task.id, step = 5, "verify");
        let mut verify_opts = self.build_verify_options(task, run_id, snapshot_before)?;

        let engine = VerificationEngine::new(self.vcs);
        let first = engine.run(&prepared.path, &verify_opts, None).await?;

        let (verify_result, denied) = if first.success {
            (first, false)
        } else {
            let judge = self.config.policy_recovery_use_llm.then(|| {
                PolicyJudge::new(
                    self.executor,
                    self.config.policy_recovery_model.clone(),
                    self.config.policy_recovery_timeout_seconds,
                )
            });
            let ctx = RecoveryContext {
                pool: self.pool,
                vcs: self.vcs,
                executor: self.executor,
                config: self.config,
                judge: judge.as_ref(),
                repo: &prepared.path,
                env: &env,
                expected_branch: prepared.branch.as_deref(),
                retry_hints: &retry_hints,
                execute_failed,
                model: self.model,
            };
            let report = recovery::run_recovery(&ctx, task, &mut verify_opts, first).await?;
            (report.result, report.denied)
        };

        // Steps 6-7 + terminal classification.
        let mut outcome = self
            .classify_and_publish(task, run_id, &prepared, verify_result, denied, execute_failed)
            .await?;
        outcome.cost_tokens = cost_tokens;
        Ok(outcome)
    }

    async fn classify_and_publish(
        &self,
        task: &mut Task,
        run_id: Uuid,
        prepared: &PreparedRepo,
        result: VerifyResult,
        denied: bool,
        execute_failed: bool,
    ) -> Result<PipelineOutcome> {
        if result.success {
            let has_diff = !result.changed_files.is_empty();

            if has_diff {
                // Step 6: commit & push (version-controlled modes only).
                if prepared.mode != PrepareMode::InPlace {
                    info!(task_id = %task.id, step = 6, "commit & push");
                    let branch = prepared.branch.as_deref().unwrap_or_default();
                    let message = build_commit_message(task, &result.changed_files);
                    let push = prepared.mode == PrepareMode::Clone;
                    let committed = self
                        .vcs
                        .commit_and_push(&prepared.path, &message, branch, push)
                        .await?;
                    if !committed.success {
                        return Ok(PipelineOutcome::failure(
                            TaskStatus::Failed,
                            None,
                            format!("commit failed: {}", committed.stderr),
                            ErrorMeta {
                                source: Some("vcs".to_owned()),
                                failure_code: Some(FailureCode::ExecutionFailed),
                                ..Default::default()
                            },
                        ));
                    }
                    self.record_artifact(run_id, ArtifactKind::Commit, branch, None).await;
                }

                return match prepared.mode {
                    PrepareMode::Clone => {
                        // Step 7: PR create.
                        info!(task_id = %task.id, step = 7, "PR create");
                        let branch = prepared.branch.as_deref().unwrap_or_default();
                        let base = &self.repo_config.base_branch;
                        let ensured = self
                            .vcs
                            .ensure_remote_base_branch(&prepared.path, base)
                            .await?;
                        if !ensured.success {
                            warn!(task_id = %task.id, stderr = %ensured.stderr.trim(), "could not ensure remote base branch");
                        }
                        let pr = self
                            .vcs
                            .create_task_pr(
                                &prepared.path,
                                &task.title,
                                &format!("Automated change for task {}\n\n{}", task.id, task.goal),
                                base,
                                branch,
                            )
                            .await?;
                        if let Some(number) = pr.number {
                            artifacts_db::insert_artifact(
                                self.pool,
                                run_id,
                                ArtifactKind::Pr,
                                &number.to_string(),
                                pr.url.as_deref(),
                                &serde_json::json!({}),
                            )
                            .await
                            .ok();
                        } else {
                            warn!(task_id = %task.id, stderr = %pr.output.stderr.trim(), "PR creation did not return a number");
                        }
                        Ok(PipelineOutcome::success(
                            TaskStatus::Blocked,
                            Some(BlockReason::AwaitingJudge),
                        ))
                    }
                    PrepareMode::Worktree => Ok(PipelineOutcome::success(
                        TaskStatus::Blocked,
                        Some(BlockReason::AwaitingJudge),
                    )),
                    PrepareMode::InPlace => {
                        self.record_artifact(
                            run_id,
                            ArtifactKind::DirectEdit,
                            &result.changed_files.join(","),
                            None,
                        )
                        .await;
                        Ok(PipelineOutcome::success(TaskStatus::Done, None))
                    }
                };
            }

            // Success with no diff.
            if let (Some(pr_number), Some(_)) = (
                parse_conflict_autofix_title(&task.title),
                task.pr_ref(),
            ) {
                // Conflict-autofix tasks with nothing to do go back to the
                // judge with the existing PR attached.
                artifacts_db::insert_artifact(
                    self.pool,
                    run_id,
                    ArtifactKind::Pr,
                    &pr_number.to_string(),
                    None,
                    &serde_json::json!({"reused": true}),
                )
                .await
                .ok();
                return Ok(PipelineOutcome::success(
                    TaskStatus::Blocked,
                    Some(BlockReason::AwaitingJudge),
                ));
            }

            return Ok(PipelineOutcome::success(TaskStatus::Done, None));
        }

        // Failure paths.
        let meta = ErrorMeta {
            source: Some("verification".to_owned()),
            failure_code: result.failure_code,
            failed_command: result.failed_command.clone(),
            failed_command_source: result.failed_command_source,
            failed_command_stderr: result
                .failed_command_stderr
                .as_deref()
                .map(sanitize_retry_hint),
            policy_violations: result.policy_violations.clone(),
            visual_probes: if result.visual_probe_results.is_empty() {
                None
            } else {
                serde_json::to_value(&result.visual_probe_results).ok()
            },
        };

        let message = match result.failure_code {
            Some(FailureCode::PolicyViolation) => {
                format!("policy violations: {}", result.policy_violations.join("; "))
            }
            Some(FailureCode::VerificationCommandFailed) => format!(
                "verification command failed: {}",
                result.failed_command.as_deref().unwrap_or("<unknown>")
            ),
            Some(FailureCode::NoActionableChanges) => "no actionable changes produced".to_owned(),
            _ => "task execution failed".to_owned(),
        };

        match result.failure_code {
            Some(FailureCode::VerificationCommandFailed) | Some(FailureCode::PolicyViolation)
                if !denied =>
            {
                // Park for rework, marking the task context once.
                if !rework_marker_present(task.notes.as_deref()) {
                    let marker = build_rework_marker(&meta);
                    tasks_db::append_task_note(self.pool, task.id, &marker).await?;
                    task.notes = Some(match task.notes.take() {
                        Some(existing) if !existing.is_empty() => format!("{existing}\n{marker}"),
                        _ => marker,
                    });
                }
                Ok(PipelineOutcome::failure(
                    TaskStatus::Blocked,
                    Some(BlockReason::NeedsRework),
                    message,
                    meta,
                ))
            }
            Some(FailureCode::NoActionableChanges) if execute_failed => {
                let mut meta = meta;
                meta.failure_code = Some(FailureCode::ExecutionFailed);
                meta.source = Some("executor".to_owned());
                Ok(PipelineOutcome::failure(
                    TaskStatus::Failed,
                    None,
                    "executor failed and produced no changes".to_owned(),
                    meta,
                ))
            }
            _ => Ok(PipelineOutcome::failure(TaskStatus::Failed, None, message, meta)),
        }
    }

    fn build_verify_options(
        &self,
        task: &Task,
        run_id: Uuid,
        snapshot_before: Option<snapshot::Snapshot>,
    ) -> Result<VerifyOptions> {
        Ok(VerifyOptions {
            allowed_paths: task.allowed_paths.clone(),
            denied_paths: self.config.denied_paths.clone(),
            base_branch: self.repo_config.base_branch.clone(),
            commands: task
                .commands
                .iter()
                .map(|c| VerifyCommand {
                    command: c.clone(),
                    source: CommandSource::Explicit,
                })
                .collect(),
            allow_lockfile_outside_paths: self.config.allow_lockfile_outside_paths,
            allow_env_example_outside_paths: self.config.allow_env_example_outside_paths,
            allow_no_changes: task.kind == "verify" && !self.config.no_change_confirm_mode,
            snapshot_before,
            visual_probes: self
                .config
                .visual_probes
                .iter()
                .map(|(id, pattern)| crate::verify::VisualProbe {
                    id: id.clone(),
                    pattern: pattern.clone(),
                })
                .collect(),
            probe_artifact_dir: Some(
                self.log_dir
                    .join("artifacts")
                    .join(run_id.to_string())
                    .join("visual-probes"),
            ),
        })
    }

    async fn gather_retry_hints(&self, task_id: Uuid) -> Result<Vec<String>> {
        let runs = runs_db::list_recent_failed_runs(self.pool, task_id, 3).await?;
        Ok(runs
            .iter()
            .filter_map(|run| run.error_message.as_deref())
            .map(sanitize_retry_hint)
            .filter(|h| !h.is_empty())
            .collect())
    }

    async fn compose_executor_env(&self, repo: &Path) -> Result<HashMap<String, String>> {
        let keys: Vec<String> = EXECUTOR_CONFIG_KEYS.iter().map(|k| (*k).to_owned()).collect();
        let overlay = config_db::get_values(self.pool, &keys).await?;
        let parent = environment::parent_environment();
        Ok(environment::compose_environment(
            &parent,
            repo,
            &overlay,
            &EnvComposeOptions::default(),
        ))
    }

    async fn record_prepare_artifacts(&self, run_id: Uuid, prepared: &PreparedRepo) {
        if let Some(branch) = prepared.branch.as_deref() {
            self.record_artifact(run_id, ArtifactKind::Branch, branch, None).await;
        }
        if prepared.mode == PrepareMode::Worktree {
            self.record_artifact(
                run_id,
                ArtifactKind::Worktree,
                &prepared.path.to_string_lossy(),
                None,
            )
            .await;
        }
    }

    async fn record_artifact(
        &self,
        run_id: Uuid,
        kind: ArtifactKind,
        reference: &str,
        url: Option<&str>,
    ) {
        // Artifact bookkeeping must not fail the pipeline.
        if let Err(e) = artifacts_db::insert_artifact(
            self.pool,
            run_id,
            kind,
            reference,
            url,
            &serde_json::json!({}),
        )
        .await
        {
            warn!(kind = %kind, error = %e, "failed to record artifact");
        }
    }
}
