//! Verification engine: path policy classification, ordered command
//! execution, failure classification, and optional visual probes.

pub mod probes;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use tiger_db::models::{CommandSource, FailureCode};

use crate::config::VERIFY_COMMAND_TIMEOUT_SECONDS;
use crate::vcs::Vcs;
use crate::vcs::snapshot::{self, Snapshot};
pub use probes::{ProbeResult, VisualProbe};

/// A verification command plus its provenance tag.
#[derive(Debug, Clone)]
pub struct VerifyCommand {
    pub command: String,
    pub source: CommandSource,
}

impl VerifyCommand {
    pub fn explicit(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            source: CommandSource::Explicit,
        }
    }
}

/// Inputs to a verification pass.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub allowed_paths: Vec<String>,
    pub denied_paths: Vec<String>,
    pub base_branch: String,
    pub commands: Vec<VerifyCommand>,
    pub allow_lockfile_outside_paths: bool,
    pub allow_env_example_outside_paths: bool,
    /// Accept an empty diff when at least one command passes meaningfully.
    pub allow_no_changes: bool,
    /// Snapshot taken before execution; when set, the changed set is a
    /// fresh snapshot diff instead of a branch diff (in-place mode has no
    /// branch to diff against).
    pub snapshot_before: Option<Snapshot>,
    pub visual_probes: Vec<VisualProbe>,
    /// Destination for probe artifact copies.
    pub probe_artifact_dir: Option<PathBuf>,
}

impl VerifyOptions {
    pub fn new(base_branch: impl Into<String>) -> Self {
        Self {
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
            base_branch: base_branch.into(),
            commands: Vec::new(),
            allow_lockfile_outside_paths: true,
            allow_env_example_outside_paths: true,
            allow_no_changes: false,
            snapshot_before: None,
            visual_probes: Vec::new(),
            probe_artifact_dir: None,
        }
    }
}

/// Result of one verification command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub source: CommandSource,
    /// `None` when the command was killed (timeout/signal).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub passed: bool,
}

/// Outcome of a verification pass.
#[derive(Debug, Clone, Default)]
pub struct VerifyResult {
    pub success: bool,
    pub command_results: Vec<CommandOutcome>,
    pub policy_violations: Vec<String>,
    pub failed_command: Option<String>,
    pub failed_command_source: Option<CommandSource>,
    pub failed_command_stderr: Option<String>,
    pub failure_code: Option<FailureCode>,
    pub changed_files: Vec<String>,
    pub visual_probe_results: Vec<ProbeResult>,
}

impl VerifyResult {
    /// At least one command ran and passed.
    pub fn meaningful_pass(&self) -> bool {
        self.command_results.iter().any(|r| r.passed)
    }
}

/// Context handed to the inline recovery handler when a command fails.
#[derive(Debug, Clone)]
pub struct InlineRecoveryContext {
    pub attempt: u32,
    pub max_attempts: u32,
    pub failed_command: String,
    pub source: CommandSource,
    pub stderr: String,
    pub previous_execute_failure_hint: Option<String>,
}

/// Within-pass self-repair: the recovery orchestrator implements this to
/// run a focused executor fix while the verification pass keeps its state.
#[async_trait]
pub trait InlineRecovery: Send + Sync {
    /// Attempt a fix. Returning `Ok(true)` asks the engine to re-run the
    /// failed command once.
    async fn attempt_fix(&self, ctx: &InlineRecoveryContext) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Path policy
// ---------------------------------------------------------------------------

/// Lockfile basenames exempt from path policy when the toggle allows.
pub const LOCKFILE_NAMES: &[&str] = &[
    "Cargo.lock",
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "bun.lockb",
    "composer.lock",
    "poetry.lock",
];

/// Whether a path's basename is a known lockfile.
pub fn is_lockfile(path: &str) -> bool {
    let base = path.rsplit('/').next().unwrap_or(path);
    LOCKFILE_NAMES.contains(&base)
}

/// Build a glob set with `/`-aware matching.
pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid path pattern {:?}", pattern))?;
        builder.add(glob);
    }
    builder.build().context("failed to build glob set")
}

/// Classify changed paths against the policy envelope.
///
/// Returns violation strings tagged with their source:
/// `denied: <path>` or `outside-allowed: <path>`.
pub fn classify_paths(
    changed: &[String],
    allowed: &GlobSet,
    allowed_is_empty: bool,
    denied: &GlobSet,
    allow_lockfiles: bool,
    allow_env_example: bool,
) -> Vec<String> {
    let mut violations = Vec::new();

    for path in changed {
        if denied.is_match(path.as_str()) {
            violations.push(format!("denied: {path}"));
            continue;
        }
        if allowed_is_empty || allowed.is_match(path.as_str()) {
            continue;
        }
        if allow_lockfiles && is_lockfile(path) {
            continue;
        }
        if allow_env_example && path.rsplit('/').next() == Some(".env.example") {
            continue;
        }
        violations.push(format!("outside-allowed: {path}"));
    }

    violations
}

/// Extract the bare path from a violation string.
pub fn violation_path(violation: &str) -> &str {
    violation
        .split_once(": ")
        .map(|(_, p)| p)
        .unwrap_or(violation)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs verification passes for a prepared working tree.
pub struct VerificationEngine<'a> {
    vcs: &'a dyn Vcs,
}

impl<'a> VerificationEngine<'a> {
    pub fn new(vcs: &'a dyn Vcs) -> Self {
        Self { vcs }
    }

    /// Run one verification pass.
    ///
    /// 1. Compute the changed-file set (branch diff or caller-provided).
    /// 2. Classify paths against the policy envelope.
    /// 3. Run each command in order (fixed per-command timeout), letting
    ///    the inline recovery handler patch up a failure mid-pass.
    /// 4. Run visual probes.
    /// 5. Classify the overall outcome.
    pub async fn run(
        &self,
        repo: &Path,
        opts: &VerifyOptions,
        inline: Option<&dyn InlineRecovery>,
    ) -> Result<VerifyResult> {
        // 1. Changed files.
        let changed_files = match &opts.snapshot_before {
            Some(before) => {
                let after = snapshot::take_snapshot(repo)?;
                snapshot::diff_snapshots(before, &after).touched_paths()
            }
            None => self.vcs.changed_files(repo, &opts.base_branch).await?,
        };

        // 2. Path policy.
        let allowed = build_globset(&opts.allowed_paths)?;
        let denied = build_globset(&opts.denied_paths)?;
        let policy_violations = classify_paths(
            &changed_files,
            &allowed,
            opts.allowed_paths.is_empty(),
            &denied,
            opts.allow_lockfile_outside_paths,
            opts.allow_env_example_outside_paths,
        );

        // 3. Commands.
        let mut command_results = Vec::with_capacity(opts.commands.len());
        for cmd in &opts.commands {
            let mut outcome = run_verify_command(repo, cmd).await?;

            if !outcome.passed {
                if let Some(handler) = inline {
                    let ctx = InlineRecoveryContext {
                        attempt: 1,
                        max_attempts: 1,
                        failed_command: cmd.command.clone(),
                        source: cmd.source,
                        stderr: outcome.stderr.clone(),
                        previous_execute_failure_hint: None,
                    };
                    match handler.attempt_fix(&ctx).await {
                        Ok(true) => {
                            info!(command = %cmd.command, "inline recovery applied, re-running command");
                            outcome = run_verify_command(repo, cmd).await?;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(command = %cmd.command, error = %e, "inline recovery handler failed");
                        }
                    }
                }
            }

            command_results.push(outcome);
        }

        // 4. Probes.
        let visual_probe_results = if opts.visual_probes.is_empty() {
            Vec::new()
        } else {
            probes::run_visual_probes(
                repo,
                &opts.visual_probes,
                opts.probe_artifact_dir.as_deref(),
            )?
        };

        // 5. Classification.
        Ok(classify_outcome(
            changed_files,
            policy_violations,
            command_results,
            visual_probe_results,
            opts.allow_no_changes,
        ))
    }
}

fn classify_outcome(
    changed_files: Vec<String>,
    policy_violations: Vec<String>,
    command_results: Vec<CommandOutcome>,
    visual_probe_results: Vec<ProbeResult>,
    allow_no_changes: bool,
) -> VerifyResult {
    let first_failed = command_results.iter().find(|r| !r.passed).cloned();

    let mut result = VerifyResult {
        success: false,
        command_results,
        policy_violations,
        failed_command: None,
        failed_command_source: None,
        failed_command_stderr: None,
        failure_code: None,
        changed_files,
        visual_probe_results,
    };

    if !result.policy_violations.is_empty() {
        result.failure_code = Some(FailureCode::PolicyViolation);
        return result;
    }

    if let Some(failed) = first_failed {
        result.failure_code = Some(FailureCode::VerificationCommandFailed);
        result.failed_command = Some(failed.command);
        result.failed_command_source = Some(failed.source);
        result.failed_command_stderr = Some(failed.stderr);
        return result;
    }

    if result.changed_files.is_empty() {
        if allow_no_changes && result.meaningful_pass() {
            debug!("accepting no-change result: at least one command passed");
            result.success = true;
        } else {
            result.failure_code = Some(FailureCode::NoActionableChanges);
        }
        return result;
    }

    result.success = true;
    result
}

/// Run one verification command through the shell with the fixed timeout.
async fn run_verify_command(repo: &Path, cmd: &VerifyCommand) -> Result<CommandOutcome> {
    let start = Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&cmd.command)
        .current_dir(repo)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn verification command {:?}", cmd.command))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let timeout = Duration::from_secs(VERIFY_COMMAND_TIMEOUT_SECONDS);
    match tokio::time::timeout(timeout, async {
        let (wait, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
        (wait, stdout, stderr)
    })
    .await
    {
        Ok((Ok(status), stdout, stderr)) => {
            let exit_code = status.code();
            Ok(CommandOutcome {
                command: cmd.command.clone(),
                source: cmd.source,
                exit_code,
                stdout,
                stderr,
                duration_ms: elapsed_ms(start),
                passed: status.success(),
            })
        }
        Ok((Err(e), _, _)) => Err(e)
            .with_context(|| format!("failed to wait on verification command {:?}", cmd.command)),
        Err(_elapsed) => {
            let _ = child.kill().await;
            Ok(CommandOutcome {
                command: cmd.command.clone(),
                source: cmd.source,
                exit_code: None,
                stdout: String::new(),
                stderr: format!(
                    "verification command timed out after {VERIFY_COMMAND_TIMEOUT_SECONDS}s"
                ),
                duration_ms: elapsed_ms(start),
                passed: false,
            })
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
