//! Policy recovery judge: a small LLM invocation that decides, per
//! violating path, whether to allow it, discard it, or deny the recovery.
//!
//! The judge's output is untrusted. Sanitization is non-negotiable: a
//! decision survives only when its path is relative, contains no `..` or
//! glob metacharacters, and names one of the violating paths. An `allow`
//! on a platform-denied path is demoted to `deny`. Everything dropped is
//! reported in the audit payload.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use anyhow::Result;
use globset::GlobSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tiger_db::queries::tasks::ConcurrentTask;

use crate::executor::{Executor, ExecutorRequest};
use crate::verify::build_globset;

/// Everything the judge gets to see.
#[derive(Debug, Clone)]
pub struct JudgeInputs<'a> {
    pub task_id: Uuid,
    pub task_title: &'a str,
    pub allowed_paths: &'a [String],
    pub denied_paths: &'a [String],
    pub violating_paths: &'a [String],
    pub policy_violations: &'a [String],
    pub changed_files: &'a [String],
    /// Snapshot of concurrent tasks so the judge avoids claiming another
    /// task's area. At most ten rows.
    pub concurrent_tasks: &'a [ConcurrentTask],
}

/// Sanitized judge verdict.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeOutcome {
    pub allow_paths: Vec<String>,
    pub discard_paths: Vec<String>,
    pub deny_paths: Vec<String>,
    pub dropped_paths: Vec<String>,
    pub confidence: f64,
    pub model: String,
    pub latency_ms: u64,
    pub summary: String,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    path: String,
    action: String,
    #[serde(default)]
    #[allow(dead_code)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    decisions: Vec<RawDecision>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Invokes the judge model through the executor port.
pub struct PolicyJudge<'a> {
    executor: &'a dyn Executor,
    model: Option<String>,
    timeout_seconds: u64,
}

impl<'a> PolicyJudge<'a> {
    pub fn new(executor: &'a dyn Executor, model: Option<String>, timeout_seconds: u64) -> Self {
        Self {
            executor,
            model,
            timeout_seconds,
        }
    }

    /// Ask the judge for a decision.
    ///
    /// Runs in an isolated temporary working directory with an empty
    /// environment and zero retries. Returns `Ok(None)` when the response
    /// cannot be parsed into the expected shape.
    pub async fn decide(&self, inputs: &JudgeInputs<'_>) -> Result<Option<JudgeOutcome>> {
        let model = self
            .model
            .clone()
            .or_else(|| self.executor.smallest_model());

        let workdir = tempfile::tempdir()?;
        let request = ExecutorRequest {
            workdir: workdir.path().to_path_buf(),
            instructions_path: None,
            prompt: build_judge_prompt(inputs),
            model: model.clone(),
            timeout_seconds: self.timeout_seconds,
            env: std::collections::HashMap::new(),
            max_retries: 0,
        };

        let start = Instant::now();
        let outcome = self.executor.run(&request).await?;
        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        if !outcome.success {
            warn!(
                task_id = %inputs.task_id,
                stderr = %outcome.stderr.trim(),
                "policy judge invocation failed"
            );
            return Ok(None);
        }

        let Some(raw) = parse_judge_response(&outcome.stdout) else {
            debug!(task_id = %inputs.task_id, "no parseable judge response");
            return Ok(None);
        };

        let denied = build_globset(inputs.denied_paths)?;
        let sanitized = sanitize_decisions(&raw, inputs.violating_paths, &denied);

        info!(
            task_id = %inputs.task_id,
            allow = sanitized.allow.len(),
            discard = sanitized.discard.len(),
            deny = sanitized.deny.len(),
            dropped = sanitized.dropped.len(),
            "policy judge decided"
        );

        Ok(Some(JudgeOutcome {
            allow_paths: sanitized.allow,
            discard_paths: sanitized.discard,
            deny_paths: sanitized.deny,
            dropped_paths: sanitized.dropped,
            confidence: raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            model: model.unwrap_or_else(|| "default".to_owned()),
            latency_ms,
            summary: raw.summary.unwrap_or_default(),
        }))
    }
}

fn build_judge_prompt(inputs: &JudgeInputs<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are reviewing path policy violations produced by a coding agent. \
         For each violating path decide one of:\n\
         - \"allow\": the change belongs to this task; widen the policy\n\
         - \"discard\": a generated or incidental file; drop the change\n\
         - \"deny\": the change must not happen; stop recovery\n\n",
    );
    prompt.push_str(&format!(
        "Task {} -- {}\n\nCurrent allowed paths:\n",
        inputs.task_id, inputs.task_title
    ));
    for p in inputs.allowed_paths {
        prompt.push_str(&format!("  - {p}\n"));
    }
    if !inputs.denied_paths.is_empty() {
        prompt.push_str("\nPlatform-denied paths:\n");
        for p in inputs.denied_paths {
            prompt.push_str(&format!("  - {p}\n"));
        }
    }
    prompt.push_str("\nViolations:\n");
    for v in inputs.policy_violations {
        prompt.push_str(&format!("  - {v}\n"));
    }
    prompt.push_str("\nAll changed files:\n");
    for f in inputs.changed_files {
        prompt.push_str(&format!("  - {f}\n"));
    }
    if !inputs.concurrent_tasks.is_empty() {
        prompt.push_str(
            "\nConcurrent tasks (do NOT allow paths that belong to another task's area):\n",
        );
        for t in inputs.concurrent_tasks.iter().take(10) {
            prompt.push_str(&format!(
                "  - {} [{}] {} (allowed: {})\n",
                t.id,
                t.status,
                t.title,
                t.allowed_paths.join(", ")
            ));
        }
    }
    prompt.push_str(
        "\nRespond with JSON only:\n\
         {\"decisions\": [{\"path\": \"<violating path>\", \"action\": \"allow|discard|deny\", \
         \"reason\": \"...\"}], \"summary\": \"...\", \"confidence\": 0.0}\n",
    );
    prompt
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Collect JSON candidates from free-form model output: fenced code
/// blocks first, then balanced-brace substrings, then the whole text.
pub fn collect_json_candidates(text: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    // Fenced blocks: ```json ... ``` or plain ``` ... ```.
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_open[body_start..];
        if let Some(close) = body.find("```") {
            let candidate = body[..close].trim();
            if !candidate.is_empty() {
                candidates.push(candidate.to_owned());
            }
            rest = &body[close + 3..];
        } else {
            break;
        }
    }

    // Balanced-brace substrings (string-agnostic depth count; models that
    // emit braces inside strings will simply fail the parse and fall
    // through to the next candidate).
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            candidates.push(text[s..=i].to_owned());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    candidates.push(text.trim().to_owned());
    candidates
}

/// Parse the first candidate that deserializes into the expected shape.
fn parse_judge_response(text: &str) -> Option<RawResponse> {
    for candidate in collect_json_candidates(text) {
        if let Ok(parsed) = serde_json::from_str::<RawResponse>(&candidate) {
            return Some(parsed);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

/// Disjoint decision sets after sanitization.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SanitizedDecisions {
    pub allow: Vec<String>,
    pub discard: Vec<String>,
    pub deny: Vec<String>,
    pub dropped: Vec<String>,
}

fn has_glob_metachars(path: &str) -> bool {
    path.chars().any(|c| matches!(c, '*' | '?' | '[' | ']' | '{' | '}'))
}

fn is_relative_and_clean(path: &str) -> bool {
    !path.starts_with('/')
        && !path.starts_with('\\')
        && !(path.len() >= 2 && path.as_bytes()[1] == b':')
        && !path.split('/').any(|seg| seg == "..")
}

fn sanitize_decisions(
    raw: &RawResponse,
    violating_paths: &[String],
    denied: &GlobSet,
) -> SanitizedDecisions {
    // Case-insensitive lookup back to the canonical violating path.
    let canonical: BTreeMap<String, &String> = violating_paths
        .iter()
        .map(|p| (p.to_lowercase(), p))
        .collect();

    let mut out = SanitizedDecisions::default();
    let mut seen: HashSet<String> = HashSet::new();

    for decision in &raw.decisions {
        let path = decision.path.trim();

        if path.is_empty() || !is_relative_and_clean(path) || has_glob_metachars(path) {
            out.dropped.push(decision.path.clone());
            continue;
        }

        let Some(&canonical_path) = canonical.get(&path.to_lowercase()) else {
            out.dropped.push(decision.path.clone());
            continue;
        };

        if !seen.insert(canonical_path.clone()) {
            // First decision per path wins.
            continue;
        }

        match decision.action.trim().to_lowercase().as_str() {
            "allow" => {
                if denied.is_match(canonical_path.as_str()) {
                    // Allowing a platform-denied path is never accepted.
                    out.deny.push(canonical_path.clone());
                } else {
                    out.allow.push(canonical_path.clone());
                }
            }
            "discard" => out.discard.push(canonical_path.clone()),
            "deny" => out.deny.push(canonical_path.clone()),
            _ => out.dropped.push(decision.path.clone()),
        }
    }

    out
}
