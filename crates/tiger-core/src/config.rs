//! Worker configuration from environment variables.
//!
//! Every knob has a documented default and can be overridden per process.

use std::env;
use std::path::PathBuf;

/// Grace period the hard timeout guard adds on top of the executor's soft
/// timeout before fabricating a failure.
pub const HARD_TIMEOUT_GRACE_SECONDS: u64 = 30;

/// Fixed wall-time limit for a single verification command.
pub const VERIFY_COMMAND_TIMEOUT_SECONDS: u64 = 300;

/// Window after lease acquisition in which a contended runtime lock is
/// treated as a duplicate delivery and skipped silently.
pub const LOCK_CONTENTION_WINDOW_SECONDS: i64 = 120;

/// Runtime configuration for a worker agent process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Attempt budget for no-change recovery (`WORKER_NO_CHANGE_RECOVERY_ATTEMPTS`).
    pub no_change_recovery_attempts: u32,
    /// Attempt budget for policy-violation recovery (`WORKER_POLICY_RECOVERY_ATTEMPTS`).
    pub policy_recovery_attempts: u32,
    /// Attempt budget for verify recovery (`WORKER_VERIFY_RECOVERY_ATTEMPTS`).
    pub verify_recovery_attempts: u32,
    /// Whether policy recovery may consult the LLM judge
    /// (`WORKER_POLICY_RECOVERY_USE_LLM`).
    pub policy_recovery_use_llm: bool,
    /// Whether the verification engine may invoke the inline LLM recovery
    /// handler mid-pass (`WORKER_VERIFY_LLM_INLINE_RECOVERY`).
    pub verify_llm_inline_recovery: bool,
    /// Whether a doom-loop failure triggers an immediate reduced-timeout
    /// retry (`WORKER_IMMEDIATE_DOOM_RECOVERY`).
    pub immediate_doom_recovery: bool,
    /// Whether a no-diff success must be confirmed by the verification
    /// fallback pass (`WORKER_NO_CHANGE_CONFIRM_MODE`).
    pub no_change_confirm_mode: bool,
    /// Log directory (`OPENTIGER_LOG_DIR`).
    pub log_dir: PathBuf,
    /// Runtime lock directory (`OPENTIGER_TASK_LOCK_DIR`).
    pub lock_dir: PathBuf,
    /// Cap applied to the per-task soft timeout in seconds
    /// (`OPENCODE_TASK_TIMEOUT_CAP_SECONDS`).
    pub task_timeout_cap_seconds: u64,
    /// Reduced timeout used for doom-loop and verify recovery executions
    /// (`OPENCODE_RECOVERY_TIMEOUT_SECONDS`).
    pub recovery_timeout_seconds: u64,
    /// Timeout for the policy recovery judge invocation
    /// (`WORKER_POLICY_RECOVERY_TIMEOUT_SECONDS`).
    pub policy_recovery_timeout_seconds: u64,
    /// Model override for the policy recovery judge
    /// (`WORKER_POLICY_RECOVERY_MODEL`); falls back to the smallest model
    /// the executor knows.
    pub policy_recovery_model: Option<String>,
    /// Platform-wide denied path globs (`WORKER_DENIED_PATHS`,
    /// comma-separated).
    pub denied_paths: Vec<String>,
    /// Platform-wide denied command patterns (`WORKER_DENIED_COMMANDS`,
    /// comma-separated; each entry is a regex, or a substring when it does
    /// not parse as one).
    pub denied_commands: Vec<String>,
    /// Exempt lockfiles from path policy (`WORKER_ALLOW_LOCKFILE_OUTSIDE_PATHS`).
    pub allow_lockfile_outside_paths: bool,
    /// Exempt `.env.example` from path policy
    /// (`WORKER_ALLOW_ENV_EXAMPLE_OUTSIDE_PATHS`).
    pub allow_env_example_outside_paths: bool,
    /// Whether verify recovery may retry `explicit` commands
    /// (`WORKER_ALLOW_EXPLICIT_VERIFY_RECOVERY`).
    pub allow_explicit_verify_recovery: bool,
    /// Agent heartbeat interval in seconds (`WORKER_HEARTBEAT_INTERVAL_SECONDS`).
    pub heartbeat_interval_seconds: u64,
    /// Visual probes as `(id, glob)` pairs (`WORKER_VISUAL_PROBES`,
    /// comma-separated `id=glob` entries).
    pub visual_probes: Vec<(String, String)>,
}

impl WorkerConfig {
    /// Build a config from the environment, applying documented defaults.
    pub fn from_env() -> Self {
        let data_dir = default_data_dir();
        Self {
            no_change_recovery_attempts: env_u32("WORKER_NO_CHANGE_RECOVERY_ATTEMPTS", 5),
            policy_recovery_attempts: env_u32("WORKER_POLICY_RECOVERY_ATTEMPTS", 5),
            verify_recovery_attempts: env_u32("WORKER_VERIFY_RECOVERY_ATTEMPTS", 5),
            policy_recovery_use_llm: env_bool("WORKER_POLICY_RECOVERY_USE_LLM", true),
            verify_llm_inline_recovery: env_bool("WORKER_VERIFY_LLM_INLINE_RECOVERY", false),
            immediate_doom_recovery: env_bool("WORKER_IMMEDIATE_DOOM_RECOVERY", true),
            no_change_confirm_mode: env_bool("WORKER_NO_CHANGE_CONFIRM_MODE", false),
            log_dir: env_path("OPENTIGER_LOG_DIR", data_dir.join("logs")),
            lock_dir: env_path("OPENTIGER_TASK_LOCK_DIR", data_dir.join("locks")),
            task_timeout_cap_seconds: env_u64("OPENCODE_TASK_TIMEOUT_CAP_SECONDS", 1800),
            recovery_timeout_seconds: env_u64("OPENCODE_RECOVERY_TIMEOUT_SECONDS", 420),
            policy_recovery_timeout_seconds: env_u64("WORKER_POLICY_RECOVERY_TIMEOUT_SECONDS", 90),
            policy_recovery_model: env::var("WORKER_POLICY_RECOVERY_MODEL").ok(),
            denied_paths: env_list("WORKER_DENIED_PATHS"),
            denied_commands: env_list("WORKER_DENIED_COMMANDS"),
            allow_lockfile_outside_paths: env_bool("WORKER_ALLOW_LOCKFILE_OUTSIDE_PATHS", true),
            allow_env_example_outside_paths: env_bool(
                "WORKER_ALLOW_ENV_EXAMPLE_OUTSIDE_PATHS",
                true,
            ),
            allow_explicit_verify_recovery: env_bool("WORKER_ALLOW_EXPLICIT_VERIFY_RECOVERY", true),
            heartbeat_interval_seconds: env_u64("WORKER_HEARTBEAT_INTERVAL_SECONDS", 30),
            visual_probes: parse_visual_probes(
                &env::var("WORKER_VISUAL_PROBES").unwrap_or_default(),
            ),
        }
    }

    /// Clamp a task timebox to the executor soft-timeout range.
    ///
    /// `timebox_minutes * 60` clamped to `[60, cap]`.
    pub fn clamp_timebox_seconds(&self, timebox_minutes: i32) -> u64 {
        let raw = i64::from(timebox_minutes).max(0) as u64 * 60;
        raw.clamp(60, self.task_timeout_cap_seconds)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_data_dir() -> PathBuf {
    env::var_os("HOME")
        .map(|h| PathBuf::from(h).join(".local/share/tiger"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/tiger"))
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env::var_os(key).map(PathBuf::from).unwrap_or(default)
}

/// Parse `id=glob` entries from a comma-separated list. Entries without
/// an `=` are skipped.
pub fn parse_visual_probes(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (id, glob) = entry.split_once('=')?;
            let id = id.trim();
            let glob = glob.trim();
            if id.is_empty() || glob.is_empty() {
                None
            } else {
                Some((id.to_owned(), glob.to_owned()))
            }
        })
        .collect()
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timebox_clamped_to_floor() {
        let mut cfg = test_config();
        cfg.task_timeout_cap_seconds = 1800;
        assert_eq!(cfg.clamp_timebox_seconds(0), 60);
        assert_eq!(cfg.clamp_timebox_seconds(-5), 60);
    }

    #[test]
    fn timebox_clamped_to_cap() {
        let mut cfg = test_config();
        cfg.task_timeout_cap_seconds = 1800;
        assert_eq!(cfg.clamp_timebox_seconds(60), 1800);
        assert_eq!(cfg.clamp_timebox_seconds(1_000_000), 1800);
    }

    #[test]
    fn timebox_in_range_passes_through() {
        let cfg = test_config();
        assert_eq!(cfg.clamp_timebox_seconds(10), 600);
        assert_eq!(cfg.clamp_timebox_seconds(1), 60);
    }

    #[test]
    fn visual_probe_entries_parse() {
        let probes = parse_visual_probes("render=shots/**/*.png, ui = screens/*.png");
        assert_eq!(
            probes,
            vec![
                ("render".to_owned(), "shots/**/*.png".to_owned()),
                ("ui".to_owned(), "screens/*.png".to_owned()),
            ]
        );
    }

    #[test]
    fn malformed_probe_entries_are_skipped() {
        assert!(parse_visual_probes("").is_empty());
        assert!(parse_visual_probes("no-equals,=glob,id=").is_empty());
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
            log_dir: PathBuf::from("/tmp/tiger-logs"),
            lock_dir: PathBuf::from("/tmp/tiger-locks"),
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
}
