//! Environment composition for the executor subprocess.
//!
//! The executor must never see the worker's control-plane variables
//! (database URL, queue URL, agent/task identity, log paths). The composed
//! environment is built as a plain value and handed to the subprocess with
//! `env_clear()`; nothing is inherited implicitly.
//!
//! Layering, last writer wins:
//! 1. parent process environment, minus stripped prefixes and the denylist
//! 2. the repository's `.env` file, minus protected OS keys
//! 3. executor-relevant values from the persisted config table

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

/// Prefixes stripped from the parent environment.
pub const DEFAULT_STRIP_PREFIXES: &[&str] = &["OPENTIGER_", "TIGER_", "WORKER_"];

/// Explicit keys stripped from the parent environment regardless of prefix.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "OPENTIGER_DATABASE_URL",
    "OPENTIGER_QUEUE_URL",
    "TIGER_AGENT_ID",
    "TIGER_WORKSPACE_DIR",
    "TIGER_TASK_ID",
    "OPENTIGER_LOG_DIR",
];

/// OS keys a repository `.env` file may not override.
pub const PROTECTED_OS_KEYS: &[&str] = &[
    "PATH", "HOME", "SHELL", "LANG", "TERM", "TMPDIR", "USER", "LOGNAME",
];

/// Config-table keys the composer overlays when present (API keys, model
/// names, executor tokens).
pub const EXECUTOR_CONFIG_KEYS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GEMINI_API_KEY",
    "OPENCODE_API_KEY",
    "OPENCODE_MODEL",
    "OPENCODE_SMALL_MODEL",
    "GITHUB_TOKEN",
];

/// Rules applied during composition.
#[derive(Debug, Clone)]
pub struct EnvComposeOptions {
    pub strip_prefixes: Vec<String>,
    pub denylist: Vec<String>,
}

impl Default for EnvComposeOptions {
    fn default() -> Self {
        Self {
            strip_prefixes: DEFAULT_STRIP_PREFIXES.iter().map(|s| (*s).to_owned()).collect(),
            denylist: DEFAULT_DENYLIST.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

/// Compose the flat environment map for the executor subprocess.
///
/// `config_overlay` holds the already-fetched config-table values; they take
/// precedence over everything else.
pub fn compose_environment(
    parent: &HashMap<String, String>,
    repo_dir: &Path,
    config_overlay: &HashMap<String, String>,
    opts: &EnvComposeOptions,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = parent
        .iter()
        .filter(|(key, _)| {
            !opts.strip_prefixes.iter().any(|p| key.starts_with(p.as_str()))
                && !opts.denylist.iter().any(|d| d == *key)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    // Repo-local .env overlay.
    let dotenv_path = repo_dir.join(".env");
    if dotenv_path.is_file() {
        match dotenvy::from_path_iter(&dotenv_path) {
            Ok(iter) => {
                for item in iter {
                    match item {
                        Ok((key, value)) => {
                            if PROTECTED_OS_KEYS.contains(&key.as_str()) {
                                debug!(key = %key, "ignoring protected key in .env");
                                continue;
                            }
                            env.insert(key, value);
                        }
                        Err(e) => {
                            debug!(error = %e, "skipping malformed .env line");
                        }
                    }
                }
            }
            Err(e) => {
                debug!(path = %dotenv_path.display(), error = %e, "failed to read .env");
            }
        }
    }

    // Persisted config wins over both parent and .env.
    for (key, value) in config_overlay {
        env.insert(key.clone(), value.clone());
    }

    env
}

/// Snapshot the current process environment into a map.
pub fn parent_environment() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent_with(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn strips_prefixed_and_denylisted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let parent = parent_with(&[
            ("PATH", "/usr/bin"),
            ("OPENTIGER_DATABASE_URL", "postgresql://secret"),
            ("TIGER_AGENT_ID", "agent-1"),
            ("WORKER_POLICY_RECOVERY_ATTEMPTS", "5"),
            ("EDITOR", "vi"),
        ]);

        let env = compose_environment(
            &parent,
            dir.path(),
            &HashMap::new(),
            &EnvComposeOptions::default(),
        );

        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("EDITOR").map(String::as_str), Some("vi"));
        assert!(!env.contains_key("OPENTIGER_DATABASE_URL"));
        assert!(!env.contains_key("TIGER_AGENT_ID"));
        assert!(!env.contains_key("WORKER_POLICY_RECOVERY_ATTEMPTS"));
    }

    #[test]
    fn dotenv_overlays_parent_but_not_protected_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "API_BASE=https://example.test\nPATH=/evil\nHOME=/evil\n",
        )
        .unwrap();

        let parent = parent_with(&[("PATH", "/usr/bin"), ("HOME", "/home/me")]);
        let env = compose_environment(
            &parent,
            dir.path(),
            &HashMap::new(),
            &EnvComposeOptions::default(),
        );

        assert_eq!(
            env.get("API_BASE").map(String::as_str),
            Some("https://example.test")
        );
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/home/me"));
    }

    #[test]
    fn config_overlay_wins_over_parent_and_dotenv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "OPENCODE_MODEL=from-dotenv\n").unwrap();

        let parent = parent_with(&[("OPENCODE_MODEL", "from-parent")]);
        let overlay = parent_with(&[("OPENCODE_MODEL", "from-config")]);

        let env = compose_environment(
            &parent,
            dir.path(),
            &overlay,
            &EnvComposeOptions::default(),
        );

        assert_eq!(
            env.get("OPENCODE_MODEL").map(String::as_str),
            Some("from-config")
        );
    }

    #[test]
    fn missing_dotenv_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let parent = parent_with(&[("EDITOR", "vi")]);
        let env = compose_environment(
            &parent,
            dir.path(),
            &HashMap::new(),
            &EnvComposeOptions::default(),
        );
        assert_eq!(env.len(), 1);
    }
}
