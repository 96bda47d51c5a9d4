//! Repository preparation: materialize a working directory for a task and
//! put it on the right branch.
//!
//! Three modes:
//! - **clone**: shallow clone into `<workspace>/<task_id>`
//! - **worktree**: worktree at `<worktree_root>/<agent_id>/<task_id>` off a
//!   lazily-initialized base repository
//! - **in-place**: use the configured local repository directly, no branch

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tiger_db::models::{PrRef, Task};

use crate::vcs::{GitOutput, Vcs};

/// How the working directory is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMode {
    Clone,
    Worktree,
    InPlace,
}

impl fmt::Display for PrepareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Clone => "clone",
            Self::Worktree => "worktree",
            Self::InPlace => "in-place",
        };
        f.write_str(s)
    }
}

impl FromStr for PrepareMode {
    type Err = PrepareModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clone" => Ok(Self::Clone),
            "worktree" => Ok(Self::Worktree),
            "in-place" | "in_place" => Ok(Self::InPlace),
            other => Err(PrepareModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PrepareMode`] string.
#[derive(Debug, Clone)]
pub struct PrepareModeParseError(pub String);

impl fmt::Display for PrepareModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid prepare mode: {:?}", self.0)
    }
}

impl std::error::Error for PrepareModeParseError {}

/// Static configuration for repository preparation.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub mode: PrepareMode,
    /// Remote URL for clone mode.
    pub repo_url: Option<String>,
    /// Base directory for clone destinations.
    pub workspace_dir: PathBuf,
    /// Base repository for worktree mode (lazily initialized).
    pub base_repo_dir: PathBuf,
    /// Directory under which worktrees are created.
    pub worktree_root: PathBuf,
    /// Repository path for in-place mode.
    pub local_repo_dir: PathBuf,
    pub base_branch: String,
}

/// A materialized working directory.
#[derive(Debug, Clone)]
pub struct PreparedRepo {
    pub path: PathBuf,
    /// The branch the pipeline owns, `None` in in-place mode.
    pub branch: Option<String>,
    pub mode: PrepareMode,
}

/// Build the conventional branch name for an agent/task pair.
///
/// Format: `agent/<agent_id>/<first-8-chars-of-task-id>`. Pure: the same
/// inputs always yield the same string.
pub fn generate_branch_name(agent_id: &str, task_id: Uuid) -> String {
    let simple = task_id.simple().to_string();
    format!("agent/{agent_id}/{}", &simple[..8])
}

/// Whether a git failure looks transient (worth one retry after a backoff).
pub fn is_transient_git_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    ["timed out", "timeout", "connection reset", "could not resolve", "early eof"]
        .iter()
        .any(|marker| lower.contains(marker))
}

const REMOVE_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Prepares working directories for tasks.
pub struct RepoPreparer<'a> {
    vcs: &'a dyn Vcs,
    config: &'a RepoConfig,
}

impl<'a> RepoPreparer<'a> {
    pub fn new(vcs: &'a dyn Vcs, config: &'a RepoConfig) -> Self {
        Self { vcs, config }
    }

    /// Materialize the working directory for a task and check out the
    /// working branch.
    pub async fn prepare(&self, task: &Task, agent_id: &str) -> Result<PreparedRepo> {
        match self.config.mode {
            PrepareMode::Clone => self.prepare_clone(task, agent_id).await,
            PrepareMode::Worktree => self.prepare_worktree(task, agent_id).await,
            PrepareMode::InPlace => Ok(PreparedRepo {
                path: self.config.local_repo_dir.clone(),
                branch: None,
                mode: PrepareMode::InPlace,
            }),
        }
    }

    async fn prepare_clone(&self, task: &Task, agent_id: &str) -> Result<PreparedRepo> {
        let url = self
            .config
            .repo_url
            .as_deref()
            .context("clone mode requires a repo URL")?;

        let dest = self.config.workspace_dir.join(task.id.to_string());
        remove_dir_with_retries(&dest).await?;
        std::fs::create_dir_all(&self.config.workspace_dir).with_context(|| {
            format!(
                "failed to create workspace dir {}",
                self.config.workspace_dir.display()
            )
        })?;

        let clone = self
            .retry_transient(|| {
                self.vcs
                    .clone_repo(url, &dest, &self.config.base_branch, Some(1))
            })
            .await?;
        if !clone.success {
            bail!("clone of {} failed: {}", url, clone.stderr.trim());
        }

        let branch = self.checkout_task_branch(&dest, task, agent_id).await?;

        Ok(PreparedRepo {
            path: dest,
            branch: Some(branch),
            mode: PrepareMode::Clone,
        })
    }

    async fn prepare_worktree(&self, task: &Task, agent_id: &str) -> Result<PreparedRepo> {
        let base = &self.config.base_repo_dir;

        // Lazily initialize the base repository.
        if !base.join(".git").exists() {
            info!(path = %base.display(), "initializing worktree base repository");
            let init = self.vcs.init_repo(base).await?;
            if !init.success {
                bail!("git init failed: {}", init.stderr.trim());
            }
        }
        let initial = self.vcs.ensure_initial_commit(base).await?;
        if !initial.success {
            bail!("initial commit failed: {}", initial.stderr.trim());
        }
        let ensured = self
            .vcs
            .ensure_branch_exists(base, &self.config.base_branch)
            .await?;
        if !ensured.success {
            bail!(
                "could not ensure base branch {}: {}",
                self.config.base_branch,
                ensured.stderr.trim()
            );
        }

        let wt_path = self
            .config
            .worktree_root
            .join(agent_id)
            .join(task.id.to_string());

        // Detach and purge any pre-existing worktree at the path.
        if wt_path.exists() {
            warn!(path = %wt_path.display(), "purging stale worktree");
            let _ = self.vcs.remove_worktree(base, &wt_path).await;
            remove_dir_with_retries(&wt_path).await?;
        }

        let branch = generate_branch_name(agent_id, task.id);
        let added = self.vcs.add_worktree(base, &wt_path, &branch).await?;
        if !added.success {
            bail!("worktree add failed: {}", added.stderr.trim());
        }

        // Carry the base repository's .env into the worktree.
        let env_src = base.join(".env");
        if env_src.is_file() {
            let env_dst = wt_path.join(".env");
            std::fs::copy(&env_src, &env_dst)
                .with_context(|| format!("failed to copy .env to {}", env_dst.display()))?;
        }

        Ok(PreparedRepo {
            path: wt_path,
            branch: Some(branch),
            mode: PrepareMode::Worktree,
        })
    }

    /// Create the fresh task branch, or check out the PR head when the task
    /// carries a PR context.
    async fn checkout_task_branch(
        &self,
        repo: &Path,
        task: &Task,
        agent_id: &str,
    ) -> Result<String> {
        if let Some(PrRef {
            head_ref: Some(head),
            ..
        }) = task.pr_ref()
        {
            let head = head.clone();
            let refspec = format!("{head}:{head}");
            let fetched = self
                .retry_transient(|| self.vcs.fetch_refspecs(repo, std::slice::from_ref(&refspec)))
                .await?;
            if !fetched.success {
                bail!("fetch of PR head {head} failed: {}", fetched.stderr.trim());
            }
            let checked_out = self.vcs.checkout_branch(repo, &head).await?;
            if !checked_out.success {
                bail!(
                    "checkout of PR head {head} failed: {}",
                    checked_out.stderr.trim()
                );
            }
            return Ok(head);
        }

        let branch = generate_branch_name(agent_id, task.id);
        let created = self.vcs.create_branch(repo, &branch).await?;
        if !created.success {
            bail!("branch create failed: {}", created.stderr.trim());
        }
        Ok(branch)
    }

    /// Run a git operation, retrying once after a short backoff when the
    /// failure looks transient.
    async fn retry_transient<F, Fut>(&self, op: F) -> Result<GitOutput>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<GitOutput>>,
    {
        let first = op().await?;
        if first.success || !is_transient_git_error(&first.stderr) {
            return Ok(first);
        }
        debug!(stderr = %first.stderr.trim(), "transient git error, retrying once");
        tokio::time::sleep(RETRY_BACKOFF).await;
        op().await
    }
}

/// Remove a directory tree with bounded retries (NFS and editors keep
/// directories busy for a moment after process exit).
async fn remove_dir_with_retries(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for attempt in 1..=REMOVE_RETRIES {
        match std::fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt < REMOVE_RETRIES => {
                warn!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "failed to remove directory, retrying"
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to remove directory {}", path.display()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_is_pure_and_shaped() {
        let task_id = Uuid::parse_str("a1b2c3d4-0000-0000-0000-000000000000").unwrap();
        let first = generate_branch_name("agent-7", task_id);
        let second = generate_branch_name("agent-7", task_id);
        assert_eq!(first, second);
        assert_eq!(first, "agent/agent-7/a1b2c3d4");
    }

    #[test]
    fn branch_name_uses_first_eight_chars() {
        for _ in 0..16 {
            let task_id = Uuid::new_v4();
            let name = generate_branch_name("a", task_id);
            let suffix = name.rsplit('/').next().unwrap();
            assert_eq!(suffix.len(), 8);
            assert!(task_id.simple().to_string().starts_with(suffix));
        }
    }

    #[test]
    fn transient_errors_are_detected() {
        assert!(is_transient_git_error("fatal: unable to access: Connection timed out"));
        assert!(is_transient_git_error("error: RPC failed; connection reset by peer"));
        assert!(is_transient_git_error("fatal: Could not resolve host: github.com"));
        assert!(!is_transient_git_error("fatal: not a git repository"));
        assert!(!is_transient_git_error(""));
    }

    #[test]
    fn prepare_mode_parse_roundtrip() {
        for mode in [PrepareMode::Clone, PrepareMode::Worktree, PrepareMode::InPlace] {
            let s = mode.to_string();
            let parsed: PrepareMode = s.parse().expect("should parse");
            assert_eq!(mode, parsed);
        }
        assert!("container".parse::<PrepareMode>().is_err());
    }

    #[tokio::test]
    async fn remove_dir_with_retries_handles_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        remove_dir_with_retries(&missing).await.unwrap();
    }

    #[tokio::test]
    async fn remove_dir_with_retries_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("tree");
        std::fs::create_dir_all(target.join("nested")).unwrap();
        std::fs::write(target.join("nested/file.txt"), "x").unwrap();

        remove_dir_with_retries(&target).await.unwrap();
        assert!(!target.exists());
    }
}
