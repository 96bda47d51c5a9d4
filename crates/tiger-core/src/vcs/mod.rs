//! Version-control capability surface.
//!
//! The worker consumes git through the [`Vcs`] trait so the pipeline and
//! recovery layers can be tested against fakes. [`GitCli`] is the
//! production implementation, shelling out to `git` (and `gh` for PRs)
//! with captured output.

pub mod snapshot;

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// A successful output with no captured text (for no-op paths).
    pub fn ok() -> Self {
        Self {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Result of creating a pull request.
#[derive(Debug, Clone)]
pub struct PrCreated {
    pub number: Option<i64>,
    pub url: Option<String>,
    pub output: GitOutput,
}

/// Version-control capabilities the worker runtime consumes.
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        branch: &str,
        depth: Option<u32>,
    ) -> Result<GitOutput>;

    async fn init_repo(&self, repo: &Path) -> Result<GitOutput>;

    /// Create an empty initial commit when the repository has no HEAD yet.
    async fn ensure_initial_commit(&self, repo: &Path) -> Result<GitOutput>;

    /// Create the branch if it does not exist; leave it alone if it does.
    async fn ensure_branch_exists(&self, repo: &Path, branch: &str) -> Result<GitOutput>;

    async fn fetch_latest(&self, repo: &Path) -> Result<GitOutput>;

    async fn fetch_refspecs(&self, repo: &Path, refspecs: &[String]) -> Result<GitOutput>;

    async fn add_worktree(&self, repo: &Path, worktree: &Path, branch: &str) -> Result<GitOutput>;

    async fn remove_worktree(&self, repo: &Path, worktree: &Path) -> Result<GitOutput>;

    async fn create_branch(&self, repo: &Path, branch: &str) -> Result<GitOutput>;

    async fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<GitOutput>;

    /// The currently checked-out branch, or `None` on detached HEAD.
    async fn current_branch(&self, repo: &Path) -> Result<Option<String>>;

    async fn reset_hard(&self, repo: &Path, target: &str) -> Result<GitOutput>;

    async fn clean_untracked(&self, repo: &Path) -> Result<GitOutput>;

    /// Drop working-copy changes for specific paths: tracked files are
    /// checked out from HEAD, untracked files are removed.
    async fn discard_changes_for_paths(&self, repo: &Path, paths: &[String]) -> Result<GitOutput>;

    async fn untracked_files(&self, repo: &Path) -> Result<Vec<String>>;

    async fn check_ignored(&self, repo: &Path, path: &str) -> Result<bool>;

    /// Changed paths relative to `base`: committed diff plus working-tree
    /// modifications and untracked files, deduplicated and sorted.
    async fn changed_files(&self, repo: &Path, base: &str) -> Result<Vec<String>>;

    async fn commit_and_push(
        &self,
        repo: &Path,
        message: &str,
        branch: &str,
        push: bool,
    ) -> Result<GitOutput>;

    async fn ensure_remote_base_branch(&self, repo: &Path, base: &str) -> Result<GitOutput>;

    async fn create_task_pr(
        &self,
        repo: &Path,
        title: &str,
        body: &str,
        base: &str,
        head: &str,
    ) -> Result<PrCreated>;
}

// ---------------------------------------------------------------------------
// GitCli
// ---------------------------------------------------------------------------

/// Production [`Vcs`] implementation shelling out to `git` and `gh`.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_bin: String,
    gh_bin: String,
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            git_bin: "git".to_owned(),
            gh_bin: "gh".to_owned(),
        }
    }

    /// Override the binaries (tests point these at stub scripts).
    pub fn with_binaries(git_bin: impl Into<String>, gh_bin: impl Into<String>) -> Self {
        Self {
            git_bin: git_bin.into(),
            gh_bin: gh_bin.into(),
        }
    }

    async fn run(&self, repo: Option<&Path>, args: &[&str]) -> Result<GitOutput> {
        run_captured(&self.git_bin, repo, args).await
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_captured(bin: &str, cwd: Option<&Path>, args: &[&str]) -> Result<GitOutput> {
    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to run {} {}", bin, args.join(" ")))?;

    let result = GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if !result.success {
        debug!(
            bin,
            args = %args.join(" "),
            stderr = %result.stderr.trim(),
            "command exited non-zero"
        );
    }

    Ok(result)
}

#[async_trait]
impl Vcs for GitCli {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        branch: &str,
        depth: Option<u32>,
    ) -> Result<GitOutput> {
        let dest_str = dest.to_string_lossy().into_owned();
        let depth_str;
        let mut args = vec!["clone", "--branch", branch];
        if let Some(d) = depth {
            depth_str = d.to_string();
            args.push("--depth");
            args.push(&depth_str);
        }
        args.push(url);
        args.push(&dest_str);
        self.run(None, &args).await
    }

    async fn init_repo(&self, repo: &Path) -> Result<GitOutput> {
        std::fs::create_dir_all(repo)
            .with_context(|| format!("failed to create {}", repo.display()))?;
        self.run(Some(repo), &["init"]).await
    }

    async fn ensure_initial_commit(&self, repo: &Path) -> Result<GitOutput> {
        let head = self.run(Some(repo), &["rev-parse", "--verify", "HEAD"]).await?;
        if head.success {
            return Ok(GitOutput::ok());
        }
        self.run(
            Some(repo),
            &["commit", "--allow-empty", "-m", "initial commit"],
        )
        .await
    }

    async fn ensure_branch_exists(&self, repo: &Path, branch: &str) -> Result<GitOutput> {
        let verify = self
            .run(
                Some(repo),
                &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
            )
            .await?;
        if verify.success {
            return Ok(GitOutput::ok());
        }
        self.run(Some(repo), &["branch", branch]).await
    }

    async fn fetch_latest(&self, repo: &Path) -> Result<GitOutput> {
        self.run(Some(repo), &["fetch", "--all", "--prune"]).await
    }

    async fn fetch_refspecs(&self, repo: &Path, refspecs: &[String]) -> Result<GitOutput> {
        let mut args = vec!["fetch", "origin"];
        for spec in refspecs {
            args.push(spec);
        }
        self.run(Some(repo), &args).await
    }

    async fn add_worktree(&self, repo: &Path, worktree: &Path, branch: &str) -> Result<GitOutput> {
        let wt = worktree.to_string_lossy().into_owned();
        self.run(Some(repo), &["worktree", "add", "-B", branch, &wt])
            .await
    }

    async fn remove_worktree(&self, repo: &Path, worktree: &Path) -> Result<GitOutput> {
        let wt = worktree.to_string_lossy().into_owned();
        let removed = self
            .run(Some(repo), &["worktree", "remove", "--force", &wt])
            .await?;
        // Prune bookkeeping for worktrees that were deleted out from under
        // git.
        let _ = self.run(Some(repo), &["worktree", "prune"]).await;
        Ok(removed)
    }

    async fn create_branch(&self, repo: &Path, branch: &str) -> Result<GitOutput> {
        self.run(Some(repo), &["checkout", "-b", branch]).await
    }

    async fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<GitOutput> {
        self.run(Some(repo), &["checkout", branch]).await
    }

    async fn current_branch(&self, repo: &Path) -> Result<Option<String>> {
        let output = self
            .run(Some(repo), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        if !output.success {
            return Ok(None);
        }
        let name = output.stdout.trim();
        if name.is_empty() || name == "HEAD" {
            Ok(None)
        } else {
            Ok(Some(name.to_owned()))
        }
    }

    async fn reset_hard(&self, repo: &Path, target: &str) -> Result<GitOutput> {
        self.run(Some(repo), &["reset", "--hard", target]).await
    }

    async fn clean_untracked(&self, repo: &Path) -> Result<GitOutput> {
        self.run(Some(repo), &["clean", "-fd"]).await
    }

    async fn discard_changes_for_paths(&self, repo: &Path, paths: &[String]) -> Result<GitOutput> {
        if paths.is_empty() {
            return Ok(GitOutput::ok());
        }

        let untracked: BTreeSet<String> = self.untracked_files(repo).await?.into_iter().collect();

        let mut tracked_paths = Vec::new();
        for path in paths {
            if untracked.contains(path) {
                let abs = repo.join(path);
                if let Err(e) = std::fs::remove_file(&abs) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        anyhow::bail!("failed to remove untracked {}: {e}", abs.display());
                    }
                }
            } else {
                tracked_paths.push(path.as_str());
            }
        }

        if tracked_paths.is_empty() {
            return Ok(GitOutput::ok());
        }

        let mut args = vec!["checkout", "--"];
        args.extend(tracked_paths);
        self.run(Some(repo), &args).await
    }

    async fn untracked_files(&self, repo: &Path) -> Result<Vec<String>> {
        let output = self
            .run(
                Some(repo),
                &["ls-files", "--others", "--exclude-standard"],
            )
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    async fn check_ignored(&self, repo: &Path, path: &str) -> Result<bool> {
        let output = self.run(Some(repo), &["check-ignore", "-q", path]).await?;
        Ok(output.success)
    }

    async fn changed_files(&self, repo: &Path, base: &str) -> Result<Vec<String>> {
        let mut changed: BTreeSet<String> = BTreeSet::new();

        let committed = self
            .run(Some(repo), &["diff", "--name-only", &format!("{base}...HEAD")])
            .await?;
        if committed.success {
            changed.extend(
                committed
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_owned),
            );
        }

        // Working-tree modifications plus untracked files.
        let status = self.run(Some(repo), &["status", "--porcelain"]).await?;
        for line in status.stdout.lines() {
            if line.len() <= 3 {
                continue;
            }
            let path = line[3..].trim();
            // Renames are reported as "old -> new"; keep the new path.
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            if !path.is_empty() {
                changed.insert(path.to_owned());
            }
        }

        Ok(changed.into_iter().collect())
    }

    async fn commit_and_push(
        &self,
        repo: &Path,
        message: &str,
        branch: &str,
        push: bool,
    ) -> Result<GitOutput> {
        let add = self.run(Some(repo), &["add", "-A"]).await?;
        if !add.success {
            return Ok(add);
        }

        let status = self.run(Some(repo), &["status", "--porcelain"]).await?;
        if status.stdout.trim().is_empty() {
            return Ok(GitOutput::ok());
        }

        let commit = self
            .run(Some(repo), &["commit", "--signoff", "-m", message])
            .await?;
        if !commit.success || !push {
            return Ok(commit);
        }

        self.run(Some(repo), &["push", "-u", "origin", branch]).await
    }

    async fn ensure_remote_base_branch(&self, repo: &Path, base: &str) -> Result<GitOutput> {
        let exists = self
            .run(
                Some(repo),
                &["ls-remote", "--exit-code", "--heads", "origin", base],
            )
            .await?;
        if exists.success {
            return Ok(GitOutput::ok());
        }
        self.run(
            Some(repo),
            &["push", "origin", &format!("HEAD:refs/heads/{base}")],
        )
        .await
    }

    async fn create_task_pr(
        &self,
        repo: &Path,
        title: &str,
        body: &str,
        base: &str,
        head: &str,
    ) -> Result<PrCreated> {
        let output = run_captured(
            &self.gh_bin,
            Some(repo),
            &[
                "pr", "create", "--title", title, "--body", body, "--base", base, "--head", head,
            ],
        )
        .await?;

        let url = output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("https://"))
            .map(str::to_owned);
        let number = url
            .as_deref()
            .and_then(|u| u.rsplit('/').next())
            .and_then(|n| n.parse().ok());

        Ok(PrCreated {
            number,
            url,
            output,
        })
    }
}
