//! Opencode CLI adapter.
//!
//! Spawns `opencode run <prompt>` with a cleared environment and captures
//! its output. The soft timeout is enforced here; the driver's hard
//! timeout guard sits above this adapter.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Executor, ExecutorOutcome, ExecutorRequest};

/// Adapter for the `opencode` binary.
#[derive(Debug, Clone)]
pub struct OpencodeCli {
    binary_path: String,
    smallest_model: Option<String>,
}

impl OpencodeCli {
    /// Create an adapter that looks for `opencode` on `$PATH`.
    pub fn new() -> Self {
        Self {
            binary_path: "opencode".to_owned(),
            smallest_model: None,
        }
    }

    /// Create an adapter with a custom binary path (tests point this at a
    /// shell script).
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            smallest_model: None,
        }
    }

    /// Set the smallest model advertised to the judge.
    pub fn with_smallest_model(mut self, model: impl Into<String>) -> Self {
        self.smallest_model = Some(model.into());
        self
    }

    async fn run_once(&self, req: &ExecutorRequest) -> Result<ExecutorOutcome> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("run");
        if let Some(ref model) = req.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(ref instructions) = req.instructions_path {
            cmd.arg("--instructions").arg(instructions);
        }
        cmd.arg(&req.prompt);

        cmd.current_dir(&req.workdir)
            .env_clear()
            .envs(&req.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn executor binary at '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        // Read both pipes while waiting so a chatty executor cannot fill
        // the pipe buffer and deadlock.
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

        let timeout = Duration::from_secs(req.timeout_seconds.max(1));
        match tokio::time::timeout(timeout, async {
            let (wait, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
            (wait, stdout, stderr)
        })
        .await
        {
            Ok((Ok(status), stdout, stderr)) => {
                let exit_code = status.code().unwrap_or(-1);
                Ok(ExecutorOutcome {
                    success: status.success(),
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms: elapsed_ms(start),
                    retry_count: 0,
                    token_usage: None,
                })
            }
            Ok((Err(e), _, _)) => {
                Err(e).context("failed to wait on executor subprocess")
            }
            Err(_elapsed) => {
                warn!(
                    timeout_seconds = req.timeout_seconds,
                    "executor exceeded soft timeout, killing"
                );
                let _ = child.kill().await;
                Ok(ExecutorOutcome {
                    success: false,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!(
                        "executor timed out after {}s (soft timeout)",
                        req.timeout_seconds
                    ),
                    duration_ms: elapsed_ms(start),
                    retry_count: 0,
                    token_usage: None,
                })
            }
        }
    }
}

impl Default for OpencodeCli {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl Executor for OpencodeCli {
    fn name(&self) -> &str {
        "opencode"
    }

    async fn run(&self, req: &ExecutorRequest) -> Result<ExecutorOutcome> {
        let mut last = self.run_once(req).await?;
        let mut retries = 0;

        while !last.success && retries < req.max_retries {
            retries += 1;
            debug!(retry = retries, "retrying executor run");
            last = self.run_once(req).await?;
        }

        last.retry_count = retries;
        Ok(last)
    }

    fn smallest_model(&self) -> Option<String> {
        self.smallest_model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn request(workdir: &Path, timeout: u64) -> ExecutorRequest {
        ExecutorRequest {
            workdir: workdir.to_path_buf(),
            instructions_path: None,
            prompt: "do the thing".to_owned(),
            model: None,
            timeout_seconds: timeout,
            env: HashMap::from([("MARKER".to_owned(), "from-env".to_owned())]),
            max_retries: 0,
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fake.sh", "#!/bin/sh\necho worked\n");

        let exec = OpencodeCli::with_binary(script.to_str().unwrap());
        let outcome = exec.run(&request(tmp.path(), 10)).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("worked"));
    }

    #[tokio::test]
    async fn env_is_cleared_except_request_env() {
        let tmp = tempfile::tempdir().unwrap();
        // Print the injected marker and the (stripped) HOME.
        let script = write_script(
            tmp.path(),
            "env.sh",
            "#!/bin/sh\necho \"marker=$MARKER home=$HOME\"\n",
        );

        let exec = OpencodeCli::with_binary(script.to_str().unwrap());
        let outcome = exec.run(&request(tmp.path(), 10)).await.unwrap();

        assert!(outcome.stdout.contains("marker=from-env"));
        assert!(
            outcome.stdout.trim().ends_with("home="),
            "HOME should be empty: {}",
            outcome.stdout
        );
    }

    #[tokio::test]
    async fn soft_timeout_kills_and_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "slow.sh", "#!/bin/sh\nsleep 60\n");

        let exec = OpencodeCli::with_binary(script.to_str().unwrap());
        let start = std::time::Instant::now();
        let outcome = exec.run(&request(tmp.path(), 1)).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.stderr.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn retries_are_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fail.sh", "#!/bin/sh\nexit 1\n");

        let exec = OpencodeCli::with_binary(script.to_str().unwrap());
        let mut req = request(tmp.path(), 10);
        req.max_retries = 2;
        let outcome = exec.run(&req).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.retry_count, 2);
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = OpencodeCli::with_binary("/nonexistent/opencode");
        let result = exec.run(&request(tmp.path(), 5)).await;
        assert!(result.is_err());
    }
}
