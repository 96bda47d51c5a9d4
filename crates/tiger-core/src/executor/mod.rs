//! Executor port: the adapter interface for the external LLM coding CLI.
//!
//! The worker treats the executor as a subprocess with a documented
//! contract: it runs to completion in a working directory with a composed
//! environment and a soft timeout, and reports captured output plus token
//! usage. The [`driver`] module wraps the port with prompt assembly, the
//! hard timeout guard, the denied-command pre-check, and doom-loop
//! detection.

pub mod driver;
pub mod opencode;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

pub use opencode::OpencodeCli;

/// A single executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutorRequest {
    /// Working directory for the subprocess.
    pub workdir: PathBuf,
    /// Optional instructions file passed through to the executor.
    pub instructions_path: Option<PathBuf>,
    /// The fully assembled prompt.
    pub prompt: String,
    /// Model name; `None` lets the executor pick its default.
    pub model: Option<String>,
    /// Soft timeout in seconds, enforced by the adapter.
    pub timeout_seconds: u64,
    /// Complete environment; the subprocess inherits nothing else.
    pub env: HashMap<String, String>,
    /// Retries the adapter may perform on its own (0 for judge calls).
    pub max_retries: u32,
}

/// Outcome of an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutorOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub retry_count: u32,
    pub token_usage: Option<i64>,
}

impl ExecutorOutcome {
    /// Fabricate a failure outcome without having spawned anything.
    pub fn synthetic_failure(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 0,
            retry_count: 0,
            token_usage: None,
        }
    }
}

/// Adapter interface for the external code-generation CLI.
///
/// Object-safe so the pipeline, recovery, and judge can share one boxed
/// instance.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable adapter name (e.g. "opencode").
    fn name(&self) -> &str;

    /// Run the executor to completion.
    ///
    /// Implementations must spawn with a cleared environment (only
    /// `req.env`), enforce `req.timeout_seconds` themselves, and never
    /// error on non-zero exit -- a failed execution is a normal outcome.
    async fn run(&self, req: &ExecutorRequest) -> Result<ExecutorOutcome>;

    /// Name of the smallest model this executor can run (used by the
    /// policy recovery judge when no override is configured).
    fn smallest_model(&self) -> Option<String> {
        None
    }
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};
