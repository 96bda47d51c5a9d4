//! Structured log sink with a per-task secondary output.
//!
//! One tracing subscriber, two file outputs: the process-wide log and an
//! optional per-task log that the worker switches on task boundaries. The
//! sink implements `MakeWriter` so it plugs straight into
//! `tracing_subscriber::fmt`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use tracing_subscriber::fmt::MakeWriter;
use uuid::Uuid;

struct SinkState {
    process: Mutex<File>,
    task: RwLock<Option<File>>,
}

/// Tee sink: every log line goes to the process log, and to the per-task
/// log when one is active.
#[derive(Clone)]
pub struct TeeSink {
    state: Arc<SinkState>,
}

impl TeeSink {
    /// Open (append) the process-wide log file, creating parent directories.
    pub fn new(process_log_path: &Path) -> Result<Self> {
        if let Some(parent) = process_log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(process_log_path)
            .with_context(|| {
                format!("failed to open process log {}", process_log_path.display())
            })?;

        Ok(Self {
            state: Arc::new(SinkState {
                process: Mutex::new(file),
                task: RwLock::new(None),
            }),
        })
    }

    /// Switch the per-task output. `None` detaches the current task log.
    pub fn switch_task_log(&self, path: Option<&Path>) -> Result<()> {
        let file = match path {
            Some(p) => {
                if let Some(parent) = p.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create task log dir {}", parent.display())
                    })?;
                }
                Some(
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(p)
                        .with_context(|| format!("failed to open task log {}", p.display()))?,
                )
            }
            None => None,
        };

        let mut guard = self
            .state
            .task
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = file;
        Ok(())
    }
}

/// Conventional per-run log path:
/// `<log_dir>/tasks/<task_id>/<agent_id>-<run_id>.log`.
pub fn task_log_path(log_dir: &Path, task_id: Uuid, agent_id: &str, run_id: Uuid) -> PathBuf {
    log_dir
        .join("tasks")
        .join(task_id.to_string())
        .join(format!("{agent_id}-{run_id}.log"))
}

/// Writer handed to the subscriber for each event.
pub struct TeeWriter {
    state: Arc<SinkState>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut process = self
                .state
                .process
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            process.write_all(buf)?;
        }
        let guard = self
            .state
            .task
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(ref file) = *guard {
            // Per-task output is best-effort; the process log already has
            // the line.
            let _ = (&*file).write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut process = self
            .state
            .process
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        process.flush()
    }
}

impl<'a> MakeWriter<'a> for TeeSink {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            state: Arc::clone(&self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_go_to_process_log() {
        let dir = tempfile::tempdir().unwrap();
        let process_log = dir.path().join("worker.log");
        let sink = TeeSink::new(&process_log).unwrap();

        let mut writer = sink.make_writer();
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();

        let contents = std::fs::read_to_string(&process_log).unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[test]
    fn task_log_receives_lines_only_while_attached() {
        let dir = tempfile::tempdir().unwrap();
        let process_log = dir.path().join("worker.log");
        let task_log = dir.path().join("task.log");
        let sink = TeeSink::new(&process_log).unwrap();

        sink.make_writer().write_all(b"before\n").unwrap();

        sink.switch_task_log(Some(&task_log)).unwrap();
        sink.make_writer().write_all(b"during\n").unwrap();

        sink.switch_task_log(None).unwrap();
        sink.make_writer().write_all(b"after\n").unwrap();

        let process = std::fs::read_to_string(&process_log).unwrap();
        assert_eq!(process, "before\nduring\nafter\n");

        let task = std::fs::read_to_string(&task_log).unwrap();
        assert_eq!(task, "during\n");
    }

    #[test]
    fn task_log_path_layout() {
        let task_id = Uuid::nil();
        let run_id = Uuid::nil();
        let path = task_log_path(Path::new("/logs"), task_id, "agent-1", run_id);
        assert_eq!(
            path,
            PathBuf::from(format!("/logs/tasks/{task_id}/agent-1-{run_id}.log"))
        );
    }
}
