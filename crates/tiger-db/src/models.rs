use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Blocked,
    Failed,
    Done,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Why a task is parked in `blocked` status.
///
/// Non-null iff the task status is `blocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    AwaitingJudge,
    QuotaWait,
    NeedsRework,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingJudge => "awaiting_judge",
            Self::QuotaWait => "quota_wait",
            Self::NeedsRework => "needs_rework",
        };
        f.write_str(s)
    }
}

impl FromStr for BlockReason {
    type Err = BlockReasonParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_judge" => Ok(Self::AwaitingJudge),
            "quota_wait" => Ok(Self::QuotaWait),
            "needs_rework" => Ok(Self::NeedsRework),
            other => Err(BlockReasonParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BlockReason`] string.
#[derive(Debug, Clone)]
pub struct BlockReasonParseError(pub String);

impl fmt::Display for BlockReasonParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid block reason: {:?}", self.0)
    }
}

impl std::error::Error for BlockReasonParseError {}

// ---------------------------------------------------------------------------

/// Status of a single run (one execution attempt of a task by one agent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a long-lived agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Role of a task (and of the agent that executes it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskRole {
    Worker,
    Tester,
    Docser,
}

impl fmt::Display for TaskRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Worker => "worker",
            Self::Tester => "tester",
            Self::Docser => "docser",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskRole {
    type Err = TaskRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Self::Worker),
            "tester" => Ok(Self::Tester),
            "docser" => Ok(Self::Docser),
            other => Err(TaskRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskRole`] string.
#[derive(Debug, Clone)]
pub struct TaskRoleParseError(pub String);

impl fmt::Display for TaskRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task role: {:?}", self.0)
    }
}

impl std::error::Error for TaskRoleParseError {}

// ---------------------------------------------------------------------------

/// Kind of immutable artifact attached to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Branch,
    Worktree,
    Commit,
    Pr,
    DirectEdit,
    CiResult,
    VisualProbe,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Branch => "branch",
            Self::Worktree => "worktree",
            Self::Commit => "commit",
            Self::Pr => "pr",
            Self::DirectEdit => "direct_edit",
            Self::CiResult => "ci_result",
            Self::VisualProbe => "visual_probe",
        };
        f.write_str(s)
    }
}

impl FromStr for ArtifactKind {
    type Err = ArtifactKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch" => Ok(Self::Branch),
            "worktree" => Ok(Self::Worktree),
            "commit" => Ok(Self::Commit),
            "pr" => Ok(Self::Pr),
            "direct_edit" => Ok(Self::DirectEdit),
            "ci_result" => Ok(Self::CiResult),
            "visual_probe" => Ok(Self::VisualProbe),
            other => Err(ArtifactKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ArtifactKind`] string.
#[derive(Debug, Clone)]
pub struct ArtifactKindParseError(pub String);

impl fmt::Display for ArtifactKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid artifact kind: {:?}", self.0)
    }
}

impl std::error::Error for ArtifactKindParseError {}

// ---------------------------------------------------------------------------

/// Classification of a run failure, carried in [`ErrorMeta::failure_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    ExecutionFailed,
    QuotaFailure,
    VerificationCommandFailed,
    PolicyViolation,
    NoActionableChanges,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::QuotaFailure => "QUOTA_FAILURE",
            Self::VerificationCommandFailed => "VERIFICATION_COMMAND_FAILED",
            Self::PolicyViolation => "POLICY_VIOLATION",
            Self::NoActionableChanges => "NO_ACTIONABLE_CHANGES",
        };
        f.write_str(s)
    }
}

/// Where a verification command came from.
///
/// Recorded alongside a failed command so recovery can decide whether the
/// failure class is eligible for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandSource {
    Explicit,
    Auto,
    LightCheck,
    Guard,
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Explicit => "explicit",
            Self::Auto => "auto",
            Self::LightCheck => "light-check",
            Self::Guard => "guard",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// JSONB payload types
// ---------------------------------------------------------------------------

/// Reference to a pull request carried in a task context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrRef {
    pub number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
}

/// Structured context attached to a task by the planner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrRef>,
}

/// Structured failure metadata persisted on a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<FailureCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_command_source: Option<CommandSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_command_stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_violations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_probes: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the unit of work delivered by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub goal: String,
    pub notes: Option<String>,
    pub context: Option<Json<TaskContext>>,
    pub allowed_paths: Vec<String>,
    pub commands: Vec<String>,
    pub timebox_minutes: i32,
    pub risk_level: String,
    pub priority: i32,
    pub role: TaskRole,
    pub kind: String,
    pub retry_count: i32,
    pub retry_limit: i32,
    pub block_reason: Option<BlockReason>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Structured context, if any.
    pub fn context(&self) -> Option<&TaskContext> {
        self.context.as_ref().map(|j| &j.0)
    }

    /// PR reference from the context, if any.
    pub fn pr_ref(&self) -> Option<&PrRef> {
        self.context().and_then(|c| c.pr.as_ref())
    }

    /// Whether the retry envelope still permits another attempt.
    ///
    /// A `retry_limit` of -1 means unbounded.
    pub fn can_retry(&self) -> bool {
        self.retry_limit < 0 || self.retry_count < self.retry_limit
    }
}

/// One execution attempt of a task by one agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_path: Option<String>,
    pub cost_tokens: Option<i64>,
    pub error_message: Option<String>,
    pub error_meta: Option<Json<ErrorMeta>>,
}

impl Run {
    /// Structured failure metadata, if any.
    pub fn error_meta(&self) -> Option<&ErrorMeta> {
        self.error_meta.as_ref().map(|j| &j.0)
    }
}

/// In-database claim of a task by a run. One row per active task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Lease {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub agent_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// The long-lived agent process record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: String,
    pub status: AgentStatus,
    pub role: TaskRole,
    pub current_task_id: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Immutable record attached to a run (branch, worktree, commit, PR, ...).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Artifact {
    pub id: Uuid,
    pub run_id: Uuid,
    pub kind: ArtifactKind,
    pub reference: String,
    pub url: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: i64,
    pub task_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Blocked,
            TaskStatus::Failed,
            TaskStatus::Done,
            TaskStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn block_reason_display_roundtrip() {
        let variants = [
            BlockReason::AwaitingJudge,
            BlockReason::QuotaWait,
            BlockReason::NeedsRework,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: BlockReason = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn run_status_display_roundtrip() {
        let variants = [
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RunStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_status_display_roundtrip() {
        let variants = [AgentStatus::Idle, AgentStatus::Busy, AgentStatus::Offline];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_role_display_roundtrip() {
        let variants = [TaskRole::Worker, TaskRole::Tester, TaskRole::Docser];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskRole = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn artifact_kind_display_roundtrip() {
        let variants = [
            ArtifactKind::Branch,
            ArtifactKind::Worktree,
            ArtifactKind::Commit,
            ArtifactKind::Pr,
            ArtifactKind::DirectEdit,
            ArtifactKind::CiResult,
            ArtifactKind::VisualProbe,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ArtifactKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn failure_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&FailureCode::QuotaFailure).unwrap();
        assert_eq!(json, "\"QUOTA_FAILURE\"");
        let back: FailureCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FailureCode::QuotaFailure);
    }

    #[test]
    fn command_source_serializes_kebab() {
        let json = serde_json::to_string(&CommandSource::LightCheck).unwrap();
        assert_eq!(json, "\"light-check\"");
        assert_eq!(CommandSource::LightCheck.to_string(), "light-check");
    }

    #[test]
    fn error_meta_roundtrip() {
        let meta = ErrorMeta {
            source: Some("verification".into()),
            failure_code: Some(FailureCode::VerificationCommandFailed),
            failed_command: Some("npm test".into()),
            failed_command_source: Some(CommandSource::Explicit),
            failed_command_stderr: Some("1 test failed".into()),
            policy_violations: vec!["outside-allowed: docs/README.md".into()],
            visual_probes: None,
        };
        let json = serde_json::to_value(&meta).unwrap();
        let back: ErrorMeta = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn error_meta_defaults_from_empty_object() {
        let meta: ErrorMeta = serde_json::from_str("{}").unwrap();
        assert!(meta.failure_code.is_none());
        assert!(meta.policy_violations.is_empty());
    }

    #[test]
    fn task_context_pr_roundtrip() {
        let ctx = TaskContext {
            spec_text: None,
            files: vec!["src/a.ts".into()],
            pr: Some(PrRef {
                number: 42,
                head_ref: Some("feature/x".into()),
                base_ref: Some("main".into()),
            }),
        };
        let json = serde_json::to_value(&ctx).unwrap();
        let back: TaskContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn retry_limit_negative_means_unbounded() {
        let mut task = test_task();
        task.retry_limit = -1;
        task.retry_count = 10_000;
        assert!(task.can_retry());

        task.retry_limit = 3;
        task.retry_count = 3;
        assert!(!task.can_retry());

        task.retry_count = 2;
        assert!(task.can_retry());
    }

    fn test_task() -> Task {
        Task {
            id: Uuid::new_v4(),
            title: "t".into(),
            goal: "g".into(),
            notes: None,
            context: None,
            allowed_paths: vec![],
            commands: vec![],
            timebox_minutes: 30,
            risk_level: "low".into(),
            priority: 0,
            role: TaskRole::Worker,
            kind: "code".into(),
            retry_count: 0,
            retry_limit: 3,
            block_reason: None,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
