use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a workflow phase or a task.
///
/// Phases and tasks share one status vocabulary; the transition rules
/// differ and live in `maestro-core`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = StepStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(StepStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StepStatus`] string.
#[derive(Debug, Clone)]
pub struct StepStatusParseError(pub String);

impl fmt::Display for StepStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status: {:?}", self.0)
    }
}

impl std::error::Error for StepStatusParseError {}

// ---------------------------------------------------------------------------

/// Routing decision emitted by a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NextDecision {
    Continue,
    Retry,
    Escalate,
    Abort,
}

impl fmt::Display for NextDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Continue => "continue",
            Self::Retry => "retry",
            Self::Escalate => "escalate",
            Self::Abort => "abort",
        };
        f.write_str(s)
    }
}

impl FromStr for NextDecision {
    type Err = NextDecisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(Self::Continue),
            "retry" => Ok(Self::Retry),
            "escalate" => Ok(Self::Escalate),
            "abort" => Ok(Self::Abort),
            other => Err(NextDecisionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NextDecision`] string.
#[derive(Debug, Clone)]
pub struct NextDecisionParseError(pub String);

impl fmt::Display for NextDecisionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid decision: {:?}", self.0)
    }
}

impl std::error::Error for NextDecisionParseError {}

// ---------------------------------------------------------------------------

/// How the workflow behaves when something needs a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Away-from-keyboard: abort once retry budgets are exhausted.
    Afk,
    /// Human-in-the-loop: pause and wait for input on escalation.
    Hitl,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Afk => "afk",
            Self::Hitl => "hitl",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionMode {
    type Err = ExecutionModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "afk" => Ok(Self::Afk),
            "hitl" => Ok(Self::Hitl),
            other => Err(ExecutionModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionMode`] string.
#[derive(Debug, Clone)]
pub struct ExecutionModeParseError(pub String);

impl fmt::Display for ExecutionModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution mode: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionModeParseError {}

// ---------------------------------------------------------------------------

/// Priority of a task; drives selection order in the task loop.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(TaskPriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskPriority`] string.
#[derive(Debug, Clone)]
pub struct TaskPriorityParseError(pub String);

impl fmt::Display for TaskPriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for TaskPriorityParseError {}

// ---------------------------------------------------------------------------

/// Terminal status of an agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    Failed,
    Timeout,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for InvocationStatus {
    type Err = InvocationStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(InvocationStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InvocationStatus`] string.
#[derive(Debug, Clone)]
pub struct InvocationStatusParseError(pub String);

impl fmt::Display for InvocationStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid invocation status: {:?}", self.0)
    }
}

impl std::error::Error for InvocationStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a CLI continuity session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionStatus {
    type Err = SessionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(SessionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SessionStatus`] string.
#[derive(Debug, Clone)]
pub struct SessionStatusParseError(pub String);

impl fmt::Display for SessionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session status: {:?}", self.0)
    }
}

impl std::error::Error for SessionStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// Workflow state -- exactly one row per project database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowState {
    pub id: Uuid,
    pub project_dir: String,
    pub current_phase: i32,
    /// Map of phase number -> `{status, attempts, max_attempts, started_at,
    /// completed_at, error}`.
    pub phase_status: serde_json::Value,
    pub iteration_count: i32,
    pub plan: Option<serde_json::Value>,
    /// Map of reviewer name -> feedback.
    pub validation_feedback: Option<serde_json::Value>,
    pub verification_feedback: Option<serde_json::Value>,
    pub implementation_result: Option<serde_json::Value>,
    pub next_decision: NextDecision,
    pub execution_mode: ExecutionMode,
    pub end_phase: i32,
    pub context_snapshot: Option<serde_json::Value>,
    pub token_usage: serde_json::Value,
    /// Commits recorded by phase auto-commit: `[{phase, hash, message,
    /// timestamp}]`.
    pub git_commits: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task -- the unit of implementation inside phase 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Task {
    /// Stable id assigned by the planner (e.g. "T1").
    pub id: String,
    pub title: String,
    pub user_story: Option<String>,
    pub acceptance_criteria: Vec<String>,
    pub dependencies: Vec<String>,
    pub files_to_create: Vec<String>,
    pub files_to_modify: Vec<String>,
    pub test_files: Vec<String>,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub test_results: Option<serde_json::Value>,
    pub status: StepStatus,
    pub priority: TaskPriority,
    pub attempts: i32,
    pub max_attempts: i32,
    pub implementation_notes: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of one agent invocation. Never mutated after the
/// result fields are committed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub agent: String,
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    /// SHA-256 of the prompt; the full text is never stored.
    pub prompt_hash: String,
    pub prompt_length: i64,
    pub command_args: Vec<String>,
    pub exit_code: Option<i32>,
    pub status: InvocationStatus,
    pub duration_seconds: f64,
    pub output_length: i64,
    pub error_length: i64,
    /// "json", "extracted_json", or "none".
    pub parsed_output_type: String,
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A CLI continuity session. At most one active row per (task, agent).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    /// `<task_id>-<12 hex>`.
    pub id: String,
    pub task_id: String,
    pub agent: String,
    pub status: SessionStatus,
    pub invocation_count: i32,
    pub total_cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Append-only per-invocation spend record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BudgetRecord {
    pub id: Uuid,
    pub task_id: String,
    pub agent: String,
    pub cost_usd: f64,
    pub tokens_input: Option<i64>,
    pub tokens_output: Option<i64>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Workflow snapshot. Immutable after creation; deletion allowed.
///
/// `state_snapshot` is stored as JSON text rather than JSONB so that a
/// corrupted blob surfaces at decode time (where we can skip-and-log)
/// instead of poisoning the whole row fetch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    /// 12 hex chars derived from name + timestamp + project.
    pub id: String,
    pub name: String,
    pub notes: Option<String>,
    pub phase: i32,
    pub task_progress: serde_json::Value,
    pub state_snapshot: String,
    pub files_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Decode the state snapshot, tolerating corruption.
    ///
    /// Returns `None` (with an ERROR log) when the stored text is not valid
    /// JSON, so a damaged checkpoint can never crash the workflow.
    pub fn decode_state(&self) -> Option<serde_json::Value> {
        match serde_json::from_str(&self.state_snapshot) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(
                    checkpoint_id = %self.id,
                    error = %e,
                    "corrupted checkpoint snapshot, skipping"
                );
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
