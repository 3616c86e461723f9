//! Append-only action log for workflow observability.
//!
//! Every significant event lands in `.workflow/action_log.jsonl`, with a
//! small index (`action_log_index.json`) maintained alongside and a
//! broadcast channel fanning entries out to live subscribers. The wire
//! schema matches the live-subscription event contract.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Everything the engine reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    // Workflow level
    WorkflowStart,
    WorkflowEnd,
    WorkflowPause,
    WorkflowResume,
    // Phase level
    PhaseStart,
    PhaseComplete,
    PhaseFailed,
    PhaseRetry,
    // Agent level
    AgentInvoke,
    AgentComplete,
    AgentError,
    AgentTimeout,
    // Task level
    TaskStart,
    TaskComplete,
    TaskFailed,
    TaskBlocked,
    TaskSkipped,
    // Review outcomes
    ValidationPass,
    ValidationFail,
    VerificationPass,
    VerificationFail,
    // Human interaction
    Escalation,
    HumanInput,
    // Git
    GitCommit,
    GitRollback,
    // System
    Error,
    Warning,
    Info,
    Checkpoint,
}

/// Status of a logged action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Started,
    #[default]
    Completed,
    Failed,
    Skipped,
    Pending,
}

/// One wire-level log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    pub id: Uuid,
    pub timestamp: String,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ActionEntry {
    pub fn new(action_type: ActionType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now().to_rfc3339(),
            action_type,
            status: ActionStatus::Completed,
            message: message.into(),
            phase: None,
            agent: None,
            task_id: None,
            details: None,
            error: None,
            duration_ms: None,
        }
    }

    pub fn status(mut self, status: ActionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn phase(mut self, phase: i32) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn error_text(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.status = ActionStatus::Failed;
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }
}

/// Counters maintained alongside the log file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionIndex {
    pub total: u64,
    pub by_phase: BTreeMap<String, u64>,
    pub by_agent: BTreeMap<String, u64>,
    pub by_task: BTreeMap<String, u64>,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Thread-safe, append-only log with live fan-out.
#[derive(Clone)]
pub struct ActionLog {
    log_path: PathBuf,
    index_path: PathBuf,
    state: Arc<Mutex<ActionIndex>>,
    sender: broadcast::Sender<ActionEntry>,
}

impl ActionLog {
    /// Open (or create) the log under `workflow_dir`.
    pub fn open(workflow_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let workflow_dir = workflow_dir.into();
        std::fs::create_dir_all(&workflow_dir)?;

        let index_path = workflow_dir.join("action_log_index.json");
        let index = match std::fs::read_to_string(&index_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, "unreadable action log index, starting fresh");
                ActionIndex::default()
            }),
            Err(_) => ActionIndex::default(),
        };

        let (sender, _) = broadcast::channel(256);

        Ok(Self {
            log_path: workflow_dir.join("action_log.jsonl"),
            index_path,
            state: Arc::new(Mutex::new(index)),
            sender,
        })
    }

    /// Append an entry: JSONL line, index update, live broadcast.
    ///
    /// Append failures are logged, never raised; observability must not
    /// take the workflow down.
    pub fn append(&self, entry: ActionEntry) -> ActionEntry {
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "unserializable action entry dropped");
                return entry;
            }
        };

        {
            let mut index = self.state.lock().expect("action log lock poisoned");

            let write_result = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .and_then(|mut f| writeln!(f, "{line}"));
            if let Err(e) = write_result {
                warn!(path = %self.log_path.display(), error = %e, "failed to append action log entry");
            }

            index.total += 1;
            if let Some(phase) = entry.phase {
                *index.by_phase.entry(phase.to_string()).or_default() += 1;
            }
            if let Some(agent) = &entry.agent {
                *index.by_agent.entry(agent.clone()).or_default() += 1;
            }
            if let Some(task) = &entry.task_id {
                *index.by_task.entry(task.clone()).or_default() += 1;
            }
            if entry.error.is_some() || entry.status == ActionStatus::Failed {
                index.errors += 1;
            }
            index.last_updated = Some(Utc::now().to_rfc3339());

            if let Ok(serialized) = serde_json::to_string_pretty(&*index)
                && let Err(e) = std::fs::write(&self.index_path, serialized)
            {
                warn!(error = %e, "failed to write action log index");
            }
        }

        // Live fan-out; no subscribers is fine.
        let _ = self.sender.send(entry.clone());
        entry
    }

    /// Subscribe to entries as they are appended.
    pub fn subscribe(&self) -> broadcast::Receiver<ActionEntry> {
        self.sender.subscribe()
    }

    /// The most recent `limit` entries, newest first. Unparseable lines
    /// are skipped.
    pub fn recent(&self, limit: usize) -> Vec<ActionEntry> {
        let Ok(content) = std::fs::read_to_string(&self.log_path) else {
            return Vec::new();
        };
        let mut entries: Vec<ActionEntry> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        entries.reverse();
        entries.truncate(limit);
        entries
    }

    /// Snapshot of the index counters.
    pub fn index(&self) -> ActionIndex {
        self.state.lock().expect("action log lock poisoned").clone()
    }

    /// The last entry, if any.
    pub fn last(&self) -> Option<ActionEntry> {
        self.recent(1).into_iter().next()
    }
}
