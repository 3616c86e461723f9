//! The five-phase state machine's nodes.
//!
//! Each phase is a discrete node returning a [`PhaseOutcome`] with an
//! explicit routing decision. Nodes never raise across the scheduler
//! boundary: failures inside agent calls, file I/O, or the database are
//! caught, logged with context, and folded into the outcome.

pub mod completion;
pub mod implementation;
pub mod planning;
pub mod validation;
pub mod verification;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use maestro_db::models::{NextDecision, StepStatus};
use maestro_db::queries::workflow;

use crate::actionlog::ActionLog;
use crate::agents::AgentCli;
use crate::budget::BudgetEnforcer;
use crate::config::ProjectConfig;
use crate::gitops::GitOps;
use crate::invoker::AgentInvoker;
use crate::session::SessionManager;

/// The five workflow phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Planning = 1,
    Validation = 2,
    Implementation = 3,
    Verification = 4,
    Completion = 5,
}

impl Phase {
    pub fn number(&self) -> i32 {
        *self as i32
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Validation => "validation",
            Self::Implementation => "implementation",
            Self::Verification => "verification",
            Self::Completion => "completion",
        }
    }

    pub fn from_number(n: i32) -> Option<Self> {
        match n {
            1 => Some(Self::Planning),
            2 => Some(Self::Validation),
            3 => Some(Self::Implementation),
            4 => Some(Self::Verification),
            5 => Some(Self::Completion),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    pub const ALL: [Phase; 5] = [
        Self::Planning,
        Self::Validation,
        Self::Implementation,
        Self::Verification,
        Self::Completion,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a phase node hands back to the runner.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub decision: NextDecision,
    pub details: serde_json::Value,
}

impl PhaseOutcome {
    pub fn continue_with(details: serde_json::Value) -> Self {
        Self {
            decision: NextDecision::Continue,
            details,
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            decision: NextDecision::Retry,
            details: serde_json::json!({"reason": reason.into()}),
        }
    }

    pub fn escalate(reason: impl Into<String>) -> Self {
        Self {
            decision: NextDecision::Escalate,
            details: serde_json::json!({"reason": reason.into()}),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            decision: NextDecision::Abort,
            details: serde_json::json!({"reason": reason.into()}),
        }
    }
}

/// Everything a phase node needs, passed explicitly. Tests build their
/// own context; nothing here is process-global.
#[derive(Clone)]
pub struct PhaseContext {
    pub pool: PgPool,
    pub config: ProjectConfig,
    pub project_dir: PathBuf,
    pub workflow_dir: PathBuf,
    pub invoker: AgentInvoker,
    pub enforcer: BudgetEnforcer,
    pub sessions: SessionManager,
    pub git: GitOps,
    pub log: ActionLog,
    /// Planner and implementer.
    pub claude: Arc<dyn AgentCli>,
    /// Reviewer: code quality and security focus.
    pub cursor: Arc<dyn AgentCli>,
    /// Reviewer: architecture focus.
    pub gemini: Arc<dyn AgentCli>,
}

impl PhaseContext {
    /// Output directory for one phase
    /// (`.workflow/phases/<phase-name>/`).
    pub fn phase_dir(&self, phase: Phase) -> PathBuf {
        self.workflow_dir.join("phases").join(phase.name())
    }

    /// Create the phase dir and write a JSON artifact into it.
    pub fn write_phase_artifact(
        &self,
        phase: Phase,
        file_name: &str,
        value: &serde_json::Value,
    ) -> Result<PathBuf> {
        let dir = self.phase_dir(phase);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);
        std::fs::write(&path, serde_json::to_string_pretty(value)?)?;
        Ok(path)
    }

    /// Write a text artifact (Markdown reports).
    pub fn write_phase_text(&self, phase: Phase, file_name: &str, content: &str) -> Result<PathBuf> {
        let dir = self.phase_dir(phase);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Phase status map
// ---------------------------------------------------------------------------

/// Per-phase status record stored in `workflow_state.phase_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseStatusEntry {
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for PhaseStatusEntry {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            max_attempts: default_max_attempts(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Decode the phase status map, tolerating corrupt entries (skipped with
/// a warning, replaced by defaults).
pub fn decode_phase_map(value: &serde_json::Value) -> BTreeMap<i32, PhaseStatusEntry> {
    let mut map = BTreeMap::new();
    for phase in Phase::ALL {
        let entry = value
            .get(phase.number().to_string())
            .and_then(|v| match serde_json::from_value(v.clone()) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(phase = phase.number(), error = %e, "corrupt phase status entry, using default");
                    None
                }
            })
            .unwrap_or_default();
        map.insert(phase.number(), entry);
    }
    map
}

fn encode_phase_map(map: &BTreeMap<i32, PhaseStatusEntry>) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (phase, entry) in map {
        if let Ok(value) = serde_json::to_value(entry) {
            object.insert(phase.to_string(), value);
        }
    }
    serde_json::Value::Object(object)
}

/// Apply a mutation to one phase's entry and persist the whole map.
pub async fn update_phase_entry(
    pool: &PgPool,
    phase: Phase,
    mutate: impl FnOnce(&mut PhaseStatusEntry),
) -> Result<PhaseStatusEntry> {
    let state = workflow::get_state(pool)
        .await?
        .ok_or_else(|| anyhow::anyhow!("workflow state not initialized"))?;

    let mut map = decode_phase_map(&state.phase_status);
    let entry = map.entry(phase.number()).or_default();
    mutate(entry);
    let updated = entry.clone();

    workflow::update_phase_status(pool, &encode_phase_map(&map)).await?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_numbers_roundtrip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_number(phase.number()), Some(phase));
        }
        assert_eq!(Phase::from_number(0), None);
        assert_eq!(Phase::from_number(6), None);
    }

    #[test]
    fn phase_order_and_next() {
        assert!(Phase::Planning < Phase::Completion);
        assert_eq!(Phase::Planning.next(), Some(Phase::Validation));
        assert_eq!(Phase::Completion.next(), None);
    }

    #[test]
    fn decode_tolerates_missing_and_corrupt_entries() {
        let value = serde_json::json!({
            "1": {"status": "completed", "attempts": 1},
            "2": "this is not an object",
        });
        let map = decode_phase_map(&value);
        assert_eq!(map.len(), 5);
        assert_eq!(map[&1].status, StepStatus::Completed);
        assert_eq!(map[&2].status, StepStatus::Pending);
        assert_eq!(map[&5].status, StepStatus::Pending);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut map = decode_phase_map(&serde_json::json!({}));
        map.get_mut(&3).unwrap().status = StepStatus::InProgress;
        map.get_mut(&3).unwrap().attempts = 2;

        let encoded = encode_phase_map(&map);
        let decoded = decode_phase_map(&encoded);
        assert_eq!(decoded[&3].status, StepStatus::InProgress);
        assert_eq!(decoded[&3].attempts, 2);
    }

    #[test]
    fn outcome_constructors_set_decisions() {
        assert_eq!(
            PhaseOutcome::continue_with(serde_json::json!({})).decision,
            NextDecision::Continue
        );
        assert_eq!(PhaseOutcome::retry("x").decision, NextDecision::Retry);
        assert_eq!(PhaseOutcome::escalate("x").decision, NextDecision::Escalate);
        assert_eq!(PhaseOutcome::abort("x").decision, NextDecision::Abort);
    }
}
