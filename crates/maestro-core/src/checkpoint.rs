//! Workflow checkpoints: atomic state snapshots with git-backed source
//! rollback.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{info, warn};

use maestro_db::models::{Checkpoint, WorkflowState};
use maestro_db::queries::checkpoints::{self, NewCheckpoint};
use maestro_db::queries::{tasks, workflow};

use crate::gitops::GitOps;

/// Derive a checkpoint id: first 12 hex chars of
/// `sha256(name ‖ timestamp ‖ project)`.
pub fn derive_checkpoint_id(name: &str, timestamp: &str, project: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(project.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

/// What a rollback did.
#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub checkpoint_id: String,
    pub restored_phase: i32,
    /// Commit the source tree was reset to, when one was recorded.
    pub git_hash: Option<String>,
}

/// Creates, lists, and restores checkpoints.
#[derive(Clone)]
pub struct CheckpointManager {
    pool: PgPool,
    git: GitOps,
    project: String,
}

impl CheckpointManager {
    pub fn new(pool: PgPool, git: GitOps, project: impl Into<String>) -> Self {
        Self {
            pool,
            git,
            project: project.into(),
        }
    }

    /// Snapshot the current workflow state.
    ///
    /// `files` optionally records the tracked-file list alongside the
    /// state. The snapshot is immutable once written.
    pub async fn create(
        &self,
        name: &str,
        notes: Option<&str>,
        files: Option<Vec<String>>,
    ) -> anyhow::Result<Checkpoint> {
        let state = workflow::get_state(&self.pool)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no workflow state to checkpoint"))?;

        let progress = tasks::get_progress(&self.pool).await?;
        let timestamp = Utc::now().to_rfc3339();
        let id = derive_checkpoint_id(name, &timestamp, &self.project);

        let checkpoint = checkpoints::insert_checkpoint(
            &self.pool,
            &NewCheckpoint {
                id: id.clone(),
                name: name.to_string(),
                notes: notes.map(str::to_string),
                phase: state.current_phase,
                task_progress: serde_json::json!({
                    "completed": progress.completed,
                    "failed": progress.failed,
                    "total": progress.total,
                }),
                state_snapshot: serde_json::to_string(&state)?,
                files_snapshot: files.map(|f| serde_json::json!(f)),
            },
        )
        .await?;

        info!(checkpoint_id = %id, name, phase = state.current_phase, "checkpoint created");
        Ok(checkpoint)
    }

    /// List checkpoints, newest first, skipping corrupted snapshots.
    pub async fn list(&self, limit: i64) -> anyhow::Result<Vec<Checkpoint>> {
        let decoded = checkpoints::list_decoded(&self.pool, limit).await?;
        Ok(decoded.into_iter().map(|(cp, _)| cp).collect())
    }

    /// Delete a checkpoint.
    pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        Ok(checkpoints::delete_checkpoint(&self.pool, id).await? > 0)
    }

    /// Roll back to a checkpoint.
    ///
    /// Refuses without `confirmed`: rollback discards state and resets the
    /// source tree, so the caller must have asked a human (or been told
    /// not to ask). State restores from the snapshot; source resets to the
    /// last commit recorded at or before the checkpoint's phase.
    pub async fn rollback(&self, id: &str, confirmed: bool) -> anyhow::Result<RollbackReport> {
        if !confirmed {
            anyhow::bail!("rollback to checkpoint {id} requires explicit confirmation");
        }

        let (checkpoint, state_value) = checkpoints::get_decoded(&self.pool, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("checkpoint {id} not found or unreadable"))?;

        let snapshot: WorkflowState = serde_json::from_value(state_value)
            .map_err(|e| anyhow::anyhow!("checkpoint {id} snapshot does not match schema: {e}"))?;

        // Source rollback first: if git fails we have not yet touched state.
        let git_hash = last_commit_for_phase(&snapshot, checkpoint.phase);
        if let Some(hash) = &git_hash {
            self.git.reset_hard(hash).await?;
        } else {
            warn!(checkpoint_id = %id, "no recorded commit at or before checkpoint phase, skipping source reset");
        }

        workflow::restore_snapshot(&self.pool, &snapshot).await?;

        info!(
            checkpoint_id = %id,
            phase = checkpoint.phase,
            git_hash = git_hash.as_deref().unwrap_or("none"),
            "rolled back to checkpoint"
        );

        Ok(RollbackReport {
            checkpoint_id: id.to_string(),
            restored_phase: checkpoint.phase,
            git_hash,
        })
    }
}

/// The hash of the most recent commit recorded at or before `phase`.
fn last_commit_for_phase(state: &WorkflowState, phase: i32) -> Option<String> {
    let commits = state.git_commits.as_array()?;
    commits
        .iter()
        .rev()
        .find(|c| c.get("phase").and_then(|p| p.as_i64()).unwrap_or(i64::MAX) <= phase as i64)
        .and_then(|c| c.get("hash").and_then(|h| h.as_str()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_id_is_12_hex_and_deterministic() {
        let a = derive_checkpoint_id("pre-impl", "2026-08-01T10:00:00Z", "widget");
        let b = derive_checkpoint_id("pre-impl", "2026-08-01T10:00:00Z", "widget");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn checkpoint_id_varies_with_inputs() {
        let base = derive_checkpoint_id("a", "t", "p");
        assert_ne!(base, derive_checkpoint_id("b", "t", "p"));
        assert_ne!(base, derive_checkpoint_id("a", "u", "p"));
        assert_ne!(base, derive_checkpoint_id("a", "t", "q"));
    }

    fn state_with_commits(commits: serde_json::Value) -> WorkflowState {
        WorkflowState {
            id: uuid::Uuid::new_v4(),
            project_dir: "/p".to_string(),
            current_phase: 3,
            phase_status: serde_json::json!({}),
            iteration_count: 0,
            plan: None,
            validation_feedback: None,
            verification_feedback: None,
            implementation_result: None,
            next_decision: maestro_db::models::NextDecision::Continue,
            execution_mode: maestro_db::models::ExecutionMode::Afk,
            end_phase: 5,
            context_snapshot: None,
            token_usage: serde_json::json!({}),
            git_commits: commits,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn last_commit_selection_respects_phase() {
        let state = state_with_commits(serde_json::json!([
            {"phase": 1, "hash": "aaa"},
            {"phase": 2, "hash": "bbb"},
            {"phase": 3, "hash": "ccc"},
        ]));

        assert_eq!(last_commit_for_phase(&state, 2), Some("bbb".to_string()));
        assert_eq!(last_commit_for_phase(&state, 3), Some("ccc".to_string()));
        assert_eq!(last_commit_for_phase(&state, 5), Some("ccc".to_string()));
    }

    #[test]
    fn no_commit_before_phase_yields_none() {
        let state = state_with_commits(serde_json::json!([{"phase": 4, "hash": "ddd"}]));
        assert_eq!(last_commit_for_phase(&state, 2), None);

        let empty = state_with_commits(serde_json::json!([]));
        assert_eq!(last_commit_for_phase(&empty, 5), None);
    }
}
