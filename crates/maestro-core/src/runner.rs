//! The five-phase state machine.
//!
//! Sequences Planning, Validation, Implementation, Verification, and
//! Completion, routing between them on each node's `NextDecision`. The
//! routers honor the early-stop contract: once the current phase reaches
//! `end_phase`, the workflow routes to Completion instead of the next
//! phase.

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use maestro_db::models::{ExecutionMode, NextDecision, StepStatus, WorkflowState};
use maestro_db::queries::workflow;

use crate::actionlog::{ActionEntry, ActionStatus, ActionType};
use crate::drift;
use crate::handoff;
use crate::phases::{
    self, Phase, PhaseContext, PhaseOutcome, decode_phase_map, update_phase_entry,
};
use crate::retry::{RetryBreaker, RetryPolicy};

/// Options for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub start_phase: i32,
    pub end_phase: i32,
    pub skip_validation: bool,
    pub auto_commit: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            start_phase: 1,
            end_phase: 5,
            skip_validation: false,
            auto_commit: true,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    /// The success predicate holds.
    Succeeded,
    /// Escalated in HITL mode; resumable after human input.
    Paused { at_phase: i32 },
    /// Aborted (AFK escalation, explicit abort, or circuit breaker).
    Aborted { at_phase: i32 },
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub end: RunEnd,
    pub last_decision: NextDecision,
}

/// The success predicate over persisted state.
///
/// Holds when `current_phase == 5 && next_decision == continue`, when
/// phase 5's status is completed, or -- for early stops -- when the
/// target phase's status is completed.
pub fn is_success(state: &WorkflowState) -> bool {
    if state.current_phase == 5 && state.next_decision == NextDecision::Continue {
        return true;
    }
    let map = decode_phase_map(&state.phase_status);
    if map.get(&5).map(|e| e.status) == Some(StepStatus::Completed) {
        return true;
    }
    state.end_phase < 5 && map.get(&state.end_phase).map(|e| e.status) == Some(StepStatus::Completed)
}

/// The inter-phase router: next phase, or Completion once `end_phase` is
/// reached.
pub fn route_after(phase: Phase, end_phase: i32) -> Option<Phase> {
    if phase == Phase::Completion {
        return None;
    }
    if phase.number() >= end_phase {
        return Some(Phase::Completion);
    }
    phase.next()
}

/// Drives phases to completion under the retry budget and circuit
/// breaker.
pub struct PhaseRunner {
    pub ctx: PhaseContext,
    pub breaker: RetryBreaker,
    cancel: CancellationToken,
}

impl PhaseRunner {
    pub fn new(ctx: PhaseContext) -> Self {
        Self::with_cancel(ctx, CancellationToken::new())
    }

    /// Cancellation is delivered at phase boundaries: a cancelled token
    /// pauses the workflow before the next phase starts.
    pub fn with_cancel(ctx: PhaseContext, cancel: CancellationToken) -> Self {
        let breaker = RetryBreaker::new(ctx.config.retry.max_total_retries);
        Self { ctx, breaker, cancel }
    }

    /// Run phases from `options.start_phase` until success, pause, or
    /// abort.
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport> {
        let mut phase = Phase::from_number(options.start_phase)
            .ok_or_else(|| anyhow::anyhow!("invalid start phase {}", options.start_phase))?;
        if !(1..=5).contains(&options.end_phase) {
            anyhow::bail!("invalid end phase {}", options.end_phase);
        }

        let implementation_policy = RetryPolicy::for_implementation(&self.ctx.config.retry);

        loop {
            if self.cancel.is_cancelled() {
                info!(phase = %phase, "cancellation requested, pausing workflow");
                self.write_handoff("cancelled by operator").await;
                self.ctx.log.append(
                    ActionEntry::new(ActionType::WorkflowPause, "cancelled by operator")
                        .phase(phase.number()),
                );
                return Ok(RunReport {
                    end: RunEnd::Paused {
                        at_phase: phase.number(),
                    },
                    last_decision: NextDecision::Escalate,
                });
            }

            // Skip-validation flag and already-completed phases route
            // forward without running the node.
            let state = self.load_state().await?;
            let map = decode_phase_map(&state.phase_status);

            let already_done = map.get(&phase.number()).map(|e| e.status)
                == Some(StepStatus::Completed)
                && phase != Phase::Completion;
            let skipped = options.skip_validation && phase == Phase::Validation;

            if already_done || skipped {
                if skipped {
                    info!(phase = %phase, "skipping validation phase by request");
                    self.ctx.log.append(
                        ActionEntry::new(ActionType::TaskSkipped, "validation skipped")
                            .phase(phase.number())
                            .status(ActionStatus::Skipped),
                    );
                }
                match route_after(phase, options.end_phase) {
                    Some(next) => {
                        phase = next;
                        continue;
                    }
                    None => break,
                }
            }

            // Context drift check before each phase.
            if let Some(stored) = state
                .context_snapshot
                .as_ref()
                .and_then(|v| serde_json::from_value::<drift::ContextSnapshot>(v.clone()).ok())
            {
                let report = drift::diff(&stored, &self.ctx.project_dir);
                if report.has_drift() {
                    warn!(phase = %phase, drift = %report.summary(), "context drift detected");
                    self.ctx.log.append(
                        ActionEntry::new(
                            ActionType::Warning,
                            format!("context drift before {phase}: {}", report.summary()),
                        )
                        .phase(phase.number()),
                    );
                    if self.ctx.config.workflow.drift_blocking {
                        return self
                            .finish_escalation(phase, "context drift with blocking enabled")
                            .await;
                    }
                }
            }

            // Mark started and run the node.
            workflow::update_phase(&self.ctx.pool, phase.number(), NextDecision::Continue).await?;
            update_phase_entry(&self.ctx.pool, phase, |entry| {
                entry.status = StepStatus::InProgress;
                entry.attempts += 1;
                entry.max_attempts = self.ctx.config.validation.max_phase_retries;
                entry.started_at = Some(Utc::now().to_rfc3339());
                entry.error = None;
            })
            .await?;

            let outcome = self.run_node(phase).await?;
            workflow::update_phase(&self.ctx.pool, phase.number(), outcome.decision).await?;

            match outcome.decision {
                NextDecision::Continue => {
                    update_phase_entry(&self.ctx.pool, phase, |entry| {
                        entry.status = StepStatus::Completed;
                        entry.completed_at = Some(Utc::now().to_rfc3339());
                    })
                    .await?;

                    if options.auto_commit {
                        self.auto_commit_phase(phase).await;
                    }

                    match route_after(phase, options.end_phase) {
                        Some(next) => phase = next,
                        None => break,
                    }
                }

                NextDecision::Retry => {
                    let entry = update_phase_entry(&self.ctx.pool, phase, |entry| {
                        entry.status = StepStatus::Failed;
                        entry.error = outcome
                            .details
                            .get("reason")
                            .and_then(|r| r.as_str())
                            .map(str::to_string);
                    })
                    .await?;

                    if entry.attempts >= entry.max_attempts {
                        return self
                            .finish_escalation(
                                phase,
                                &format!("{phase} failed after {} attempts", entry.attempts),
                            )
                            .await;
                    }
                    if !self.breaker.try_retry() {
                        return self
                            .finish_escalation(phase, "global retry budget exhausted")
                            .await;
                    }

                    let delay = implementation_policy.delay_for(entry.attempts);
                    self.ctx.log.append(
                        ActionEntry::new(
                            ActionType::PhaseRetry,
                            format!("retrying {phase} (attempt {})", entry.attempts + 1),
                        )
                        .phase(phase.number()),
                    );
                    tokio::time::sleep(delay).await;
                    // Loop re-runs the same phase.
                }

                NextDecision::Escalate => {
                    update_phase_entry(&self.ctx.pool, phase, |entry| {
                        entry.status = StepStatus::Failed;
                        entry.error = outcome
                            .details
                            .get("reason")
                            .and_then(|r| r.as_str())
                            .map(str::to_string);
                    })
                    .await?;
                    return self
                        .finish_escalation(
                            phase,
                            outcome
                                .details
                                .get("reason")
                                .and_then(|r| r.as_str())
                                .unwrap_or("escalation requested"),
                        )
                        .await;
                }

                NextDecision::Abort => {
                    update_phase_entry(&self.ctx.pool, phase, |entry| {
                        entry.status = StepStatus::Failed;
                        entry.error = outcome
                            .details
                            .get("reason")
                            .and_then(|r| r.as_str())
                            .map(str::to_string);
                    })
                    .await?;
                    self.write_handoff(&format!("aborted in {phase}")).await;
                    self.ctx.log.append(
                        ActionEntry::new(ActionType::WorkflowEnd, format!("aborted in {phase}"))
                            .phase(phase.number())
                            .status(ActionStatus::Failed),
                    );
                    return Ok(RunReport {
                        end: RunEnd::Aborted {
                            at_phase: phase.number(),
                        },
                        last_decision: NextDecision::Abort,
                    });
                }
            }
        }

        let state = self.load_state().await?;
        Ok(RunReport {
            end: if is_success(&state) {
                RunEnd::Succeeded
            } else {
                RunEnd::Aborted {
                    at_phase: state.current_phase,
                }
            },
            last_decision: state.next_decision,
        })
    }

    async fn run_node(&self, phase: Phase) -> Result<PhaseOutcome> {
        match phase {
            Phase::Planning => phases::planning::run(&self.ctx).await,
            Phase::Validation => phases::validation::run(&self.ctx).await,
            Phase::Implementation => phases::implementation::run(&self.ctx).await,
            Phase::Verification => phases::verification::run(&self.ctx).await,
            Phase::Completion => phases::completion::run(&self.ctx).await,
        }
    }

    async fn load_state(&self) -> Result<WorkflowState> {
        workflow::get_state(&self.ctx.pool)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workflow state not initialized"))
    }

    /// Escalation terminal: pause in HITL mode, abort in AFK.
    async fn finish_escalation(&self, phase: Phase, reason: &str) -> Result<RunReport> {
        workflow::update_phase(&self.ctx.pool, phase.number(), NextDecision::Escalate).await?;
        self.write_handoff(reason).await;
        self.ctx.log.append(
            ActionEntry::new(ActionType::Escalation, reason.to_string())
                .phase(phase.number())
                .status(ActionStatus::Failed),
        );

        let state = self.load_state().await?;
        let end = match state.execution_mode {
            ExecutionMode::Hitl => {
                self.ctx.log.append(
                    ActionEntry::new(ActionType::WorkflowPause, "paused for human input")
                        .phase(phase.number()),
                );
                RunEnd::Paused {
                    at_phase: phase.number(),
                }
            }
            ExecutionMode::Afk => {
                self.ctx.log.append(
                    ActionEntry::new(ActionType::WorkflowEnd, "aborted after escalation")
                        .phase(phase.number())
                        .status(ActionStatus::Failed),
                );
                RunEnd::Aborted {
                    at_phase: phase.number(),
                }
            }
        };
        Ok(RunReport {
            end,
            last_decision: NextDecision::Escalate,
        })
    }

    async fn auto_commit_phase(&self, phase: Phase) {
        if !self.ctx.git.is_git_repo().await {
            return;
        }
        let message = format!("maestro: phase {} ({}) complete", phase.number(), phase);
        match self.ctx.git.auto_commit(&message).await {
            Ok(Some(hash)) => {
                let record = serde_json::json!({
                    "phase": phase.number(),
                    "hash": hash,
                    "message": message,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                if let Err(e) = workflow::append_git_commit(&self.ctx.pool, &record).await {
                    warn!(error = %e, "failed to record auto-commit");
                }
                self.ctx.log.append(
                    ActionEntry::new(ActionType::GitCommit, message).phase(phase.number()),
                );
            }
            Ok(None) => {}
            Err(e) => {
                // Auto-commit failure is logged, never fatal.
                warn!(phase = %phase, error = %e, "auto-commit failed");
            }
        }
    }

    async fn write_handoff(&self, blocker: &str) {
        match self.load_state().await {
            Ok(state) => {
                let brief =
                    handoff::build_brief(&state, self.ctx.log.last(), vec![blocker.to_string()]);
                if let Err(e) = handoff::write_brief(&self.ctx.workflow_dir, &brief) {
                    warn!(error = %e, "failed to write handoff brief");
                }
            }
            Err(e) => warn!(error = %e, "failed to load state for handoff brief"),
        }
    }
}
