//! Dual-reviewer machinery: normalized feedback, conflict resolution,
//! approval policies, and the parallel fan-out contract.

pub mod approval;
pub mod conflict;
pub mod feedback;
pub mod parallel;

pub use approval::{ApprovalConfig, ApprovalPolicy, ApprovalResult, SingleAgentPreference};
pub use conflict::{ConflictReport, FieldConflict, ResolutionStrategy};
pub use feedback::{Assessment, Concern, Feedback, Severity, normalize_feedback};
pub use parallel::{ReviewOutcome, run_dual_review};
