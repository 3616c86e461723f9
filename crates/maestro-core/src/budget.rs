//! Budget enforcement.
//!
//! Tracks per-task and per-project spend and decides, before each agent
//! invocation, whether the call may proceed. Failures inside the enforcer
//! escalate rather than silently pass: a budget check that cannot read its
//! own ledger must never behave as an approval.

use sqlx::PgPool;
use tracing::{error, warn};

use maestro_db::queries::budget::{self, NewBudgetRecord};

use crate::config::BudgetConfig;

/// Fraction of a budget at which callers are warned.
const WARN_FRACTION: f64 = 0.75;
/// Fraction at which the workflow escalates to a human.
const ESCALATE_FRACTION: f64 = 0.90;

/// Outcome of a pre-invocation budget check, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BudgetDecision {
    /// Spend freely.
    Allow,
    /// Proceed, but surface how close the budget is.
    Warn {
        /// Percentage of the budget this spend would reach.
        at_percent: u8,
    },
    /// Route to human-in-the-loop before spending.
    Escalate,
    /// Refuse the spend outright.
    Abort,
}

/// Pure threshold evaluation for one ceiling.
///
/// `None` limit means unlimited. The 90% soft limit escalates; 100%
/// aborts; 75% warns. 89% must not escalate -- the boundary sits exactly
/// at the fractions above.
fn decide(spent: f64, amount: f64, limit: Option<f64>) -> BudgetDecision {
    let Some(limit) = limit else {
        return BudgetDecision::Allow;
    };
    if limit <= 0.0 {
        return BudgetDecision::Abort;
    }

    let fraction = (spent + amount) / limit;
    if fraction >= 1.0 {
        BudgetDecision::Abort
    } else if fraction >= ESCALATE_FRACTION {
        BudgetDecision::Escalate
    } else if fraction >= WARN_FRACTION {
        BudgetDecision::Warn {
            at_percent: (fraction * 100.0) as u8,
        }
    } else {
        BudgetDecision::Allow
    }
}

/// Decides allow / warn / escalate / abort before each invocation and
/// records spend afterwards.
#[derive(Debug, Clone)]
pub struct BudgetEnforcer {
    pool: PgPool,
    limits: BudgetConfig,
}

impl BudgetEnforcer {
    pub fn new(pool: PgPool, limits: BudgetConfig) -> Self {
        Self { pool, limits }
    }

    /// Check a prospective spend against the task and project ceilings.
    ///
    /// Infallible by contract: a storage error inside the check returns
    /// [`BudgetDecision::Escalate`] (with an ERROR log), never a silent
    /// allow and never a panic across the scheduler boundary.
    pub async fn can_spend(&self, task_id: &str, amount_usd: f64) -> BudgetDecision {
        if amount_usd < 0.0 {
            warn!(task_id, amount_usd, "negative spend amount, escalating");
            return BudgetDecision::Escalate;
        }

        let task_spent = match budget::task_spent(&self.pool, task_id).await {
            Ok(v) => v,
            Err(e) => {
                error!(task_id, error = %e, "budget check failed reading task spend, escalating");
                return BudgetDecision::Escalate;
            }
        };
        let project_spent = match budget::project_spent(&self.pool).await {
            Ok(v) => v,
            Err(e) => {
                error!(task_id, error = %e, "budget check failed reading project spend, escalating");
                return BudgetDecision::Escalate;
            }
        };

        let task_decision = decide(task_spent, amount_usd, self.limits.task_budget_usd);
        let project_decision = decide(project_spent, amount_usd, self.limits.project_budget_usd);

        task_decision.max(project_decision)
    }

    /// Whether a single call exceeds the per-invocation ceiling. The
    /// invoker refuses such calls before spawning anything.
    pub fn exceeds_invocation_ceiling(&self, amount_usd: f64) -> bool {
        match self.limits.per_invocation_usd {
            Some(ceiling) => amount_usd > ceiling,
            None => false,
        }
    }

    /// Default cost estimate used when a request carries no explicit
    /// ceiling.
    pub fn default_invocation_estimate(&self) -> f64 {
        self.limits.per_invocation_usd.unwrap_or(1.0)
    }

    /// Append a spend record.
    pub async fn record_spend(&self, record: &NewBudgetRecord) -> anyhow::Result<()> {
        budget::record_spend(&self.pool, record).await?;
        Ok(())
    }

    /// Total spent on one task.
    pub async fn task_spent(&self, task_id: &str) -> anyhow::Result<f64> {
        budget::task_spent(&self.pool, task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_always_allows() {
        assert_eq!(decide(1_000_000.0, 50.0, None), BudgetDecision::Allow);
    }

    #[test]
    fn under_warn_fraction_allows() {
        // 50% of a $10 budget.
        assert_eq!(decide(4.0, 1.0, Some(10.0)), BudgetDecision::Allow);
    }

    #[test]
    fn warn_band_reports_percentage() {
        // 80% of a $10 budget.
        match decide(7.0, 1.0, Some(10.0)) {
            BudgetDecision::Warn { at_percent } => assert_eq!(at_percent, 80),
            other => panic!("expected Warn, got {other:?}"),
        }
    }

    #[test]
    fn eighty_nine_percent_does_not_escalate() {
        match decide(8.8, 0.1, Some(10.0)) {
            BudgetDecision::Warn { at_percent } => assert_eq!(at_percent, 89),
            other => panic!("expected Warn at 89%, got {other:?}"),
        }
    }

    #[test]
    fn ninety_percent_escalates() {
        assert_eq!(decide(8.9, 0.1, Some(10.0)), BudgetDecision::Escalate);
    }

    #[test]
    fn full_budget_aborts() {
        assert_eq!(decide(9.5, 0.5, Some(10.0)), BudgetDecision::Abort);
        assert_eq!(decide(20.0, 1.0, Some(10.0)), BudgetDecision::Abort);
    }

    #[test]
    fn zero_limit_aborts() {
        assert_eq!(decide(0.0, 0.01, Some(0.0)), BudgetDecision::Abort);
    }

    #[test]
    fn severity_order_for_combining() {
        assert!(BudgetDecision::Allow < BudgetDecision::Warn { at_percent: 75 });
        assert!(BudgetDecision::Warn { at_percent: 99 } < BudgetDecision::Escalate);
        assert!(BudgetDecision::Escalate < BudgetDecision::Abort);
    }

    #[test]
    fn invocation_ceiling() {
        let pool_less = BudgetConfig {
            per_invocation_usd: Some(2.0),
            ..Default::default()
        };
        // Pure logic, no pool needed.
        assert!(pool_less.per_invocation_usd.is_some_and(|c| 2.5 > c));
        assert!(!pool_less.per_invocation_usd.is_some_and(|c| 1.5 > c));
    }
}
