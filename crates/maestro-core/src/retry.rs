//! Retry policies with exponential backoff and jitter, plus the global
//! retry circuit breaker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Backoff schedule for one class of operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Agent invocations: 3 attempts, 1 s initial, x2 backoff, jitter.
    pub fn for_agents(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.agent_max_attempts,
            initial_interval: Duration::from_secs_f64(config.agent_initial_interval_secs),
            backoff_factor: config.agent_backoff_factor,
            jitter: config.jitter,
        }
    }

    /// Implementation passes: 2 attempts, 5 s initial.
    pub fn for_implementation(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.implementation_max_attempts,
            initial_interval: Duration::from_secs_f64(
                config.implementation_initial_interval_secs,
            ),
            backoff_factor: config.agent_backoff_factor,
            jitter: config.jitter,
        }
    }

    /// Delay before retry number `attempt` (1-based; attempt 0 is the
    /// first try and has no delay). Jitter adds up to 50% of the base.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base =
            self.initial_interval.as_secs_f64() * self.backoff_factor.powi(attempt as i32 - 1);
        let with_jitter = if self.jitter {
            base * (1.0 + rand::rng().random_range(0.0..0.5))
        } else {
            base
        };
        Duration::from_secs_f64(with_jitter)
    }
}

/// Global retry counter shared across all nodes.
///
/// Per-node budgets bound local churn; this bounds the whole run. Once
/// the total crosses `max_total_retries` every further retry request is
/// denied and the caller escalates to a human, regardless of how much
/// per-node budget remains.
#[derive(Debug, Clone)]
pub struct RetryBreaker {
    total: Arc<AtomicU32>,
    max_total: u32,
}

impl RetryBreaker {
    pub fn new(max_total: u32) -> Self {
        Self {
            total: Arc::new(AtomicU32::new(0)),
            max_total,
        }
    }

    /// Register one retry. Returns `false` when the breaker has tripped
    /// and the retry must not run.
    pub fn try_retry(&self) -> bool {
        let previous = self.total.fetch_add(1, Ordering::SeqCst);
        previous < self.max_total
    }

    pub fn total_retries(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn tripped(&self) -> bool {
        self.total.load(Ordering::SeqCst) >= self.max_total
    }
}
