//! Parallel reviewer fan-out with one unified timeout.
//!
//! Both reviewers launch concurrently under a single shared deadline --
//! never stacked per-future timeouts, which make the worst case the sum
//! of both. Futures still pending at the deadline are aborted, and the
//! result shape is always `(cursor, gemini)`: a timed-out slot carries an
//! explicit error string instead of a missing value.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::warn;

use super::feedback::Feedback;

/// What one reviewer produced, or why it did not.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub feedback: Option<Feedback>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl ReviewOutcome {
    pub fn usable(&self) -> bool {
        self.feedback.is_some()
    }

    fn timed_out(timeout: Duration) -> Self {
        Self {
            feedback: None,
            error: Some(format!(
                "review timed out after {} seconds",
                timeout.as_secs()
            )),
            duration: timeout,
        }
    }

    fn join_failed(e: &tokio::task::JoinError) -> Self {
        Self {
            feedback: None,
            error: Some(format!("review task failed: {e}")),
            duration: Duration::ZERO,
        }
    }
}

/// Run both reviewers concurrently under one deadline.
///
/// Returns `(cursor, gemini)` unconditionally. Whichever future is still
/// running at the deadline is cancelled via `JoinHandle::abort` before
/// this function returns.
pub async fn run_dual_review<C, G>(
    cursor_fut: C,
    gemini_fut: G,
    timeout: Duration,
) -> (ReviewOutcome, ReviewOutcome)
where
    C: Future<Output = ReviewOutcome> + Send + 'static,
    G: Future<Output = ReviewOutcome> + Send + 'static,
{
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + timeout;

    let cursor_handle = tokio::spawn(cursor_fut);
    let gemini_handle = tokio::spawn(gemini_fut);
    let cursor_abort = cursor_handle.abort_handle();
    let gemini_abort = gemini_handle.abort_handle();

    // Awaiting sequentially against the *same* deadline keeps the total
    // wall clock at `timeout`, not `2 * timeout`. A handle still pending
    // at the deadline is aborted: dropping it alone would detach the task
    // and let a hung reviewer run on in the background.
    let cursor = match tokio::time::timeout_at(deadline, cursor_handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(error = %e, "cursor review task panicked or was cancelled");
            ReviewOutcome::join_failed(&e)
        }
        Err(_) => {
            cursor_abort.abort();
            ReviewOutcome::timed_out(timeout)
        }
    };

    let gemini = match tokio::time::timeout_at(deadline, gemini_handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(error = %e, "gemini review task panicked or was cancelled");
            ReviewOutcome::join_failed(&e)
        }
        Err(_) => {
            gemini_abort.abort();
            ReviewOutcome::timed_out(timeout)
        }
    };

    if cursor.feedback.is_none() || gemini.feedback.is_none() {
        warn!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            cursor_ok = cursor.usable(),
            gemini_ok = gemini.usable(),
            "dual review finished with missing results"
        );
    }

    (cursor, gemini)
}
