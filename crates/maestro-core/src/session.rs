//! Per-task CLI continuity sessions.
//!
//! A session lets an agent resume its prior conversation across
//! invocations within one task. Sessions are scoped per (task, agent):
//! iterations within a task share one session, a new task always starts
//! fresh so context never bleeds across tasks.

use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{debug, info};

use maestro_db::models::Session;
use maestro_db::queries::sessions;

/// Advisory session expiry; explicit close remains authoritative.
pub const SESSION_TTL_HOURS: i64 = 24;

/// Manages continuity sessions backed by the `sessions` table.
#[derive(Debug, Clone)]
pub struct SessionManager {
    pool: PgPool,
    ttl_hours: i64,
}

impl SessionManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ttl_hours: SESSION_TTL_HOURS,
        }
    }

    pub fn with_ttl_hours(pool: PgPool, ttl_hours: i64) -> Self {
        Self { pool, ttl_hours }
    }

    /// Get the active session for a (task, agent) pair, creating one when
    /// absent. A second call without an intervening close returns the same
    /// session id.
    pub async fn get_or_create(&self, task_id: &str, agent: &str) -> anyhow::Result<Session> {
        if let Some(session) = sessions::get_active(&self.pool, task_id, agent).await? {
            return Ok(session);
        }

        // Replacement-on-new-task: any stale active row for this pair is
        // closed before inserting (covers races with TTL cleanup).
        sessions::close_active(&self.pool, task_id, agent).await?;

        let id = generate_session_id(task_id);
        let session = sessions::insert_session(&self.pool, &id, task_id, agent).await?;
        info!(task_id, agent, session_id = %session.id, "created session");
        Ok(session)
    }

    /// CLI arguments for the next invocation of this (task, agent) pair.
    ///
    /// `--resume <id>` when the session has been used before, otherwise
    /// `--session-id <id>` so the CLI adopts the generated id on first use.
    pub async fn cli_args(&self, task_id: &str, agent: &str) -> anyhow::Result<Vec<String>> {
        let session = self.get_or_create(task_id, agent).await?;
        let args = if session.invocation_count > 0 {
            vec!["--resume".to_string(), session.id]
        } else {
            vec!["--session-id".to_string(), session.id]
        };
        Ok(args)
    }

    /// Record one invocation against the session: bump the count and fold
    /// in cost.
    pub async fn touch(&self, session_id: &str, cost_usd: f64) -> anyhow::Result<()> {
        let rows = sessions::touch(&self.pool, session_id, cost_usd).await?;
        if rows == 0 {
            debug!(session_id, "touch on closed or missing session ignored");
        }
        Ok(())
    }

    /// Close the session for a task (on completion or permanent failure).
    /// Explicit close is authoritative.
    pub async fn close(&self, task_id: &str, agent: &str) -> anyhow::Result<bool> {
        let rows = sessions::close_active(&self.pool, task_id, agent).await?;
        if rows > 0 {
            info!(task_id, agent, "closed session");
        }
        Ok(rows > 0)
    }

    /// Close sessions idle past the TTL. Advisory cleanup; returns the
    /// number closed.
    pub async fn cleanup_expired(&self) -> anyhow::Result<u64> {
        let closed = sessions::close_expired(&self.pool, self.ttl_hours).await?;
        if closed > 0 {
            info!(closed, "closed expired sessions");
        }
        Ok(closed)
    }
}

/// Generate a session id of the form `<task_id>-<12 hex>`.
///
/// The suffix hashes task id, wall clock, and fresh randomness, so
/// replacement sessions for the same task never collide.
pub fn generate_session_id(task_id: &str) -> String {
    let mut random = [0u8; 4];
    rand::rng().fill_bytes(&mut random);

    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(Utc::now().to_rfc3339().as_bytes());
    hasher.update(random);
    let digest = hasher.finalize();

    format!("{task_id}-{}", &hex::encode(digest)[..12])
}
