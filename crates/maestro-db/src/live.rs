//! Live subscription bus over PostgreSQL `LISTEN/NOTIFY`.
//!
//! Triggers installed by the migrations emit a small payload
//! (`{table, action, id}`) on the `maestro_events` channel after every
//! mutation. Subscribers get typed [`LiveEvent`]s and re-fetch rows they
//! care about.
//!
//! Every listener operation is bounded by a per-call timeout. The listener
//! borrows a pool connection; dropping it on any failure path returns the
//! slot and decrements the pool's counter in one step, so a failed
//! handshake can never leak a connection.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::warn;

use crate::order_by;

/// The NOTIFY channel all triggers publish to.
pub const EVENT_CHANNEL: &str = "maestro_events";

/// Timeout applied to each listener operation (connect, listen, recv).
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Kind of change that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiveEventType {
    Create,
    Update,
    Delete,
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub event_type: LiveEventType,
    pub table: String,
    pub record_id: String,
    /// Present only when the producer chose to inline row data; trigger
    /// payloads omit it to stay under the NOTIFY size limit.
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl LiveEvent {
    /// Parse a trigger payload. Malformed payloads yield `None`; the
    /// caller logs and keeps reading rather than crashing the consumer.
    pub fn from_payload(payload: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        let table = value.get("table")?.as_str()?.to_owned();
        let record_id = value.get("id")?.as_str()?.to_owned();
        let event_type = match value.get("action")?.as_str()? {
            "INSERT" => LiveEventType::Create,
            "UPDATE" => LiveEventType::Update,
            "DELETE" => LiveEventType::Delete,
            _ => return None,
        };
        Some(Self {
            event_type,
            table,
            record_id,
            data: value.get("data").cloned(),
            timestamp: Utc::now(),
        })
    }
}

/// An open subscription to the event channel, optionally filtered to one
/// table.
pub struct LiveSubscription {
    listener: PgListener,
    table_filter: Option<&'static str>,
}

/// Open a subscription on the shared pool.
///
/// `table` filters events to one table; it must name a table in the schema
/// allowlist (fatal otherwise). Both the connect and the LISTEN handshake
/// run under [`CALL_TIMEOUT`]; on either failure the partially-initialized
/// listener is dropped, which releases the acquired pool slot.
pub async fn subscribe(pool: &PgPool, table: Option<&str>) -> Result<LiveSubscription> {
    let table_filter = match table {
        Some(t) => Some(order_by::validate_table(t)?),
        None => None,
    };

    let mut listener = tokio::time::timeout(CALL_TIMEOUT, PgListener::connect_with(pool))
        .await
        .context("timed out acquiring listener connection")?
        .context("failed to acquire listener connection")?;

    // If LISTEN fails mid-handshake the listener is dropped here, returning
    // the pool slot it holds.
    tokio::time::timeout(CALL_TIMEOUT, listener.listen(EVENT_CHANNEL))
        .await
        .context("timed out issuing LISTEN")?
        .context("failed to issue LISTEN")?;

    Ok(LiveSubscription {
        listener,
        table_filter,
    })
}

impl LiveSubscription {
    /// Wait for the next matching event.
    ///
    /// Returns `Ok(None)` when no event arrives within `wait`; the caller
    /// decides whether to poll again. Malformed payloads are skipped with a
    /// WARN.
    pub async fn next_event(&mut self, wait: Duration) -> Result<Option<LiveEvent>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notification =
                match tokio::time::timeout_at(deadline, self.listener.recv()).await {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(e).context("listener connection lost"),
                    Err(_) => return Ok(None),
                };

            let Some(event) = LiveEvent::from_payload(notification.payload()) else {
                warn!(
                    payload = notification.payload(),
                    "skipping malformed live event payload"
                );
                continue;
            };

            if let Some(filter) = self.table_filter
                && event.table != filter
            {
                continue;
            }

            return Ok(Some(event));
        }
    }

    /// Convert into an endless event stream. Connection errors end the
    /// stream after a WARN; malformed payloads are skipped.
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = LiveEvent> + Send>> {
        let mut listener = self.listener;
        let filter = self.table_filter;

        let stream = async_stream::stream! {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Some(event) = LiveEvent::from_payload(notification.payload()) else {
                            warn!(
                                payload = notification.payload(),
                                "skipping malformed live event payload"
                            );
                            continue;
                        };
                        if let Some(f) = filter
                            && event.table != f
                        {
                            continue;
                        }
                        yield event;
                    }
                    Err(e) => {
                        warn!(error = %e, "live subscription connection lost, ending stream");
                        break;
                    }
                }
            }
        };

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_insert_payload() {
        let event =
            LiveEvent::from_payload(r#"{"table":"tasks","action":"INSERT","id":"T1"}"#)
                .expect("should parse");
        assert_eq!(event.event_type, LiveEventType::Create);
        assert_eq!(event.table, "tasks");
        assert_eq!(event.record_id, "T1");
        assert!(event.data.is_none());
    }

    #[test]
    fn parse_update_and_delete_actions() {
        let update =
            LiveEvent::from_payload(r#"{"table":"tasks","action":"UPDATE","id":"T1"}"#).unwrap();
        assert_eq!(update.event_type, LiveEventType::Update);

        let delete =
            LiveEvent::from_payload(r#"{"table":"tasks","action":"DELETE","id":"T1"}"#).unwrap();
        assert_eq!(delete.event_type, LiveEventType::Delete);
    }

    #[test]
    fn parse_inline_data() {
        let event = LiveEvent::from_payload(
            r#"{"table":"tasks","action":"UPDATE","id":"T1","data":{"status":"completed"}}"#,
        )
        .unwrap();
        assert_eq!(event.data.unwrap()["status"], "completed");
    }

    #[test]
    fn malformed_payloads_yield_none() {
        assert!(LiveEvent::from_payload("not json").is_none());
        assert!(LiveEvent::from_payload(r#"{"table":"tasks"}"#).is_none());
        assert!(
            LiveEvent::from_payload(r#"{"table":"tasks","action":"TRUNCATE","id":"x"}"#)
                .is_none()
        );
    }
}
