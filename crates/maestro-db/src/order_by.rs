//! SQL identifier validation.
//!
//! Every identifier (table name, column name) that ends up interpolated
//! into query text must pass through this module. Values never do; they go
//! through bind parameters.

use anyhow::{Result, bail};
use tracing::warn;

/// Column that every table can be ordered by, and the fallback for any
/// invalid `order_by` request.
pub const DEFAULT_ORDER_COLUMN: &str = "created_at";

/// Tables known to this schema. Anything else is a construction error.
const TABLES: &[&str] = &[
    "workflow_state",
    "tasks",
    "audit_entries",
    "sessions",
    "budget_records",
    "checkpoints",
];

/// Per-table allowlists of orderable columns.
fn order_columns(table: &str) -> Option<&'static [&'static str]> {
    match table {
        "workflow_state" => Some(&["created_at", "updated_at", "current_phase"]),
        "tasks" => Some(&[
            "created_at",
            "updated_at",
            "id",
            "title",
            "status",
            "priority",
            "attempts",
        ]),
        "audit_entries" => Some(&["created_at", "agent", "task_id", "status", "cost_usd"]),
        "sessions" => Some(&["created_at", "updated_at", "task_id", "agent", "status"]),
        "budget_records" => Some(&["created_at", "task_id", "agent", "cost_usd"]),
        "checkpoints" => Some(&["created_at", "name", "phase"]),
        _ => None,
    }
}

/// Validate a table name against the schema allowlist. Fatal on mismatch:
/// an unknown table in templated SQL is a programming error, not user
/// input to be tolerated.
pub fn validate_table(table: &str) -> Result<&'static str> {
    match TABLES.iter().copied().find(|t| *t == table) {
        Some(t) => Ok(t),
        None => bail!("table {table:?} is not in the schema allowlist"),
    }
}

/// Validate an `order_by` request against the table's column allowlist.
///
/// Invalid input (SQL keywords, unknown columns, anything with punctuation
/// or whitespace) degrades to `created_at` with a WARN. This is the only
/// tolerated path for caller-supplied identifiers.
pub fn validate_order_by(table: &str, requested: &str) -> &'static str {
    let Some(columns) = order_columns(table) else {
        warn!(table, "order_by requested on unknown table, using default");
        return DEFAULT_ORDER_COLUMN;
    };

    match columns.iter().copied().find(|c| *c == requested) {
        Some(c) => c,
        None => {
            warn!(
                table,
                requested, "invalid order_by column, falling back to created_at"
            );
            DEFAULT_ORDER_COLUMN
        }
    }
}

/// Validate a bare SQL identifier (database names, notify channels).
///
/// Accepts ASCII alphanumerics and underscores only, and must not start
/// with a digit. Anything else is fatal.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_first || !valid_rest {
        bail!("identifier {name:?} contains invalid characters");
    }
    Ok(name)
}
