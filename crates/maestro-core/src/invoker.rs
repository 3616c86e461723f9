//! Agent invoker: spawns an agent CLI with bounded time and cost, captures
//! output, parses JSON (with a lenient fallback), records an audit entry,
//! and keeps the session record current.
//!
//! The invoker never returns `Err`: every failure mode is folded into the
//! returned [`InvocationResult`] and callers inspect it. Raising across
//! the scheduler boundary is reserved for programming errors.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{debug, warn};

use maestro_db::models::InvocationStatus;
use maestro_db::queries::audit::{self, AuditResult, NewAuditEntry};
use maestro_db::queries::budget::NewBudgetRecord;

use crate::agents::{AgentCli, InvocationRequest};
use crate::budget::BudgetEnforcer;
use crate::jsonx;
use crate::retry::RetryPolicy;
use crate::session::SessionManager;

/// How the agent's stdout parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedKind {
    /// Whole stdout was valid JSON.
    Json,
    /// A balanced JSON object was extracted from noisy output.
    ExtractedJson,
    /// No JSON found; `output` holds raw text.
    None,
}

impl ParsedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::ExtractedJson => "extracted_json",
            Self::None => "none",
        }
    }
}

/// Everything a caller learns from one invocation.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub success: bool,
    pub status: InvocationStatus,
    pub output: String,
    pub parsed: Option<serde_json::Value>,
    pub parsed_kind: ParsedKind,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub retryable: bool,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
}

impl InvocationResult {
    fn failure(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            status: InvocationStatus::Failed,
            output: String::new(),
            parsed: None,
            parsed_kind: ParsedKind::None,
            error: Some(error.into()),
            exit_code: None,
            duration: Duration::ZERO,
            retryable,
            session_id: None,
            cost_usd: None,
        }
    }
}

/// Environment variable name patterns that must never reach a child
/// process. The list deliberately covers database credentials and engine
/// internals; the agent's own API credentials stay, since the CLI cannot
/// authenticate without them.
const SECRET_PATTERNS: &[&str] = &["PASSWORD", "SECRET", "DATABASE_URL"];

fn is_secret_var(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SECRET_PATTERNS.iter().any(|p| upper.contains(p))
        || upper.starts_with("MAESTRO_")
        || upper == "PGPASSFILE"
}

/// Environment for agent subprocesses: the parent env minus secrets, plus
/// `TERM=dumb` so CLIs skip interactive rendering.
pub fn scrubbed_env() -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(name, _)| !is_secret_var(name))
        .collect();
    env.push(("TERM".to_string(), "dumb".to_string()));
    env
}

/// Error strings that mark a failed invocation as retryable.
fn is_retryable_stderr(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    ["rate limit", "timeout", "timed out", "overloaded", "temporarily", "connection reset"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Pull a session id out of parsed output or raw text.
///
/// Checks `session_id` / `metadata.session_id` keys first, then the
/// loose `Session: <id>` textual form some CLIs print.
fn extract_session_id(parsed: Option<&serde_json::Value>, output: &str) -> Option<String> {
    if let Some(value) = parsed {
        if let Some(id) = value.get("session_id").and_then(|v| v.as_str()) {
            return Some(id.to_string());
        }
        if let Some(id) = value
            .get("metadata")
            .and_then(|m| m.get("session_id"))
            .and_then(|v| v.as_str())
        {
            return Some(id.to_string());
        }
    }

    for line in output.lines() {
        let lower = line.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("session:") {
            let id: String = rest
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect();
            if !id.is_empty() {
                // Preserve original casing from the source line.
                let offset = line.len() - rest.len() + (rest.len() - rest.trim_start().len());
                return Some(line[offset..offset + id.len()].to_string());
            }
        }
    }
    None
}

/// Pull a cost figure out of parsed output.
fn extract_cost(parsed: Option<&serde_json::Value>) -> Option<f64> {
    let value = parsed?;
    for key in ["total_cost_usd", "cost_usd", "cost"] {
        if let Some(cost) = value.get(key).and_then(|v| v.as_f64()) {
            return Some(cost);
        }
    }
    None
}

/// Pull token usage `(input, output)` out of parsed output.
fn extract_token_usage(parsed: Option<&serde_json::Value>) -> Option<(i64, i64)> {
    let usage = parsed?.get("usage")?;
    let input = usage.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    Some((input, output))
}

/// Spawns agent CLIs and records the full audit trail.
#[derive(Clone)]
pub struct AgentInvoker {
    pool: PgPool,
    enforcer: BudgetEnforcer,
    sessions: SessionManager,
    working_dir: PathBuf,
}

impl AgentInvoker {
    pub fn new(
        pool: PgPool,
        enforcer: BudgetEnforcer,
        sessions: SessionManager,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            pool,
            enforcer,
            sessions,
            working_dir,
        }
    }

    /// Run one agent invocation end to end in the configured working
    /// directory.
    pub async fn invoke(&self, cli: &dyn AgentCli, req: &InvocationRequest) -> InvocationResult {
        let dir = self.working_dir.clone();
        self.invoke_in_dir(cli, req, &dir).await
    }

    /// Invoke with the agent retry policy: retryable failures (timeouts,
    /// rate limits, unparseable output) are re-attempted with backoff;
    /// hard failures return immediately.
    pub async fn invoke_with_retry(
        &self,
        cli: &dyn AgentCli,
        req: &InvocationRequest,
        policy: &RetryPolicy,
    ) -> InvocationResult {
        let mut attempt = 0u32;
        loop {
            let result = self.invoke(cli, req).await;
            if result.success || !result.retryable {
                return result;
            }
            attempt += 1;
            if attempt >= policy.max_attempts {
                return result;
            }
            let delay = policy.delay_for(attempt);
            warn!(
                agent = cli.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retryable agent failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run one agent invocation end to end, from an explicit directory
    /// (parallel batch workers run from their worktrees).
    ///
    /// Contract, in order: budget consult, audit open, spawn with scrubbed
    /// env, wall-clock timeout, lenient JSON parse, audit finish, session
    /// update. Never raises; the result carries the failure mode.
    pub async fn invoke_in_dir(
        &self,
        cli: &dyn AgentCli,
        req: &InvocationRequest,
        working_dir: &std::path::Path,
    ) -> InvocationResult {
        // 1. Budget: refuse outright when the call exceeds the
        //    per-invocation ceiling.
        let estimate = req
            .max_cost_usd
            .unwrap_or_else(|| self.enforcer.default_invocation_estimate());
        if self.enforcer.exceeds_invocation_ceiling(estimate) {
            warn!(
                agent = cli.name(),
                estimate, "invocation refused: exceeds per-invocation budget ceiling"
            );
            return InvocationResult::failure(
                format!("estimated cost ${estimate:.2} exceeds per-invocation ceiling"),
                false,
            );
        }

        let args = cli.build_args(req);

        // 2. Open the audit entry. The prompt is hashed, never stored.
        let prompt_hash = hex::encode(Sha256::digest(req.prompt.as_bytes()));
        let audit_id = match audit::open_entry(
            &self.pool,
            &NewAuditEntry {
                agent: cli.name().to_string(),
                task_id: req.task_id.clone(),
                session_id: None,
                prompt_hash,
                prompt_length: req.prompt.len() as i64,
                command_args: args.clone(),
            },
        )
        .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                // An unauditable invocation still runs; losing the audit
                // row is logged loudly but does not block the workflow.
                warn!(agent = cli.name(), error = %e, "failed to open audit entry");
                None
            }
        };

        // 3. Spawn with a clean environment.
        let start = Instant::now();
        let timeout = req.timeout.unwrap_or_else(|| cli.default_timeout());

        let spawned = tokio::process::Command::new(cli.binary())
            .args(&args)
            .env_clear()
            .envs(scrubbed_env())
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let result = InvocationResult::failure(
                    format!("failed to spawn {} -- is it installed and on PATH? ({e})", cli.binary()),
                    false,
                );
                self.finish_audit(audit_id, &result).await;
                return result;
            }
        };

        // 4. Enforce the wall clock.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let mut result =
                    InvocationResult::failure(format!("failed to collect agent output: {e}"), true);
                result.duration = start.elapsed();
                self.finish_audit(audit_id, &result).await;
                return result;
            }
            Err(_elapsed) => {
                // kill_on_drop reaps the child when the future is dropped
                // by the timeout.
                warn!(agent = cli.name(), timeout_secs = timeout.as_secs(), "agent timed out");
                let mut result = InvocationResult::failure(
                    format!("agent timed out after {} seconds", timeout.as_secs()),
                    true,
                );
                result.status = InvocationStatus::Timeout;
                result.duration = timeout;
                self.finish_audit(audit_id, &result).await;
                return result;
            }
        };

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();

        // 5. Parse: strict JSON, then balanced-object extraction.
        let (parsed, parsed_kind) = match jsonx::parse_lenient(&stdout) {
            Some((value, false)) => (Some(value), ParsedKind::Json),
            Some((value, true)) => (Some(value), ParsedKind::ExtractedJson),
            None => (None, ParsedKind::None),
        };

        let cost_usd = extract_cost(parsed.as_ref());
        let session_id = extract_session_id(parsed.as_ref(), &stdout);
        let token_usage = extract_token_usage(parsed.as_ref());

        let result = if output.status.success() {
            InvocationResult {
                success: true,
                status: InvocationStatus::Success,
                output: stdout,
                parsed,
                parsed_kind,
                // Unparseable output is a partial success: retryable so
                // the caller may re-prompt for well-formed JSON.
                retryable: parsed_kind == ParsedKind::None,
                error: if stderr.is_empty() { None } else { Some(stderr) },
                exit_code,
                duration,
                session_id: session_id.clone(),
                cost_usd,
            }
        } else {
            let retryable = is_retryable_stderr(&stderr);
            InvocationResult {
                success: false,
                status: InvocationStatus::Failed,
                output: stdout,
                parsed,
                parsed_kind,
                retryable,
                error: Some(if stderr.is_empty() {
                    format!("exit code {}", exit_code.unwrap_or(-1))
                } else {
                    stderr
                }),
                exit_code,
                duration,
                session_id: session_id.clone(),
                cost_usd,
            }
        };

        // 6. Commit the audit result.
        self.finish_audit(audit_id, &result).await;

        // 7. Session + spend bookkeeping.
        if let Some(task_id) = &req.task_id {
            if let Some(sid) = &session_id {
                if let Some(id) = audit_id
                    && let Err(e) = audit::set_session_id(&self.pool, id, sid).await
                {
                    warn!(error = %e, "failed to record session id on audit entry");
                }
                if let Err(e) = self.sessions.touch(sid, cost_usd.unwrap_or(0.0)).await {
                    warn!(task_id, error = %e, "failed to touch session");
                }
            }
            if let Some(cost) = cost_usd {
                let record = NewBudgetRecord {
                    task_id: task_id.clone(),
                    agent: cli.name().to_string(),
                    cost_usd: cost,
                    tokens_input: token_usage.map(|(i, _)| i),
                    tokens_output: token_usage.map(|(_, o)| o),
                    model: result
                        .parsed
                        .as_ref()
                        .and_then(|v| v.get("model"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                };
                if let Err(e) = self.enforcer.record_spend(&record).await {
                    warn!(task_id, error = %e, "failed to record spend");
                }
            }
        }

        debug!(
            agent = cli.name(),
            success = result.success,
            parsed = result.parsed_kind.as_str(),
            duration_ms = duration.as_millis() as u64,
            "invocation finished"
        );

        result
    }

    async fn finish_audit(&self, audit_id: Option<uuid::Uuid>, result: &InvocationResult) {
        let Some(id) = audit_id else { return };
        let audit_result = AuditResult {
            exit_code: result.exit_code,
            status: result.status,
            duration_seconds: result.duration.as_secs_f64(),
            output_length: result.output.len() as i64,
            error_length: result.error.as_deref().map(str::len).unwrap_or(0) as i64,
            parsed_output_type: result.parsed_kind.as_str().to_string(),
            cost_usd: result.cost_usd,
            model: result
                .parsed
                .as_ref()
                .and_then(|v| v.get("model"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
        };
        if let Err(e) = audit::finish_entry(&self.pool, id, &audit_result).await {
            warn!(audit_id = %id, error = %e, "failed to finish audit entry");
        }
    }
}
