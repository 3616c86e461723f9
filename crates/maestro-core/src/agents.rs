//! The `AgentCli` trait -- the adapter interface for agent command lines.
//!
//! Each concrete agent (Claude Code as planner/implementer, Cursor and
//! Gemini as reviewers) implements this trait. The trait is intentionally
//! object-safe so adapters can be handled as `&dyn AgentCli` throughout the
//! invoker and phase nodes.

use std::time::Duration;

use async_trait::async_trait;

/// What an invocation needs from the caller.
#[derive(Debug, Clone, Default)]
pub struct InvocationRequest {
    /// Task this invocation is scoped to, when any.
    pub task_id: Option<String>,
    /// The prompt. Hashed (never stored) by the audit layer.
    pub prompt: String,
    /// Session continuity args from the session manager
    /// (`--resume <id>` or `--session-id <id>`).
    pub session_args: Vec<String>,
    /// Per-call wall-clock override.
    pub timeout: Option<Duration>,
    /// Per-call cost ceiling override.
    pub max_cost_usd: Option<f64>,
    /// Tool patterns the agent may use.
    pub allowed_tools: Vec<String>,
}

/// Adapter interface for one agent CLI.
///
/// # Object Safety
///
/// Every method returns a concrete type (or boxes through `async_trait`),
/// so the trait can be used as `&dyn AgentCli` / `Box<dyn AgentCli>`.
#[async_trait]
pub trait AgentCli: Send + Sync {
    /// Short name used in audit entries and logs ("claude", "cursor",
    /// "gemini").
    fn name(&self) -> &str;

    /// Binary to spawn (resolved via `$PATH` unless overridden).
    fn binary(&self) -> &str;

    /// Context file this agent reads from the project root, tracked for
    /// drift detection.
    fn context_file(&self) -> Option<&str>;

    /// Build the argument vector for a request. The prompt always travels
    /// as an argument to `-p`; session args are appended verbatim.
    fn build_args(&self, req: &InvocationRequest) -> Vec<String>;

    /// Wall clock applied when the request carries no override.
    fn default_timeout(&self) -> Duration;

    /// Whether the CLI is installed: runs `<binary> --version` with a
    /// short timeout.
    async fn check_available(&self) -> bool {
        let child = tokio::process::Command::new(self.binary())
            .arg("--version")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();

        let Ok(mut child) = child else {
            return false;
        };

        match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(Ok(status)) => status.success(),
            _ => {
                let _ = child.kill().await;
                false
            }
        }
    }
}

// Compile-time assertion: AgentCli must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentCli) {}
};

// ---------------------------------------------------------------------------
// Claude Code -- planner and implementer
// ---------------------------------------------------------------------------

/// Adapter for the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    binary: String,
}

impl ClaudeCli {
    pub fn new() -> Self {
        Self {
            binary: "claude".to_string(),
        }
    }

    /// Override the binary path (tests point this at a shell script).
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }
}

impl Default for ClaudeCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentCli for ClaudeCli {
    fn name(&self) -> &str {
        "claude"
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn context_file(&self) -> Option<&str> {
        Some("CLAUDE.md")
    }

    fn build_args(&self, req: &InvocationRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            req.prompt.clone(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if !req.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(req.allowed_tools.join(","));
        }
        args.extend(req.session_args.iter().cloned());
        args
    }

    fn default_timeout(&self) -> Duration {
        // Implementation runs are long; ten minutes before the invoker
        // cuts the process down.
        Duration::from_secs(600)
    }
}

// ---------------------------------------------------------------------------
// Cursor -- reviewer (code quality / security focus)
// ---------------------------------------------------------------------------

/// Adapter for the Cursor CLI.
#[derive(Debug, Clone)]
pub struct CursorCli {
    binary: String,
}

impl CursorCli {
    pub fn new() -> Self {
        Self {
            binary: "cursor-agent".to_string(),
        }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }
}

impl Default for CursorCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentCli for CursorCli {
    fn name(&self) -> &str {
        "cursor"
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn context_file(&self) -> Option<&str> {
        Some(".cursor/rules")
    }

    fn build_args(&self, req: &InvocationRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            req.prompt.clone(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        args.extend(req.session_args.iter().cloned());
        args
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(300)
    }
}

// ---------------------------------------------------------------------------
// Gemini -- reviewer (architecture focus)
// ---------------------------------------------------------------------------

/// Adapter for the Gemini CLI.
#[derive(Debug, Clone)]
pub struct GeminiCli {
    binary: String,
}

impl GeminiCli {
    pub fn new() -> Self {
        Self {
            binary: "gemini".to_string(),
        }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }
}

impl Default for GeminiCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentCli for GeminiCli {
    fn name(&self) -> &str {
        "gemini"
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn context_file(&self) -> Option<&str> {
        Some("GEMINI.md")
    }

    fn build_args(&self, req: &InvocationRequest) -> Vec<String> {
        let mut args = vec!["-p".to_string(), req.prompt.clone(), "--json".to_string()];
        args.extend(req.session_args.iter().cloned());
        args
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> InvocationRequest {
        InvocationRequest {
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn claude_args_include_prompt_and_format() {
        let cli = ClaudeCli::new();
        let args = cli.build_args(&request("plan the feature"));
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "plan the feature");
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"json".to_string()));
    }

    #[test]
    fn claude_args_append_tools_and_session() {
        let cli = ClaudeCli::new();
        let mut req = request("implement T1");
        req.allowed_tools = vec!["Read".to_string(), "Edit".to_string()];
        req.session_args = vec!["--resume".to_string(), "T1-abc123def456".to_string()];
        let args = cli.build_args(&req);

        let tools_pos = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert_eq!(args[tools_pos + 1], "Read,Edit");
        assert_eq!(args[args.len() - 2], "--resume");
        assert_eq!(args[args.len() - 1], "T1-abc123def456");
    }

    #[test]
    fn reviewer_context_files() {
        assert_eq!(CursorCli::new().context_file(), Some(".cursor/rules"));
        assert_eq!(GeminiCli::new().context_file(), Some("GEMINI.md"));
        assert_eq!(ClaudeCli::new().context_file(), Some("CLAUDE.md"));
    }

    #[test]
    fn adapters_are_object_safe() {
        let agents: Vec<Box<dyn AgentCli>> = vec![
            Box::new(ClaudeCli::new()),
            Box::new(CursorCli::new()),
            Box::new(GeminiCli::new()),
        ];
        let names: Vec<&str> = agents.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["claude", "cursor", "gemini"]);
    }

    #[tokio::test]
    async fn check_available_false_for_missing_binary() {
        let cli = ClaudeCli::with_binary("/nonexistent/path/to/claude");
        assert!(!cli.check_available().await);
    }

    #[tokio::test]
    async fn check_available_true_for_working_binary() {
        // `sh --version`... not portable; use a script.
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("fake_agent.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let cli = ClaudeCli::with_binary(script.to_str().unwrap());
        assert!(cli.check_available().await);
    }
}
