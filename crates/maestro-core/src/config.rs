//! Per-project configuration (`.project-config.json`).
//!
//! Every field is optional with a default. Schema validation on load is
//! advisory: violations are logged as warnings and the offending value is
//! replaced with its default, so configs written for a newer engine still
//! load.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// File name of the per-project configuration.
pub const CONFIG_FILE: &str = ".project-config.json";

fn default_validation_threshold() -> f64 {
    6.0
}
fn default_verification_threshold() -> f64 {
    7.0
}
fn default_max_phase_retries() -> u32 {
    3
}

/// Score thresholds and phase retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationConfig {
    /// Minimum review score for phase 2 approval.
    pub validation_threshold: f64,
    /// Minimum review score for phase 4 approval.
    pub verification_threshold: f64,
    pub max_phase_retries: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            validation_threshold: default_validation_threshold(),
            verification_threshold: default_verification_threshold(),
            max_phase_retries: default_max_phase_retries(),
        }
    }
}

/// Quality gates applied during verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityConfig {
    pub coverage_threshold: f64,
    pub coverage_blocking: bool,
    pub build_required: bool,
    pub lint_required: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: 70.0,
            coverage_blocking: false,
            build_required: true,
            lint_required: false,
        }
    }
}

/// Security scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub enabled: bool,
    pub blocking_severities: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocking_severities: vec!["high".to_string(), "critical".to_string()],
        }
    }
}

/// Workflow feature toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlags {
    /// Deprecated; superseded by `documentation_discovery`.
    pub product_validation: Option<bool>,
    pub documentation_discovery: Option<bool>,
    pub build_verification: bool,
    pub coverage_check: bool,
    pub security_scan: bool,
    pub approval_gates: bool,
    pub quality_gate: bool,
    pub dependency_check: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            product_validation: None,
            documentation_discovery: None,
            build_verification: true,
            coverage_check: false,
            security_scan: true,
            approval_gates: true,
            quality_gate: true,
            dependency_check: false,
        }
    }
}

/// Workflow-level knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowConfig {
    pub features: FeatureFlags,
    /// Phases (1-5) that require approval gates.
    pub approval_phases: Vec<i32>,
    pub parallel_workers: u32,
    pub review_gating: bool,
    /// Whether detected context drift blocks the phase (default: warn
    /// only).
    pub drift_blocking: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            features: FeatureFlags::default(),
            approval_phases: vec![2, 4],
            parallel_workers: 1,
            review_gating: true,
            drift_blocking: false,
        }
    }
}

/// Retry budgets and intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub agent_max_attempts: u32,
    pub agent_initial_interval_secs: f64,
    pub agent_backoff_factor: f64,
    pub jitter: bool,
    pub implementation_max_attempts: u32,
    pub implementation_initial_interval_secs: f64,
    /// Global circuit breaker across all nodes.
    pub max_total_retries: u32,
    pub max_task_loop_iterations: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            agent_max_attempts: 3,
            agent_initial_interval_secs: 1.0,
            agent_backoff_factor: 2.0,
            jitter: true,
            implementation_max_attempts: 2,
            implementation_initial_interval_secs: 5.0,
            max_total_retries: 10,
            max_task_loop_iterations: 50,
        }
    }
}

/// Dual-review behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReviewConfig {
    pub reviewer_timeout_seconds: u64,
    pub allow_single_agent_approval: bool,
    pub single_agent_score_penalty: f64,
    pub single_agent_minimum_score: f64,
    /// "any", "cursor", or "gemini".
    pub single_agent_preference: String,
    pub max_reviewer_retries: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            reviewer_timeout_seconds: 300,
            allow_single_agent_approval: true,
            single_agent_score_penalty: 1.0,
            single_agent_minimum_score: 7.5,
            single_agent_preference: "any".to_string(),
            max_reviewer_retries: 2,
        }
    }
}

/// Budget ceilings, all optional (absent means unlimited).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetConfig {
    pub task_budget_usd: Option<f64>,
    pub project_budget_usd: Option<f64>,
    pub per_invocation_usd: Option<f64>,
}

/// The full per-project configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub validation: ValidationConfig,
    pub quality: QualityConfig,
    pub security: SecurityConfig,
    pub workflow: WorkflowConfig,
    pub retry: RetryConfig,
    pub review: ReviewConfig,
    pub budget: BudgetConfig,
}

impl ProjectConfig {
    /// Load from `<project_dir>/.project-config.json`.
    ///
    /// Missing file yields defaults. A file that fails to parse also yields
    /// defaults with a warning: configuration errors are advisory here;
    /// genuinely fatal preconditions (missing spec) are checked by the
    /// orchestrator prerequisites instead.
    pub fn load(project_dir: &Path) -> Self {
        let path = project_dir.join(CONFIG_FILE);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Self::default();
        };

        let config: Self = match serde_json::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unparseable project config, using defaults");
                return Self::default();
            }
        };

        for issue in config.validate() {
            warn!(path = %path.display(), issue, "project config validation warning");
        }
        config
    }

    /// Advisory schema validation. Returns human-readable issues; the
    /// caller logs them and proceeds.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if !(0.0..=10.0).contains(&self.validation.validation_threshold) {
            issues.push(format!(
                "validation.validationThreshold {} outside [0, 10]",
                self.validation.validation_threshold
            ));
        }
        if !(0.0..=10.0).contains(&self.validation.verification_threshold) {
            issues.push(format!(
                "validation.verificationThreshold {} outside [0, 10]",
                self.validation.verification_threshold
            ));
        }
        if !(0.0..=100.0).contains(&self.quality.coverage_threshold) {
            issues.push(format!(
                "quality.coverageThreshold {} outside [0, 100]",
                self.quality.coverage_threshold
            ));
        }
        if self.workflow.parallel_workers == 0 {
            issues.push("workflow.parallelWorkers must be at least 1".to_string());
        }
        if self.retry.max_task_loop_iterations < 10 {
            issues.push(format!(
                "retry.maxTaskLoopIterations {} below minimum 10",
                self.retry.max_task_loop_iterations
            ));
        }
        if !["any", "cursor", "gemini"]
            .contains(&self.review.single_agent_preference.as_str())
        {
            issues.push(format!(
                "review.singleAgentPreference {:?} not one of any/cursor/gemini",
                self.review.single_agent_preference
            ));
        }
        if self
            .workflow
            .approval_phases
            .iter()
            .any(|p| !(1..=5).contains(p))
        {
            issues.push("workflow.approvalPhases entries must be in 1..=5".to_string());
        }

        issues
    }

    /// Resolve the documentation-discovery feature.
    ///
    /// `documentation_discovery` supersedes the deprecated
    /// `product_validation`; when both are present the newer flag wins and
    /// the deprecated one is flagged with a warning.
    pub fn documentation_discovery_enabled(&self) -> bool {
        let features = &self.workflow.features;
        match (features.documentation_discovery, features.product_validation) {
            (Some(newer), Some(_)) => {
                warn!(
                    "both productValidation (deprecated) and documentationDiscovery set; \
                     using documentationDiscovery"
                );
                newer
            }
            (Some(newer), None) => newer,
            (None, Some(deprecated)) => {
                warn!("productValidation is deprecated; use documentationDiscovery");
                deprecated
            }
            (None, None) => true,
        }
    }
}
