//! Normalized reviewer feedback.
//!
//! Agents return loosely-shaped JSON; everything is normalized into the
//! [`Assessment`] tagged union before any engine logic looks at it. A
//! reviewer that produced nothing usable becomes an explicit
//! `Reject { score: 0 }` carrying the error, never a missing value.

use serde::{Deserialize, Serialize};

/// Severity of a reviewer concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

/// One concern raised by a reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concern {
    pub severity: Severity,
    pub area: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// The reviewer's verdict, tagged by `overall_assessment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "overall_assessment", rename_all = "snake_case")]
pub enum Assessment {
    Approve {
        score: f64,
        #[serde(default)]
        strengths: Vec<String>,
    },
    ApproveWithChanges {
        score: f64,
        #[serde(default)]
        concerns: Vec<Concern>,
    },
    Reject {
        score: f64,
        #[serde(default)]
        blocking_issues: Vec<String>,
    },
}

impl Assessment {
    pub fn score(&self) -> f64 {
        match self {
            Self::Approve { score, .. }
            | Self::ApproveWithChanges { score, .. }
            | Self::Reject { score, .. } => *score,
        }
    }

    /// Whether the verdict is on the approving side (with or without
    /// changes).
    pub fn is_approving(&self) -> bool {
        !matches!(self, Self::Reject { .. })
    }
}

/// Normalized output of one reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub reviewer: String,
    #[serde(flatten)]
    pub assessment: Assessment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_created: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results: Option<serde_json::Value>,
}

impl Feedback {
    pub fn score(&self) -> f64 {
        self.assessment.score()
    }

    pub fn is_approving(&self) -> bool {
        self.assessment.is_approving()
    }

    /// All concerns, regardless of variant shape.
    pub fn concerns(&self) -> &[Concern] {
        match &self.assessment {
            Assessment::ApproveWithChanges { concerns, .. } => concerns,
            _ => &[],
        }
    }
}

fn clamp_score(raw: Option<f64>) -> f64 {
    raw.unwrap_or(0.0).clamp(0.0, 10.0)
}

fn parse_concerns(value: &serde_json::Value) -> Vec<Concern> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let description = item
                .get("description")
                .and_then(|d| d.as_str())
                .or_else(|| item.as_str())?
                .to_string();
            let severity = match item.get("severity").and_then(|s| s.as_str()) {
                Some("high") => Severity::High,
                Some("low") => Severity::Low,
                _ => Severity::Medium,
            };
            Some(Concern {
                severity,
                area: item
                    .get("area")
                    .and_then(|a| a.as_str())
                    .unwrap_or("general")
                    .to_string(),
                description,
                suggestion: item
                    .get("suggestion")
                    .or_else(|| item.get("recommendation"))
                    .and_then(|s| s.as_str())
                    .map(str::to_string),
            })
        })
        .collect()
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Normalize arbitrary agent output into a [`Feedback`].
///
/// `value` is the parsed JSON if any; `error` is the invocation-level
/// failure if any. Output that cannot be interpreted becomes a zero-score
/// rejection carrying the reason, so downstream logic always has a
/// concrete verdict to work with.
pub fn normalize_feedback(
    reviewer: &str,
    value: Option<&serde_json::Value>,
    error: Option<&str>,
) -> Feedback {
    let rejected = |message: String| Feedback {
        reviewer: reviewer.to_string(),
        assessment: Assessment::Reject {
            score: 0.0,
            blocking_issues: vec![message.clone()],
        },
        error: Some(message),
        files_modified: Vec::new(),
        files_created: Vec::new(),
        test_results: None,
    };

    let Some(value) = value else {
        return rejected(
            error
                .map(str::to_string)
                .unwrap_or_else(|| "no feedback received".to_string()),
        );
    };

    let score = clamp_score(value.get("score").and_then(|s| s.as_f64()));
    let assessment_str = value
        .get("overall_assessment")
        .and_then(|a| a.as_str())
        .unwrap_or("");

    let assessment = match assessment_str {
        "approve" => Assessment::Approve {
            score,
            strengths: string_list(value.get("strengths")),
        },
        "approve_with_changes" => Assessment::ApproveWithChanges {
            score,
            concerns: value.get("concerns").map(parse_concerns).unwrap_or_default(),
        },
        "reject" => Assessment::Reject {
            score,
            blocking_issues: string_list(value.get("blocking_issues")),
        },
        other => {
            return rejected(format!(
                "unrecognized reviewer output (overall_assessment = {other:?})"
            ));
        }
    };

    Feedback {
        reviewer: reviewer.to_string(),
        assessment,
        error: value
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string),
        files_modified: string_list(value.get("files_modified")),
        files_created: string_list(value.get("files_created")),
        test_results: value.get("test_results").cloned(),
    }
}
