//! Context drift detection.
//!
//! Tracked context files (the product spec and agent instruction files)
//! are checksummed before each phase. A mismatch against the stored
//! snapshot means a human or another tool edited context mid-run; that is
//! warned about, optionally blocked on, and never silently ignored.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Files tracked for drift, keyed by a stable name.
pub const TRACKED_FILES: &[(&str, &str)] = &[
    ("product", "PRODUCT.md"),
    ("product_docs", "Docs/PRODUCT.md"),
    ("agents", "AGENTS.md"),
    ("claude", "CLAUDE.md"),
    ("gemini", "GEMINI.md"),
    ("cursor_rules", ".cursor/rules"),
];

/// Checksum record for one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub path: String,
    /// SHA-256 hex of the file contents.
    pub checksum: String,
    pub size: u64,
}

/// Snapshot of all tracked files present at capture time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub files: BTreeMap<String, FileChecksum>,
    pub captured_at: String,
}

/// Differences between a stored snapshot and the current tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub changed: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        !self.changed.is_empty() || !self.added.is_empty() || !self.removed.is_empty()
    }

    /// One-line human summary for warnings and the handoff brief.
    pub fn summary(&self) -> String {
        if !self.has_drift() {
            return "no context drift".to_string();
        }
        let mut parts = Vec::new();
        if !self.changed.is_empty() {
            parts.push(format!("modified: {}", self.changed.join(", ")));
        }
        if !self.added.is_empty() {
            parts.push(format!("added: {}", self.added.join(", ")));
        }
        if !self.removed.is_empty() {
            parts.push(format!("removed: {}", self.removed.join(", ")));
        }
        parts.join("; ")
    }
}

fn checksum_file(path: &Path) -> Option<FileChecksum> {
    let content = std::fs::read(path).ok()?;
    Some(FileChecksum {
        path: path.to_string_lossy().into_owned(),
        checksum: hex::encode(Sha256::digest(&content)),
        size: content.len() as u64,
    })
}

/// Capture checksums of every tracked file currently present.
pub fn capture(project_dir: &Path) -> ContextSnapshot {
    let mut files = BTreeMap::new();
    for (key, rel_path) in TRACKED_FILES {
        let path = project_dir.join(rel_path);
        if let Some(mut checksum) = checksum_file(&path) {
            checksum.path = rel_path.to_string();
            files.insert(key.to_string(), checksum);
        }
    }
    ContextSnapshot {
        files,
        captured_at: Utc::now().to_rfc3339(),
    }
}

/// Compare a stored snapshot against the current tree.
pub fn diff(stored: &ContextSnapshot, project_dir: &Path) -> DriftReport {
    let current = capture(project_dir);
    let mut report = DriftReport::default();

    for key in current.files.keys() {
        if !stored.files.contains_key(key) {
            report.added.push(key.clone());
        }
    }
    for (key, stored_file) in &stored.files {
        match current.files.get(key) {
            None => report.removed.push(key.clone()),
            Some(current_file) if current_file.checksum != stored_file.checksum => {
                report.changed.push(key.clone());
            }
            Some(_) => {}
        }
    }

    report
}
