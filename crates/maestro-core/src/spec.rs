//! Product specification handling: validation, docs discovery, optional
//! auto-generation, and the docs-only review-gating fast path.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Sections every product spec must carry.
pub const REQUIRED_SECTIONS: &[&str] = &[
    "Summary",
    "Problem Statement",
    "Acceptance Criteria",
    "Examples",
    "Technical Constraints",
    "Testing Strategy",
    "Definition of Done",
];

/// Directories excluded from docs discovery.
const DISCOVERY_EXCLUDES: &[&str] = &[
    "node_modules",
    "target",
    ".git",
    ".workflow",
    "vendor",
    "dist",
    "build",
];

/// Locate the product spec: `PRODUCT.md` at the root, else
/// `Docs/PRODUCT.md`.
pub fn find_product_spec(project_dir: &Path) -> Option<PathBuf> {
    for candidate in ["PRODUCT.md", "Docs/PRODUCT.md"] {
        let path = project_dir.join(candidate);
        if path.is_file() {
            return Some(path);
        }
    }
    None
}

/// Section headings missing from a spec's content. Empty means valid.
pub fn missing_sections(content: &str) -> Vec<&'static str> {
    let headings: Vec<String> = content
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            trimmed
                .strip_prefix('#')
                .map(|rest| rest.trim_start_matches('#').trim().to_lowercase())
        })
        .collect();

    REQUIRED_SECTIONS
        .iter()
        .filter(|section| {
            let wanted = section.to_lowercase();
            !headings.iter().any(|h| h.contains(&wanted))
        })
        .copied()
        .collect()
}

/// Markdown files under `docs/` or `Docs/`, for spec auto-generation.
pub fn discover_docs(project_dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir_name in ["docs", "Docs"] {
        let dir = project_dir.join(dir_name);
        collect_markdown(&dir, &mut found);
    }
    found.sort();
    found
}

fn collect_markdown(dir: &Path, found: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if !DISCOVERY_EXCLUDES.contains(&name.as_ref()) {
                collect_markdown(&path, found);
            }
        } else if name.ends_with(".md") && name != "PRODUCT.md" {
            found.push(path);
        }
    }
}

/// Generate `Docs/PRODUCT.md` from discovered documentation.
///
/// The skeleton carries every required section; discovered docs are
/// summarized into the Summary section as source references for the
/// planner to read.
pub fn generate_product_spec(project_dir: &Path) -> Result<PathBuf> {
    let docs = discover_docs(project_dir);
    if docs.is_empty() {
        anyhow::bail!("no documentation found to generate a product spec from");
    }

    let doc_list: Vec<String> = docs
        .iter()
        .filter_map(|d| d.strip_prefix(project_dir).ok())
        .map(|d| format!("- {}", d.display()))
        .collect();

    let content = format!(
        "# Product Specification\n\n\
         ## Summary\n\n\
         Generated from discovered project documentation. Source documents:\n\n{}\n\n\
         ## Problem Statement\n\n\
         See the source documents above for the underlying problem description.\n\n\
         ## Acceptance Criteria\n\n\
         - Behavior described in the source documents is implemented and tested.\n\n\
         ## Examples\n\n\
         Refer to usage examples in the source documents.\n\n\
         ## Technical Constraints\n\n\
         - Follow the existing project structure and conventions.\n\n\
         ## Testing Strategy\n\n\
         - Unit tests for each implemented behavior; integration tests for end-to-end flows.\n\n\
         ## Definition of Done\n\n\
         - All acceptance criteria met, tests passing, reviews approved.\n",
        doc_list.join("\n")
    );

    let docs_dir = project_dir.join("Docs");
    std::fs::create_dir_all(&docs_dir)
        .with_context(|| format!("failed to create {}", docs_dir.display()))?;
    let path = docs_dir.join("PRODUCT.md");
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write {}", path.display()))?;

    info!(path = %path.display(), sources = docs.len(), "generated product spec from docs");
    Ok(path)
}

/// Ensure a valid product spec exists, generating one when allowed.
///
/// Returns the spec path. Missing sections are warnings, not failures;
/// a missing spec with auto-generation disabled is fatal.
pub fn ensure_product_spec(project_dir: &Path, auto_generate: bool) -> Result<PathBuf> {
    let path = match find_product_spec(project_dir) {
        Some(path) => path,
        None if auto_generate => generate_product_spec(project_dir)
            .context("PRODUCT.md missing and auto-generation failed")?,
        None => anyhow::bail!(
            "PRODUCT.md not found (checked ./ and Docs/); create it with your feature specification"
        ),
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let missing = missing_sections(&content);
    if !missing.is_empty() {
        warn!(
            path = %path.display(),
            missing = missing.join(", "),
            "product spec is missing required sections"
        );
    }

    Ok(path)
}

/// Whether a change set is documentation-only.
///
/// True when every path is a `.md`/`.txt` file or lives under a docs
/// directory. Review gating takes a fast path for such changes: prose
/// does not need a dual code review.
pub fn is_docs_only_change<S: AsRef<str>>(paths: &[S]) -> bool {
    if paths.is_empty() {
        return false;
    }
    paths.iter().all(|p| {
        let path = p.as_ref();
        let in_docs = path.starts_with("docs/") || path.starts_with("Docs/");
        let is_prose = path.ends_with(".md") || path.ends_with(".txt");
        in_docs || is_prose
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_SPEC: &str = "# Widget Feature\n\n\
        ## Summary\nA widget.\n\n\
        ## Problem Statement\nNo widgets exist.\n\n\
        ## Acceptance Criteria\n- Widgets render\n\n\
        ## Examples\n`widget --help`\n\n\
        ## Technical Constraints\n- Rust\n\n\
        ## Testing Strategy\nUnit tests.\n\n\
        ## Definition of Done\nShipped.\n";

    #[test]
    fn valid_spec_has_no_missing_sections() {
        assert!(missing_sections(VALID_SPEC).is_empty());
    }

    #[test]
    fn missing_sections_are_named() {
        let partial = "# Feature\n\n## Summary\nStuff.\n\n## Examples\nNone.\n";
        let missing = missing_sections(partial);
        assert!(missing.contains(&"Problem Statement"));
        assert!(missing.contains(&"Definition of Done"));
        assert!(!missing.contains(&"Summary"));
    }

    #[test]
    fn find_prefers_root_over_docs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("Docs")).unwrap();
        std::fs::write(tmp.path().join("Docs/PRODUCT.md"), "docs spec").unwrap();
        assert_eq!(
            find_product_spec(tmp.path()).unwrap(),
            tmp.path().join("Docs/PRODUCT.md")
        );

        std::fs::write(tmp.path().join("PRODUCT.md"), "root spec").unwrap();
        assert_eq!(
            find_product_spec(tmp.path()).unwrap(),
            tmp.path().join("PRODUCT.md")
        );
    }

    #[test]
    fn generation_requires_docs() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(generate_product_spec(tmp.path()).is_err());
    }

    #[test]
    fn generated_spec_passes_validation() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("docs")).unwrap();
        std::fs::write(tmp.path().join("docs/design.md"), "# Design\nDetails.\n").unwrap();
        std::fs::write(tmp.path().join("docs/api.md"), "# API\nEndpoints.\n").unwrap();

        let path = generate_product_spec(tmp.path()).unwrap();
        assert_eq!(path, tmp.path().join("Docs/PRODUCT.md"));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(missing_sections(&content).is_empty());
        assert!(content.contains("docs/design.md"));
        assert!(content.contains("docs/api.md"));
    }

    #[test]
    fn ensure_spec_auto_generates_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("docs")).unwrap();
        std::fs::write(tmp.path().join("docs/notes.md"), "# Notes\n").unwrap();

        assert!(ensure_product_spec(tmp.path(), false).is_err());
        let path = ensure_product_spec(tmp.path(), true).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn discovery_skips_excluded_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs/node_modules")).unwrap();
        std::fs::write(tmp.path().join("docs/real.md"), "real").unwrap();
        std::fs::write(tmp.path().join("docs/node_modules/fake.md"), "fake").unwrap();

        let docs = discover_docs(tmp.path());
        assert_eq!(docs.len(), 1);
        assert!(docs[0].ends_with("real.md"));
    }

    #[test]
    fn docs_only_fast_path() {
        assert!(is_docs_only_change(&["README.md", "docs/guide.md", "NOTES.txt"]));
        assert!(is_docs_only_change(&["docs/diagram.png"]));
        assert!(!is_docs_only_change(&["README.md", "src/main.rs"]));
        assert!(!is_docs_only_change(&["src/lib.rs"]));
        assert!(!is_docs_only_change::<&str>(&[]));
    }
}
