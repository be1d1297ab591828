//! Planning-spec parsing and validation.
//!
//! Specs are plain markdown. The parser pulls out the declared approach
//! count, the pipeline mode, and any `### Method N` sections; the validator
//! is a cheap rule-based check that runs before any agent process spawns.

use crate::util::atomic_write;
use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::info;

/// Minimum spec body length in characters.
const MIN_SPEC_LENGTH: usize = 50;

/// How multiple approaches relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Approaches are alternatives; survivors are compared and ranked.
    Alternative,
    /// Approaches cover separate concerns; survivors are merged together.
    Concern,
}

/// One `### Method N` section.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub description: String,
    pub tech_stack: Vec<String>,
    /// Concern label ("frontend", "backend", ...) in combined mode.
    pub concern: String,
}

/// Parsed planning spec.
#[derive(Debug, Clone)]
pub struct PlanningSpec {
    pub title: String,
    pub raw_content: String,
    /// Declared or inferred approach count; `None` when the spec is silent.
    pub approach_count_hint: Option<usize>,
    pub methods: Vec<MethodSpec>,
    pub mode: PipelineMode,
}

pub fn parse_spec(path: &Path) -> Result<PlanningSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Spec file not found: {}", path.display()))?;
    Ok(parse_content(&content))
}

pub fn parse_content(content: &str) -> PlanningSpec {
    let title = extract_title(content);
    let mode = extract_mode(content);
    let methods = extract_methods(content);
    let declared = extract_declared_count(content);

    let approach_count_hint = declared.or_else(|| {
        if methods.is_empty() {
            None
        } else {
            Some(methods.len())
        }
    });

    info!(
        title = %title,
        methods = methods.len(),
        hint = ?approach_count_hint,
        mode = ?mode,
        "Parsed planning spec"
    );

    PlanningSpec {
        title,
        raw_content: content.to_string(),
        approach_count_hint,
        methods,
        mode,
    }
}

fn extract_title(content: &str) -> String {
    let re = Regex::new(r"(?m)^#\s+(.+)$").expect("valid regex");
    re.captures(content)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| "Untitled".to_string())
}

fn extract_mode(content: &str) -> PipelineMode {
    let heading = Regex::new(r"##\s+Implementation\s+Methods\s*\(\d+\s+combined\)")
        .expect("valid regex");
    let explicit = Regex::new(r"(?i)pipeline\s+mode\s*:\s*combined").expect("valid regex");
    if heading.is_match(content) || explicit.is_match(content) {
        PipelineMode::Concern
    } else {
        PipelineMode::Alternative
    }
}

fn extract_declared_count(content: &str) -> Option<usize> {
    let heading = Regex::new(r"##\s+Implementation\s+Methods\s*\((\d+)\s+(?:compared|combined)\)")
        .expect("valid regex");
    if let Some(captures) = heading.captures(content) {
        return captures[1].parse().ok();
    }

    let explicit = Regex::new(r"(?i)approach\s+count\s*:\s*(\d+|auto)").expect("valid regex");
    match explicit.captures(content) {
        Some(captures) if &captures[1] != "auto" => captures[1].parse().ok(),
        _ => None,
    }
}

fn extract_methods(content: &str) -> Vec<MethodSpec> {
    let heading = Regex::new(r"(?m)^###\s+Method\s+\d+\s*[:\s]\s*(.+)$").expect("valid regex");
    let matches: Vec<_> = heading.captures_iter(content).collect();
    let mut methods = Vec::new();

    for (i, captures) in matches.iter().enumerate() {
        let name = captures[1].trim().to_string();
        let start = captures.get(0).expect("whole match").end();
        let end = if i + 1 < matches.len() {
            matches[i + 1].get(0).expect("whole match").start()
        } else {
            // Up to the next H2 heading, or end of file.
            content[start..]
                .find("\n## ")
                .map(|offset| start + offset)
                .unwrap_or(content.len())
        };
        let section = content[start..end].trim().to_string();

        let concern = Regex::new(r"(?im)^\**concern\**\s*:\s*(.+)$")
            .expect("valid regex")
            .captures(&section)
            .map(|c| c[1].trim().trim_end_matches("**").trim().to_string())
            .unwrap_or_default();

        methods.push(MethodSpec {
            name,
            tech_stack: extract_tech_stack(&section),
            concern,
            description: section,
        });
    }

    methods
}

fn extract_tech_stack(text: &str) -> Vec<String> {
    let re = Regex::new(r"(?im)^\**(?:libraries|tech\s+stack)\**\s*:\s*(.+)$").expect("valid regex");
    let mut stack = Vec::new();
    for captures in re.captures_iter(text) {
        for item in captures[1].split(',') {
            let item = item.trim();
            if !item.is_empty() {
                stack.push(item.to_string());
            }
        }
    }
    stack
}

/// Result of the pre-flight spec check.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Rule-based validation: structure, then content, then consistency. Cheap
/// and local; no agent process is involved.
pub fn validate_spec(path: &Path) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            errors.push(format!("Spec file cannot be read: {e}"));
            return ValidationReport {
                valid: false,
                errors,
                warnings,
            };
        }
    };

    if content.trim().len() < MIN_SPEC_LENGTH {
        errors.push(format!(
            "Spec is too short ({} chars). Describe what to build in more detail",
            content.trim().len()
        ));
        return ValidationReport {
            valid: false,
            errors,
            warnings,
        };
    }

    if !Regex::new(r"(?m)^#\s+.+").expect("valid regex").is_match(&content) {
        warnings.push("No H1 title found. Adding one is recommended".to_string());
    }

    let has_methods_section = Regex::new(r"##\s+Implementation\s+Methods")
        .expect("valid regex")
        .is_match(&content);
    if !has_methods_section {
        errors.push(
            "No '## Implementation Methods' section found. Add one describing how to build this"
                .to_string(),
        );
    }

    if extract_tech_stack(&content).is_empty() && !mentions_known_tech(&content) {
        warnings.push(
            "No tech stack declared. Name the libraries or frameworks to use".to_string(),
        );
    }

    // Declared count must match the actual method sections.
    let declared = Regex::new(r"##\s+Implementation\s+Methods\s*\((\d+)\s+(?:compared|combined)\)")
        .expect("valid regex")
        .captures(&content)
        .and_then(|c| c[1].parse::<usize>().ok());
    let method_names: Vec<String> = Regex::new(r"(?m)^###\s+Method\s+\d+\s*[:\s]\s*(.+)$")
        .expect("valid regex")
        .captures_iter(&content)
        .map(|c| c[1].trim().to_string())
        .collect();

    if let Some(declared) = declared {
        if !method_names.is_empty() && declared != method_names.len() {
            errors.push(format!(
                "Method count mismatch: heading declares {declared} but {} sections found",
                method_names.len()
            ));
        }
    }

    if method_names.len() >= 2 {
        let mut seen = std::collections::HashSet::new();
        for name in &method_names {
            if !seen.insert(name) {
                errors.push(format!(
                    "Duplicate method name '{name}'. Each method must be a distinct approach"
                ));
            }
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn mentions_known_tech(content: &str) -> bool {
    const KNOWN: &[&str] = &[
        "react", "vue", "svelte", "next.js", "express", "fastify", "django", "flask", "fastapi",
        "spring", "node.js", "python", "typescript", "rust", "go", "java", "postgresql", "mysql",
        "mongodb", "redis", "sqlite", "docker", "kubernetes", "graphql", "grpc", "rest", "jwt",
        "oauth", "tokio", "axum", "actix", "pytest", "jest", "vitest",
    ];
    let lower = content.to_lowercase();
    KNOWN.iter().any(|tech| lower.contains(tech))
}

/// Write a human-readable failure report next to the task artifacts.
pub fn write_validation_errors(report: &ValidationReport, output_dir: &Path) -> Result<PathBuf> {
    let path = output_dir.join("validation-errors.md");

    let mut lines = vec![
        "# Spec Validation Failed".to_string(),
        String::new(),
        format!("Checked at: {}", Utc::now().to_rfc3339()),
        String::new(),
    ];

    if !report.errors.is_empty() {
        lines.push("## Errors".to_string());
        lines.push(String::new());
        for error in &report.errors {
            lines.push(format!("- {error}"));
        }
        lines.push(String::new());
    }

    if !report.warnings.is_empty() {
        lines.push("## Warnings".to_string());
        lines.push(String::new());
        for warning in &report.warnings {
            lines.push(format!("- {warning}"));
        }
        lines.push(String::new());
    }

    atomic_write(&path, &lines.join("\n"))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TWO_METHOD_SPEC: &str = "\
# Session Cache

Build a session cache for the web API with read-through semantics.

## Implementation Methods (2 compared)

### Method 1: In-memory LRU
Keep sessions in an in-memory LRU map.
Libraries: moka, tokio

### Method 2: Redis-backed
Store sessions in Redis with TTLs.
Libraries: redis, tokio

## Notes
Prefer low latency.
";

    #[test]
    fn test_parse_two_method_spec() {
        let spec = parse_content(TWO_METHOD_SPEC);
        assert_eq!(spec.title, "Session Cache");
        assert_eq!(spec.approach_count_hint, Some(2));
        assert_eq!(spec.mode, PipelineMode::Alternative);
        assert_eq!(spec.methods.len(), 2);
        assert_eq!(spec.methods[0].name, "In-memory LRU");
        assert_eq!(spec.methods[0].tech_stack, vec!["moka", "tokio"]);
        assert!(spec.methods[1].description.contains("Redis"));
        // The second method's section stops at the next H2.
        assert!(!spec.methods[1].description.contains("Prefer low latency"));
    }

    #[test]
    fn test_parse_combined_mode() {
        let content = "\
# Split Work

## Implementation Methods (2 combined)

### Method 1: API surface
Concern: backend

### Method 2: UI
Concern: frontend
";
        let spec = parse_content(content);
        assert_eq!(spec.mode, PipelineMode::Concern);
        assert_eq!(spec.methods[0].concern, "backend");
        assert_eq!(spec.methods[1].concern, "frontend");
    }

    #[test]
    fn test_parse_explicit_count_and_auto() {
        let spec = parse_content("# T\n\nApproach count: 3\n\n## Implementation Methods\nstuff");
        assert_eq!(spec.approach_count_hint, Some(3));

        let spec = parse_content("# T\n\nApproach count: auto\n\n## Implementation Methods\nstuff");
        assert_eq!(spec.approach_count_hint, None);
    }

    #[test]
    fn test_parse_without_declarations() {
        let spec = parse_content("# Plain\n\nJust build the thing described here.");
        assert_eq!(spec.approach_count_hint, None);
        assert!(spec.methods.is_empty());
        assert_eq!(spec.mode, PipelineMode::Alternative);
    }

    #[test]
    fn test_validate_accepts_good_spec() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spec.md");
        std::fs::write(&path, TWO_METHOD_SPEC).unwrap();
        let report = validate_spec(&path);
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_validate_rejects_short_spec() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spec.md");
        std::fs::write(&path, "# Tiny").unwrap();
        let report = validate_spec(&path);
        assert!(!report.valid);
        assert!(report.errors[0].contains("too short"));
    }

    #[test]
    fn test_validate_requires_methods_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spec.md");
        std::fs::write(
            &path,
            "# Title\n\nA long enough description of the project goes right here, using Rust.",
        )
        .unwrap();
        let report = validate_spec(&path);
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("Implementation Methods")));
    }

    #[test]
    fn test_validate_detects_count_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spec.md");
        let content = TWO_METHOD_SPEC.replace("(2 compared)", "(3 compared)");
        std::fs::write(&path, content).unwrap();
        let report = validate_spec(&path);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("mismatch")));
    }

    #[test]
    fn test_validate_detects_duplicate_method_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spec.md");
        let content = TWO_METHOD_SPEC.replace("Method 2: Redis-backed", "Method 2: In-memory LRU");
        std::fs::write(&path, content).unwrap();
        let report = validate_spec(&path);
        // Heading count still matches, but names collide.
        assert!(report.errors.iter().any(|e| e.contains("Duplicate")));
    }

    #[test]
    fn test_validate_missing_file() {
        let report = validate_spec(Path::new("/nonexistent/spec.md"));
        assert!(!report.valid);
    }

    #[test]
    fn test_write_validation_errors() {
        let dir = tempdir().unwrap();
        let report = ValidationReport {
            valid: false,
            errors: vec!["bad thing".into()],
            warnings: vec!["iffy thing".into()],
        };
        let path = write_validation_errors(&report, dir.path()).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("bad thing"));
        assert!(content.contains("iffy thing"));
    }
}
