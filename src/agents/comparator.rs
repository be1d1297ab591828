//! Comparator: ranks surviving implementations against each other.

use crate::agents::architect::Approach;
use crate::agents::harness::AgentHarness;
use crate::agents::AgentTask;
use crate::executor::AgentExecutor;
use crate::util::extract_json_array;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_PROMPT: &str = "\
Compare the {num_implementations} implementations described below. Weigh \
code quality, spec adherence, review findings and test outcomes. Write a \
detailed comparison, then end with a JSON array of approach ids ranked best \
first inside a ```json code block.

{comparison_data}
";

/// One implementation the comparator weighs.
#[derive(Debug, Clone)]
pub struct ComparisonEntry {
    pub approach: Approach,
    pub impl_path: PathBuf,
    /// Workspace of the review task, if the phase ran.
    pub review_workspace: Option<PathBuf>,
    /// Workspace of the test task, if the phase ran.
    pub test_workspace: Option<PathBuf>,
}

/// Typed input for the comparison phase.
#[derive(Debug, Clone)]
pub struct ComparisonContext {
    pub entries: Vec<ComparisonEntry>,
}

pub struct ComparatorAgent {
    harness: AgentHarness,
    prompt_file: PathBuf,
}

impl ComparatorAgent {
    pub fn new(
        workspace: PathBuf,
        executor: Arc<AgentExecutor>,
        prompt_file: PathBuf,
    ) -> Result<Self> {
        Ok(Self {
            harness: AgentHarness::new("comparator", workspace, executor)?,
            prompt_file,
        })
    }

    fn gather_comparison_data(entries: &[ComparisonEntry]) -> String {
        let mut sections = Vec::new();

        for entry in entries {
            let mut lines = vec![
                format!("## Implementation {}", entry.approach.id),
                format!("Path: {}", entry.impl_path.display()),
                format!("Approach: {}", entry.approach.name),
            ];
            if !entry.approach.description.is_empty() {
                lines.push(format!("Description: {}", entry.approach.description));
            }

            if let Some(review) = Self::find_artifact(
                entry.review_workspace.as_deref(),
                &entry.impl_path,
                &["review.md", "code-review.md"],
            ) {
                let excerpt: String = review.chars().take(500).collect();
                lines.push(format!("\n### Code Review\n{excerpt}"));
            }

            if let Some(results) = Self::find_artifact(
                entry.test_workspace.as_deref(),
                &entry.impl_path,
                &["test_results.json", "test-results.json"],
            ) {
                lines.push(format!("\n### Test Results\n{results}"));
            }

            lines.push("\n---".to_string());
            sections.push(lines.join("\n"));
        }

        sections.join("\n")
    }

    /// Look for an artifact in the dedicated workspace first, then fall back
    /// to the implementation worktree.
    fn find_artifact(
        workspace: Option<&std::path::Path>,
        impl_path: &std::path::Path,
        names: &[&str],
    ) -> Option<String> {
        if let Some(workspace) = workspace {
            for name in names {
                if let Ok(content) = std::fs::read_to_string(workspace.join(name)) {
                    return Some(content);
                }
            }
        }
        std::fs::read_to_string(impl_path.join(names[0])).ok()
    }

    /// Parse the ranked id list; fall back to ordinal order when the output
    /// cannot be parsed or has the wrong arity.
    fn parse_rankings(output: &str, entries: &[ComparisonEntry]) -> Vec<usize> {
        if let Some(json) = extract_json_array(output) {
            if let Ok(rankings) = serde_json::from_str::<Vec<usize>>(&json) {
                let mut sorted = rankings.clone();
                sorted.sort_unstable();
                let mut expected: Vec<usize> = entries.iter().map(|e| e.approach.id).collect();
                expected.sort_unstable();
                if sorted == expected {
                    return rankings;
                }
            }
        }

        warn!("Could not parse rankings, using ordinal order");
        entries.iter().map(|e| e.approach.id).collect()
    }
}

#[async_trait]
impl AgentTask for ComparatorAgent {
    type Context = ComparisonContext;
    type Output = Vec<usize>;

    /// Rank the implementations, best first.
    async fn run(&self, context: ComparisonContext) -> Result<Vec<usize>> {
        if context.entries.is_empty() {
            anyhow::bail!("No implementations to compare");
        }

        info!(count = context.entries.len(), "Comparator analyzing implementations");

        let num = context.entries.len().to_string();
        let comparison_data = Self::gather_comparison_data(&context.entries);
        let prompt = self.harness.render_prompt(
            &self.prompt_file,
            DEFAULT_PROMPT,
            &[
                ("num_implementations", num.as_str()),
                ("comparison_data", comparison_data.as_str()),
            ],
        );

        let output_file = self.harness.workspace().join("comparison.md");
        let result = self.harness.execute(&prompt, None, Some(&output_file)).await;

        if !result.success {
            anyhow::bail!("Comparison failed: {}", result.error_message());
        }

        let rankings = Self::parse_rankings(&result.output, &context.entries);
        self.harness.write_output(
            "rankings.json",
            &serde_json::json!({
                "rankings": rankings,
                "num_implementations": context.entries.len(),
            }),
        )?;

        info!(rankings = ?rankings, "Comparator finished");
        Ok(rankings)
    }
}
