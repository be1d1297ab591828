//! Reviewer: code review of one implementation.

use crate::agents::harness::AgentHarness;
use crate::agents::AgentTask;
use crate::executor::{AgentExecutor, ExecResult};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const REVIEW_FILE: &str = "review.md";

const DEFAULT_PROMPT: &str = "\
Review the implementation of approach \"{approach_name}\" located at \
{impl_dir}. Assess correctness, code quality and spec adherence. Write the \
full review to {review_file} in the current directory.
";

/// Typed input for one review task.
#[derive(Debug, Clone)]
pub struct ReviewContext {
    pub approach_id: usize,
    pub approach_name: String,
    pub impl_path: PathBuf,
}

pub struct ReviewerAgent {
    harness: AgentHarness,
    approach_id: usize,
    prompt_file: PathBuf,
}

impl ReviewerAgent {
    pub fn new(
        approach_id: usize,
        workspace: PathBuf,
        executor: Arc<AgentExecutor>,
        prompt_file: PathBuf,
    ) -> Result<Self> {
        Ok(Self {
            harness: AgentHarness::new(&format!("reviewer-{approach_id}"), workspace, executor)?,
            approach_id,
            prompt_file,
        })
    }
}

#[async_trait]
impl AgentTask for ReviewerAgent {
    type Context = ReviewContext;
    type Output = ExecResult;

    async fn run(&self, context: ReviewContext) -> Result<ExecResult> {
        if !context.impl_path.exists() {
            anyhow::bail!(
                "Implementation path not found: {}",
                context.impl_path.display()
            );
        }

        info!(approach = self.approach_id, "Reviewer starting");

        let impl_dir = context.impl_path.display().to_string();
        let prompt = self.harness.render_prompt(
            &self.prompt_file,
            DEFAULT_PROMPT,
            &[
                ("impl_dir", impl_dir.as_str()),
                ("approach_name", context.approach_name.as_str()),
                ("review_file", REVIEW_FILE),
            ],
        );

        let output_file = self.harness.workspace().join(REVIEW_FILE);
        let result = self.harness.execute(&prompt, None, Some(&output_file)).await;

        if result.success {
            self.harness.write_output(
                "review_summary.json",
                &serde_json::json!({
                    "approach_id": self.approach_id,
                    "impl_path": impl_dir,
                    "review_file": output_file.display().to_string(),
                    "status": "completed",
                }),
            )?;
        }

        info!(
            approach = self.approach_id,
            success = result.success,
            "Reviewer finished"
        );
        Ok(result)
    }
}
