//! Tester: writes and runs tests against one implementation.

use crate::agents::harness::AgentHarness;
use crate::agents::AgentTask;
use crate::executor::{AgentExecutor, ExecResult};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const DEFAULT_PROMPT: &str = "\
Write tests for the implementation of approach {approach_id} located at \
{impl_path}, then run the full test suite there and report the results.
";

/// Typed input for one test task.
#[derive(Debug, Clone)]
pub struct TestContext {
    pub approach_id: usize,
    pub impl_path: PathBuf,
}

pub struct TesterAgent {
    harness: AgentHarness,
    approach_id: usize,
    prompt_file: PathBuf,
}

impl TesterAgent {
    pub fn new(
        approach_id: usize,
        workspace: PathBuf,
        executor: Arc<AgentExecutor>,
        prompt_file: PathBuf,
    ) -> Result<Self> {
        Ok(Self {
            harness: AgentHarness::new(&format!("tester-{approach_id}"), workspace, executor)?,
            approach_id,
            prompt_file,
        })
    }
}

#[async_trait]
impl AgentTask for TesterAgent {
    type Context = TestContext;
    type Output = ExecResult;

    async fn run(&self, context: TestContext) -> Result<ExecResult> {
        if !context.impl_path.exists() {
            anyhow::bail!(
                "Implementation path not found: {}",
                context.impl_path.display()
            );
        }

        info!(approach = self.approach_id, "Tester starting");

        let approach_id = self.approach_id.to_string();
        let impl_path = context.impl_path.display().to_string();
        let prompt = self.harness.render_prompt(
            &self.prompt_file,
            DEFAULT_PROMPT,
            &[
                ("impl_path", impl_path.as_str()),
                ("approach_id", approach_id.as_str()),
            ],
        );

        let output_file = self.harness.workspace().join("test_output.log");
        // Tests run inside the implementation worktree itself.
        let result = self
            .harness
            .execute(&prompt, Some(&context.impl_path), Some(&output_file))
            .await;

        if result.success {
            self.harness.write_output(
                "test_results.json",
                &serde_json::json!({
                    "approach_id": self.approach_id,
                    "impl_path": impl_path,
                    "test_log": output_file.display().to_string(),
                    "status": "completed",
                }),
            )?;
        }

        info!(
            approach = self.approach_id,
            success = result.success,
            "Tester finished"
        );
        Ok(result)
    }
}
