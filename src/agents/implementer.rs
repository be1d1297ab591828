//! Implementer: builds one approach inside its isolated worktree.

use crate::agents::architect::Approach;
use crate::agents::harness::{AgentHarness, META_DIR};
use crate::agents::AgentTask;
use crate::executor::{AgentExecutor, ExecResult};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const DEFAULT_PROMPT: &str = "\
You are implementing one approach for the specification below. The current \
directory is a dedicated worktree of the target project; build on the \
existing code.

## SPECIFICATION
{spec_content}

## ASSIGNED APPROACH ({approach_id})
{approach}

## RULES
1. Follow the assigned approach, not an alternative.
2. Check existing code before making changes.
3. Run the project's tests or checks to verify your work.
";

/// Typed input for one implementation task.
#[derive(Debug, Clone)]
pub struct ImplementationContext {
    pub approach: Approach,
    pub spec_content: String,
    /// Optional path to a pre-built project context document.
    pub project_context_path: Option<PathBuf>,
}

pub struct ImplementerAgent {
    harness: AgentHarness,
    approach_id: usize,
    prompt_file: PathBuf,
}

impl ImplementerAgent {
    /// `workspace` is the approach's git worktree; the agent works directly
    /// on the target project's files.
    pub fn new(
        approach_id: usize,
        workspace: PathBuf,
        executor: Arc<AgentExecutor>,
        prompt_file: PathBuf,
    ) -> Result<Self> {
        Ok(Self {
            harness: AgentHarness::new(
                &format!("implementer-{approach_id}"),
                workspace,
                executor,
            )?,
            approach_id,
            prompt_file,
        })
    }
}

#[async_trait]
impl AgentTask for ImplementerAgent {
    type Context = ImplementationContext;
    type Output = ExecResult;

    async fn run(&self, context: ImplementationContext) -> Result<ExecResult> {
        info!(approach = self.approach_id, "Implementer starting");

        let approach_id = self.approach_id.to_string();
        let context_path = context
            .project_context_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let prompt = self.harness.render_prompt(
            &self.prompt_file,
            DEFAULT_PROMPT,
            &[
                ("spec_content", context.spec_content.as_str()),
                ("approach", context.approach.as_prompt_text().as_str()),
                ("approach_id", approach_id.as_str()),
                ("project_context_path", context_path.as_str()),
            ],
        );

        let output_file = self.harness.workspace().join(META_DIR).join("implementation.log");
        let result = self.harness.execute(&prompt, None, Some(&output_file)).await;

        if result.success {
            let summary = serde_json::json!({
                "approach_id": self.approach_id,
                "approach": context.approach,
                "status": "completed",
                "duration_secs": result.duration.as_secs_f64(),
            });
            self.harness
                .write_output(&format!("{META_DIR}/summary.json"), &summary)?;
        }

        info!(
            approach = self.approach_id,
            success = result.success,
            "Implementer finished"
        );
        Ok(result)
    }
}
