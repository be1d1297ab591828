//! Integrator: merges concern-mode implementations into one workspace and
//! resolves what the mechanical merges could not.

use crate::agents::architect::Approach;
use crate::agents::harness::AgentHarness;
use crate::agents::AgentTask;
use crate::executor::{AgentExecutor, ExecResult};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const DEFAULT_PROMPT: &str = "\
The branches below were merged into the integration worktree at \
{integration_path} (the current directory). Branches marked Conflict could \
not be merged mechanically.

{impl_summary}

Resolve the remaining conflicts, write any glue code the combined \
implementations need, and verify the project builds and its tests pass.
";

/// Outcome of mechanically merging one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRecord {
    pub approach_id: usize,
    pub branch: String,
    pub conflict: bool,
}

/// Typed input for the integration phase.
#[derive(Debug, Clone)]
pub struct IntegrationContext {
    pub integration_path: PathBuf,
    pub implementations: Vec<(Approach, String)>,
    pub merge_records: Vec<MergeRecord>,
}

impl IntegrationContext {
    pub fn has_conflicts(&self) -> bool {
        self.merge_records.iter().any(|r| r.conflict)
    }
}

pub struct IntegratorAgent {
    harness: AgentHarness,
    prompt_file: PathBuf,
}

impl IntegratorAgent {
    pub fn new(
        workspace: PathBuf,
        executor: Arc<AgentExecutor>,
        prompt_file: PathBuf,
    ) -> Result<Self> {
        Ok(Self {
            harness: AgentHarness::new("integrator", workspace, executor)?,
            prompt_file,
        })
    }

    fn format_implementations(context: &IntegrationContext) -> String {
        context
            .implementations
            .iter()
            .map(|(approach, branch)| {
                let status = context
                    .merge_records
                    .iter()
                    .find(|r| &r.branch == branch)
                    .map(|r| if r.conflict { "Conflict" } else { "Merged" })
                    .unwrap_or("Unknown");
                let concern = if approach.concern.is_empty() {
                    "n/a"
                } else {
                    approach.concern.as_str()
                };
                format!(
                    "- {} (concern: {}), branch: {}, status: {}",
                    approach.name, concern, branch, status
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl AgentTask for IntegratorAgent {
    type Context = IntegrationContext;
    type Output = ExecResult;

    async fn run(&self, context: IntegrationContext) -> Result<ExecResult> {
        if context.integration_path.as_os_str().is_empty() {
            anyhow::bail!("Integration path is empty");
        }

        info!(
            implementations = context.implementations.len(),
            conflicts = context.has_conflicts(),
            "Integrator starting"
        );

        let integration_path = context.integration_path.display().to_string();
        let impl_summary = Self::format_implementations(&context);
        let prompt = self.harness.render_prompt(
            &self.prompt_file,
            DEFAULT_PROMPT,
            &[
                ("integration_path", integration_path.as_str()),
                ("impl_summary", impl_summary.as_str()),
            ],
        );

        let output_file = self.harness.workspace().join("integration.log");
        let result = self
            .harness
            .execute(&prompt, Some(&context.integration_path), Some(&output_file))
            .await;

        info!(success = result.success, "Integrator finished");
        Ok(result)
    }
}
