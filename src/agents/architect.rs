//! Architect: analyzes the planning spec and produces candidate approaches.

use crate::agents::harness::AgentHarness;
use crate::agents::AgentTask;
use crate::errors::PipelineError;
use crate::executor::AgentExecutor;
use crate::util::{extract_json_array, extract_json_object};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_PROMPT: &str = "\
You are a software architect. Analyze the specification below and the \
project at {project_path}, then design {num_approaches} distinct \
implementation approaches.

## SPECIFICATION
{spec_content}

## PROJECT CONTEXT
{project_context}

## OUTPUT
Respond with a JSON array inside a ```json code block. Each element:
{\"name\": ..., \"description\": ..., \"key_decisions\": [...], \
\"trade_offs\": [...], \"libraries\": [...], \"concern\": ...}
";

/// One candidate implementation plan. Ordinal ids are assigned after
/// parsing and stay stable for the rest of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approach {
    #[serde(default)]
    pub id: usize,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub key_decisions: Vec<String>,
    #[serde(default)]
    pub trade_offs: Vec<String>,
    #[serde(default)]
    pub libraries: Vec<String>,
    /// Concern label in combined mode ("frontend", "backend", ...).
    #[serde(default)]
    pub concern: String,
}

impl Approach {
    /// Render the approach as prompt-ready text.
    pub fn as_prompt_text(&self) -> String {
        let mut lines = vec![format!("Approach: {}", self.name)];

        if !self.description.is_empty() {
            lines.push(format!("\nDescription:\n{}", self.description));
        }
        if !self.key_decisions.is_empty() {
            lines.push("\nKey decisions:".to_string());
            for decision in &self.key_decisions {
                lines.push(format!("  - {decision}"));
            }
        }
        if !self.libraries.is_empty() {
            lines.push(format!("\nLibraries: {}", self.libraries.join(", ")));
        }
        if !self.trade_offs.is_empty() {
            lines.push("\nTrade-offs:".to_string());
            for trade_off in &self.trade_offs {
                lines.push(format!("  - {trade_off}"));
            }
        }
        if !self.concern.is_empty() {
            lines.push(format!("\nConcern: {}", self.concern));
        }

        lines.join("\n")
    }
}

/// Typed input for the design phase.
#[derive(Debug, Clone)]
pub struct ArchitectContext {
    pub spec_content: String,
    pub num_approaches: usize,
    pub project_path: PathBuf,
    /// Optional pre-built project context, purely additive.
    pub project_context: Option<String>,
}

pub struct ArchitectAgent {
    harness: AgentHarness,
    prompt_file: PathBuf,
}

impl ArchitectAgent {
    pub fn new(
        workspace: PathBuf,
        executor: Arc<AgentExecutor>,
        prompt_file: PathBuf,
    ) -> Result<Self> {
        Ok(Self {
            harness: AgentHarness::new("architect", workspace, executor)?,
            prompt_file,
        })
    }

    fn parse_approaches(output: &str) -> Vec<Approach> {
        // Preferred: a JSON array, possibly fenced or surrounded by prose.
        if let Some(json) = extract_json_array(output) {
            if let Ok(approaches) = serde_json::from_str::<Vec<Approach>>(&json) {
                return approaches;
            }
        }
        // Fallback: an object wrapping {"approaches": [...]}.
        if let Some(json) = extract_json_object(output) {
            #[derive(Deserialize)]
            struct Wrapper {
                approaches: Vec<Approach>,
            }
            if let Ok(wrapper) = serde_json::from_str::<Wrapper>(&json) {
                return wrapper.approaches;
            }
        }
        warn!("Could not parse approaches from architect output");
        Vec::new()
    }
}

#[async_trait]
impl AgentTask for ArchitectAgent {
    type Context = ArchitectContext;
    type Output = Vec<Approach>;

    /// Produce the approach list. Runs in the target project so the agent
    /// can inspect existing code.
    async fn run(&self, context: ArchitectContext) -> Result<Vec<Approach>> {
        if context.spec_content.is_empty() {
            return Err(PipelineError::DesignFailed("spec content is empty".into()).into());
        }

        info!(
            num_approaches = context.num_approaches,
            "Architect designing approaches"
        );

        let num = context.num_approaches.to_string();
        let project_path = context.project_path.display().to_string();
        let prompt = self.harness.render_prompt(
            &self.prompt_file,
            DEFAULT_PROMPT,
            &[
                ("spec_content", context.spec_content.as_str()),
                ("num_approaches", num.as_str()),
                ("project_path", project_path.as_str()),
                (
                    "project_context",
                    context.project_context.as_deref().unwrap_or(""),
                ),
            ],
        );

        let working_dir = if context.project_path.as_os_str().is_empty() {
            None
        } else {
            Some(context.project_path.as_path())
        };
        let result = self.harness.execute(&prompt, working_dir, None).await;

        if !result.success {
            return Err(PipelineError::DesignFailed(result.error_message()).into());
        }

        let mut approaches = Self::parse_approaches(&result.output);
        if approaches.is_empty() {
            return Err(PipelineError::DesignFailed(
                "no approaches could be parsed from agent output".into(),
            )
            .into());
        }

        for (index, approach) in approaches.iter_mut().enumerate() {
            approach.id = index + 1;
        }

        self.harness.write_output(
            "approaches.json",
            &serde_json::json!({
                "approaches": approaches,
                "num_approaches": approaches.len(),
            }),
        )?;

        info!(count = approaches.len(), "Architect produced approaches");
        Ok(approaches)
    }
}
