//! Shared plumbing for agent tasks: workspace setup, state persistence,
//! prompt template loading, and execution through the agent executor.

use crate::executor::{AgentExecutor, ExecResult};
use crate::util::atomic_write_json;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Metadata directory kept inside each agent workspace, out of the target
/// project's way (and excluded from implementation branches).
pub const META_DIR: &str = ".crucible";

#[derive(Debug, Serialize)]
struct AgentState {
    status: String,
    created_at: String,
    updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Composed helper every agent task carries.
pub struct AgentHarness {
    name: String,
    workspace: PathBuf,
    executor: Arc<AgentExecutor>,
    state_file: PathBuf,
    created_at: String,
}

impl AgentHarness {
    pub fn new(name: &str, workspace: PathBuf, executor: Arc<AgentExecutor>) -> Result<Self> {
        std::fs::create_dir_all(workspace.join(META_DIR))
            .with_context(|| format!("Failed to create agent workspace {}", workspace.display()))?;
        let state_file = workspace.join(META_DIR).join(format!("{name}_state.json"));
        let harness = Self {
            name: name.to_string(),
            workspace,
            executor,
            state_file,
            created_at: Utc::now().to_rfc3339(),
        };
        harness.set_status("initialized", None);
        Ok(harness)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Load a prompt template from disk, falling back to the built-in
    /// template, and substitute `{key}` placeholders.
    pub fn render_prompt(
        &self,
        prompt_file: &Path,
        fallback: &str,
        vars: &[(&str, &str)],
    ) -> String {
        let template = match std::fs::read_to_string(prompt_file) {
            Ok(content) => content,
            Err(_) => {
                debug!(
                    agent = %self.name,
                    file = %prompt_file.display(),
                    "Prompt template missing, using built-in"
                );
                fallback.to_string()
            }
        };

        let mut rendered = template;
        for (key, value) in vars {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        rendered
    }

    /// Execute the agent, tracking run state in the workspace.
    pub async fn execute(
        &self,
        prompt: &str,
        working_dir: Option<&Path>,
        output_file: Option<&Path>,
    ) -> ExecResult {
        let dir = working_dir.unwrap_or(&self.workspace);
        self.set_status("running", None);

        let result = self.executor.execute(prompt, dir, output_file).await;

        if result.success {
            self.set_status("completed", None);
        } else {
            self.set_status("failed", Some(&result.error_message()));
        }
        result
    }

    /// Write a JSON artifact into the agent workspace.
    pub fn write_output<T: Serialize>(&self, filename: &str, value: &T) -> Result<PathBuf> {
        let path = self.workspace.join(filename);
        atomic_write_json(&path, value)?;
        debug!(agent = %self.name, file = %path.display(), "Wrote output artifact");
        Ok(path)
    }

    fn set_status(&self, status: &str, error: Option<&str>) {
        let state = AgentState {
            status: status.to_string(),
            created_at: self.created_at.clone(),
            updated_at: Utc::now().to_rfc3339(),
            error: error.map(String::from),
        };
        if let Err(e) = atomic_write_json(&self.state_file, &state) {
            warn!(agent = %self.name, error = %e, "Failed to persist agent state");
        }
    }
}
