//! Runtime configuration for Crucible.
//!
//! Loaded from a YAML file (`crucible.yaml` by default). Every section has
//! serde defaults so a partial file works; `Config::write_default` emits a
//! fully-populated starting point.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Error substrings for which retrying an agent invocation is pointless.
fn default_non_retryable_patterns() -> Vec<String> {
    [
        "hit your limit",
        "rate limit",
        "quota exceeded",
        "billing",
        "unauthorized",
        "authentication failed",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./workspace")
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from("./prompts")
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_agent_cmd() -> String {
    "claude".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_num_approaches() -> usize {
    1
}

fn default_checkpoint_timeout_secs() -> u64 {
    3600
}

fn default_ask_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Target repository URL (or local path) the pipeline implements against.
    #[serde(default)]
    pub target_repo: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Access token inserted into the clone URL for private repositories.
    #[serde(default)]
    pub access_token: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            target_repo: String::new(),
            default_branch: default_branch(),
            access_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "default_prompts_dir")]
    pub directory: PathBuf,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            directory: default_prompts_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_agent_cmd")]
    pub agent_cmd: String,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay: u64,
    /// Overridable list of error substrings that abort without retry.
    #[serde(default = "default_non_retryable_patterns")]
    pub non_retryable_patterns: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            agent_cmd: default_agent_cmd(),
            timeout: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay_secs(),
            non_retryable_patterns: default_non_retryable_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Pause for human approval after the design phase.
    #[serde(default = "default_true")]
    pub checkpoint: bool,
    /// Seconds to wait for a checkpoint decision before treating it as abort.
    #[serde(default = "default_checkpoint_timeout_secs")]
    pub checkpoint_timeout: u64,
    /// Approach count used when the spec does not declare one.
    #[serde(default = "default_num_approaches")]
    pub num_approaches: usize,
    /// Run reviewer and tester agents against each implementation.
    #[serde(default = "default_true")]
    pub review_test: bool,
    /// Rank surviving implementations when more than one succeeds.
    #[serde(default = "default_true")]
    pub comparison: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            checkpoint: true,
            checkpoint_timeout: default_checkpoint_timeout_secs(),
            num_approaches: default_num_approaches(),
            review_test: true,
            comparison: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Permission rule lists, each entry `Tool(pattern)` or bare `Tool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub ask: Vec<String>,
    /// Seconds to wait for a human permission decision before denying.
    #[serde(default = "default_ask_timeout_secs")]
    pub ask_timeout: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            allow: vec![
                "Read(*)".into(),
                "Glob(*)".into(),
                "Grep(*)".into(),
                "Write(src/**)".into(),
                "Edit(src/**)".into(),
            ],
            deny: vec!["Bash(rm -rf *)".into(), "Bash(sudo *)".into()],
            ask: vec!["Bash(*)".into(), "Write(*)".into()],
            ask_timeout: default_ask_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Write a fully-populated default config for `crucible init`.
    pub fn write_default(path: &Path) -> Result<()> {
        let config = Config::default();
        let content =
            serde_yaml::to_string(&config).context("Failed to serialize default config")?;
        crate::util::atomic_write(path, &content)?;
        Ok(())
    }

    /// Directory holding all pipeline runs.
    pub fn tasks_dir(&self) -> PathBuf {
        self.workspace.root.join("tasks")
    }

    /// Directory for one pipeline run.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(task_id)
    }
}
