//! Task manifest and timeline persistence.
//!
//! The manifest is the durable record of a pipeline run: current stage,
//! per-phase outcomes, timestamps. It is rewritten atomically after every
//! transition so a crash can always be diagnosed from disk. The timeline is
//! an append-only human-readable event log beside it.

use crate::util::atomic_write_json;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const TIMELINE_FILE: &str = "timeline.log";

/// Pipeline stages, strictly ordered; terminal states at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialized,
    Validation,
    GitSetup,
    Design,
    Checkpoint,
    Implementation,
    ReviewTest,
    Comparison,
    Integration,
    Finalize,
    Completed,
    Failed,
    Aborted,
    Revision,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Initialized => "initialized",
            Stage::Validation => "validation",
            Stage::GitSetup => "git_setup",
            Stage::Design => "design",
            Stage::Checkpoint => "checkpoint",
            Stage::Implementation => "implementation",
            Stage::ReviewTest => "review_test",
            Stage::Comparison => "comparison",
            Stage::Integration => "integration",
            Stage::Finalize => "finalize",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Aborted => "aborted",
            Stage::Revision => "revision",
        };
        write!(f, "{name}")
    }
}

/// Durable record of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub task_id: String,
    pub spec_path: String,
    pub stage: Stage,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub phases: BTreeMap<String, Value>,
}

/// Owns the manifest file and timeline log for one task.
pub struct TaskState {
    manifest: TaskManifest,
    manifest_file: PathBuf,
    timeline_file: PathBuf,
}

impl TaskState {
    pub fn create(task_dir: &Path, task_id: &str, spec_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(task_dir)
            .with_context(|| format!("Failed to create task directory {}", task_dir.display()))?;

        let now = Utc::now().to_rfc3339();
        let manifest = TaskManifest {
            task_id: task_id.to_string(),
            spec_path: spec_path.display().to_string(),
            stage: Stage::Initialized,
            created_at: now.clone(),
            updated_at: now,
            phases: BTreeMap::new(),
        };

        let state = Self {
            manifest,
            manifest_file: task_dir.join(MANIFEST_FILE),
            timeline_file: task_dir.join(TIMELINE_FILE),
        };
        state.persist()?;
        Ok(state)
    }

    /// Reload a manifest from disk (status queries, crash inspection).
    pub fn load(task_dir: &Path) -> Result<TaskManifest> {
        let path = task_dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse manifest")
    }

    pub fn manifest(&self) -> &TaskManifest {
        &self.manifest
    }

    /// Advance the stage and persist. Persistence failures are logged, not
    /// fatal: the pipeline must keep reporting through its own channel.
    pub fn set_stage(&mut self, stage: Stage) {
        self.manifest.stage = stage;
        self.manifest.updated_at = Utc::now().to_rfc3339();
        if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to persist manifest");
        }
    }

    /// Record a phase outcome document and persist.
    pub fn record_phase(&mut self, phase: &str, value: Value) {
        self.manifest.phases.insert(phase.to_string(), value);
        self.manifest.updated_at = Utc::now().to_rfc3339();
        if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to persist manifest");
        }
    }

    /// Append one line to the timeline log.
    pub fn timeline(&self, level: &str, message: &str) {
        let line = format!("[{}] [{}] {}\n", Utc::now().to_rfc3339(), level, message);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.timeline_file)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(error = %e, "Failed to append timeline entry");
        }
    }

    fn persist(&self) -> Result<()> {
        atomic_write_json(&self.manifest_file, &self.manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_persists_initial_manifest() {
        let dir = tempdir().unwrap();
        let state =
            TaskState::create(dir.path(), "task-20250101-120000", Path::new("spec.md")).unwrap();
        assert_eq!(state.manifest().stage, Stage::Initialized);

        let loaded = TaskState::load(dir.path()).unwrap();
        assert_eq!(loaded.task_id, "task-20250101-120000");
        assert_eq!(loaded.stage, Stage::Initialized);
    }

    #[test]
    fn test_stage_transitions_are_persisted() {
        let dir = tempdir().unwrap();
        let mut state =
            TaskState::create(dir.path(), "task-20250101-120000", Path::new("spec.md")).unwrap();

        state.set_stage(Stage::Design);
        assert_eq!(TaskState::load(dir.path()).unwrap().stage, Stage::Design);

        state.set_stage(Stage::Implementation);
        assert_eq!(
            TaskState::load(dir.path()).unwrap().stage,
            Stage::Implementation
        );
    }

    #[test]
    fn test_record_phase_outcomes() {
        let dir = tempdir().unwrap();
        let mut state =
            TaskState::create(dir.path(), "task-20250101-120000", Path::new("spec.md")).unwrap();

        state.record_phase(
            "design",
            serde_json::json!({"status": "completed", "num_approaches": 2}),
        );

        let loaded = TaskState::load(dir.path()).unwrap();
        assert_eq!(loaded.phases["design"]["num_approaches"], 2);
    }

    #[test]
    fn test_timeline_appends() {
        let dir = tempdir().unwrap();
        let state =
            TaskState::create(dir.path(), "task-20250101-120000", Path::new("spec.md")).unwrap();
        state.timeline("PHASE", "validation_start");
        state.timeline("PHASE", "validation_done");

        let log = std::fs::read_to_string(dir.path().join(TIMELINE_FILE)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[PHASE] validation_start"));
        assert!(lines[1].contains("[PHASE] validation_done"));
    }

    #[test]
    fn test_stage_serde_snake_case() {
        let json = serde_json::to_string(&Stage::ReviewTest).unwrap();
        assert_eq!(json, r#""review_test""#);
        let stage: Stage = serde_json::from_str(r#""git_setup""#).unwrap();
        assert_eq!(stage, Stage::GitSetup);
    }
}
