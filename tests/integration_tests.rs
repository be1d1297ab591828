//! End-to-end pipeline scenarios driven through a stub agent CLI.
//!
//! The stub is a shell script that reads the initial user record and picks a
//! canned stream-json reply based on which agent's prompt it received, so a
//! whole pipeline runs without the real CLI.

#![cfg(unix)]

use crucible::config::Config;
use crucible::pipeline::state::{Stage, TaskState};
use crucible::pipeline::PipelineController;
use std::path::{Path, PathBuf};
use std::time::Duration;

const STUB_AGENT: &str = r###"#!/bin/sh
read line
case "$line" in
  *"software architect"*)
    case "$line" in
      *"design 1 distinct"*)
        printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"```json\n[{\"name\":\"Solo\",\"description\":\"direct implementation\"}]\n```","session_id":"arch","total_cost_usd":0.01}'
        ;;
      *"design 2 distinct"*)
        printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"```json\n[{\"name\":\"Alpha\",\"description\":\"first\",\"concern\":\"backend\"},{\"name\":\"Beta\",\"description\":\"second\",\"concern\":\"frontend\"}]\n```","session_id":"arch","total_cost_usd":0.01}'
        ;;
      *)
        printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"```json\n[{\"name\":\"One\"},{\"name\":\"Two\"},{\"name\":\"Three\"}]\n```","session_id":"arch","total_cost_usd":0.01}'
        ;;
    esac
    ;;
  *"implementing one approach"*)
    id=1
    case "$line" in
      *"APPROACH (2"*) id=2 ;;
      *"APPROACH (3"*) id=3 ;;
    esac
    printf 'generated by approach %s\n' "$id" > "impl_note_${id}.rs"
    printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"implemented","session_id":"impl","total_cost_usd":0.02}'
    ;;
  *"Review the implementation"*)
    printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"## Review\nSolid work.","session_id":"rev","total_cost_usd":0.01}'
    ;;
  *"Write tests for"*)
    printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"All tests pass.","session_id":"test","total_cost_usd":0.01}'
    ;;
  *"Compare the"*)
    printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"Beta wins.\n```json\n[2, 1]\n```","session_id":"cmp","total_cost_usd":0.01}'
    ;;
  *"integration worktree"*)
    printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"integrated","session_id":"int","total_cost_usd":0.01}'
    ;;
  *)
    printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"ok","session_id":"misc","total_cost_usd":0.0}'
    ;;
esac
"###;

struct Harness {
    _dir: tempfile::TempDir,
    workspace: PathBuf,
    spec_path: PathBuf,
    config: Config,
}

impl Harness {
    fn new(spec_content: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let origin = init_origin(dir.path());
        let stub = write_stub(dir.path());
        let workspace = dir.path().join("workspace");
        let spec_path = dir.path().join("planning-spec.md");
        std::fs::write(&spec_path, spec_content).unwrap();

        let mut config = Config::default();
        config.workspace.root = workspace.clone();
        config.project.target_repo = origin.display().to_string();
        config.execution.agent_cmd = stub.display().to_string();
        config.execution.retry_delay = 0;
        config.pipeline.checkpoint = false;
        config.pipeline.checkpoint_timeout = 2;
        config.pipeline.review_test = false;

        Self {
            _dir: dir,
            workspace,
            spec_path,
            config,
        }
    }

    async fn run(&self) -> crucible::pipeline::PipelineOutcome {
        PipelineController::new(self.config.clone())
            .run_from_spec(&self.spec_path)
            .await
    }

    /// Write a checkpoint decision as soon as the task directory appears,
    /// the way the CLI would from another process.
    fn write_decision_when_ready(&self, decision: &'static str) -> tokio::task::JoinHandle<()> {
        let tasks_dir = self.workspace.join("tasks");
        tokio::spawn(async move {
            for _ in 0..200 {
                if let Ok(entries) = std::fs::read_dir(&tasks_dir) {
                    if let Some(entry) = entries.flatten().find(|e| e.path().is_dir()) {
                        std::fs::write(entry.path().join("checkpoint-decision.json"), decision)
                            .unwrap();
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("task directory never appeared");
        })
    }
}

fn init_origin(dir: &Path) -> PathBuf {
    let origin = dir.join("target-app");
    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = git2::Repository::init_opts(&origin, &opts).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    drop(config);

    std::fs::write(origin.join("README.md"), "# target app\n").unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    origin
}

fn write_stub(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("stub-agent.sh");
    std::fs::write(&path, STUB_AGENT).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

const SINGLE_APPROACH_SPEC: &str = "\
# Demo Feature

Build a small feature for the target app, in Rust, with tests.

## Implementation Methods

### Method 1: Solo
Implement the feature directly on top of the existing module layout.
Libraries: tokio
";

const TWO_APPROACH_SPEC: &str = "\
# Demo Feature

Build a small feature for the target app, in Rust, with tests.

## Implementation Methods (2 compared)

### Method 1: Alpha
A straightforward implementation.
Libraries: tokio

### Method 2: Beta
A fancier implementation.
Libraries: tokio, serde
";

const THREE_APPROACH_SPEC: &str = "\
# Demo Feature

Build a small feature for the target app, in Rust, with tests.

## Implementation Methods (3 compared)

### Method 1: One
First way.
Libraries: tokio

### Method 2: Two
Second way.
Libraries: tokio

### Method 3: Three
Third way.
Libraries: tokio
";

const COMBINED_SPEC: &str = "\
# Split Feature

Build the API and UI halves of a feature for the target app in Rust.

## Implementation Methods (2 combined)

### Method 1: API surface
Concern: backend
Libraries: axum

### Method 2: UI
Concern: frontend
Libraries: leptos
";

#[tokio::test]
async fn scenario_single_approach_produces_single_result() {
    let mut harness = Harness::new(SINGLE_APPROACH_SPEC);
    harness.config.pipeline.review_test = true;

    let outcome = harness.run().await;
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert_eq!(outcome.stage, Stage::Completed);

    // One implementation, reviewed and tested; no comparison ran.
    assert_eq!(outcome.implementations.len(), 1);
    let record = &outcome.implementations[0];
    assert!(record.success);
    assert_eq!(record.approach_id, 1);
    assert_eq!(record.review_success, Some(true));
    assert_eq!(record.test_success, Some(true));
    assert!(outcome.rankings.is_none());
    assert!(outcome.merge_records.is_empty());
    assert_eq!(outcome.selected_branch.as_deref(), Some(record.branch.as_str()));

    // The agent's work landed in the worktree and was committed.
    assert!(record.worktree_path.join("impl_note_1.rs").exists());
    let summary = record.change_summary.as_ref().unwrap();
    assert!(summary
        .changed_files
        .contains(&"impl_note_1.rs".to_string()));

    // Artifacts persisted.
    assert!(outcome.task_dir.join("evaluation.md").exists());
    assert!(outcome.task_dir.join("integration-info.json").exists());
    assert_eq!(
        TaskState::load(&outcome.task_dir).unwrap().stage,
        Stage::Completed
    );
}

#[tokio::test]
async fn scenario_two_approaches_are_compared_and_ranked() {
    let harness = Harness::new(TWO_APPROACH_SPEC);

    let outcome = harness.run().await;
    assert!(outcome.success, "error: {:?}", outcome.error);

    assert_eq!(outcome.implementations.len(), 2);
    assert!(outcome.implementations.iter().all(|r| r.success));

    // A ranking of exactly the two distinct approach ids.
    let rankings = outcome.rankings.clone().unwrap();
    assert_eq!(rankings, vec![2, 1]);

    // Selection timed out, defaulting to the top-ranked approach.
    let selected = outcome.selected_branch.as_deref().unwrap();
    assert!(selected.ends_with("/impl-2"));

    // Persisted by the comparator.
    let rankings_file = outcome.task_dir.join("comparator/rankings.json");
    let persisted: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(rankings_file).unwrap()).unwrap();
    assert_eq!(persisted["rankings"], serde_json::json!([2, 1]));
}

#[tokio::test]
async fn scenario_checkpoint_rejection_filters_implementation_tasks() {
    let mut harness = Harness::new(THREE_APPROACH_SPEC);
    harness.config.pipeline.checkpoint = true;
    harness.config.pipeline.checkpoint_timeout = 30;
    harness.config.pipeline.comparison = false;

    let writer =
        harness.write_decision_when_ready(r#"{"action": "approve", "rejected_approaches": [2]}"#);
    let outcome = harness.run().await;
    writer.await.unwrap();

    assert!(outcome.success, "error: {:?}", outcome.error);

    // Exactly two tasks ran, for approaches 1 and 3.
    let mut ids: Vec<usize> = outcome
        .implementations
        .iter()
        .map(|r| r.approach_id)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3]);

    let impl_dir = outcome.task_dir.join("implementations");
    assert!(impl_dir.join("impl-1").exists());
    assert!(!impl_dir.join("impl-2").exists());
    assert!(impl_dir.join("impl-3").exists());
}

#[tokio::test]
async fn scenario_checkpoint_abort_halts_cleanly() {
    let mut harness = Harness::new(TWO_APPROACH_SPEC);
    harness.config.pipeline.checkpoint = true;
    harness.config.pipeline.checkpoint_timeout = 30;

    let writer = harness.write_decision_when_ready(r#"{"action": "abort"}"#);
    let outcome = harness.run().await;
    writer.await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.stage, Stage::Aborted);
    assert!(outcome.implementations.is_empty());
    assert_eq!(
        TaskState::load(&outcome.task_dir).unwrap().stage,
        Stage::Aborted
    );
}

#[tokio::test]
async fn scenario_checkpoint_revise_surfaces_feedback() {
    let mut harness = Harness::new(TWO_APPROACH_SPEC);
    harness.config.pipeline.checkpoint = true;
    harness.config.pipeline.checkpoint_timeout = 30;

    let writer = harness.write_decision_when_ready(
        r#"{"action": "revise", "feedback": "use fewer dependencies"}"#,
    );
    let outcome = harness.run().await;
    writer.await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.stage, Stage::Revision);
    assert_eq!(outcome.feedback.as_deref(), Some("use fewer dependencies"));
}

#[tokio::test]
async fn scenario_combined_mode_merges_and_integrates() {
    let harness = Harness::new(COMBINED_SPEC);

    let outcome = harness.run().await;
    assert!(outcome.success, "error: {:?}", outcome.error);

    assert_eq!(outcome.implementations.len(), 2);
    assert!(outcome.implementations.iter().all(|r| r.success));

    // Both branches merged without conflict.
    assert_eq!(outcome.merge_records.len(), 2);
    assert!(outcome.merge_records.iter().all(|m| !m.conflict));

    let selected = outcome.selected_branch.as_deref().unwrap();
    assert!(selected.ends_with("/integration"));

    // The integration worktree holds both halves.
    let integration_dir = outcome.task_dir.join("integration");
    assert!(integration_dir.join("impl_note_1.rs").exists());
    assert!(integration_dir.join("impl_note_2.rs").exists());
}

#[tokio::test]
async fn invalid_spec_fails_before_any_agent_runs() {
    let harness = Harness::new("# Too short");

    let outcome = harness.run().await;
    assert!(!outcome.success);
    assert_eq!(outcome.stage, Stage::Failed);
    assert!(!outcome.validation_errors.is_empty());
    assert!(outcome.task_dir.join("validation-errors.md").exists());

    // No clone, no worktrees: validation halted the pipeline first.
    assert!(!harness.workspace.join(".cache").exists());
}
