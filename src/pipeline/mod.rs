//! Pipeline controller: the top-level phase state machine.
//!
//! validation -> design -> checkpoint (optional) -> implementation
//! (parallel) -> review/test (parallel, optional) -> comparison or
//! integration (conditional) -> finalize.
//!
//! Every transition is persisted before the next phase begins, and no error
//! escapes `run_from_spec` as a fault: each failure is caught, classified,
//! persisted, and reported in the outcome.

pub mod state;

use crate::agents::{
    AgentTask, Approach, ArchitectAgent, ArchitectContext, ComparatorAgent, ComparisonContext,
    ComparisonEntry, ImplementationContext, ImplementerAgent, IntegrationContext, IntegratorAgent,
    MergeRecord, ReviewContext, ReviewerAgent, TestContext, TesterAgent,
};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::executor::{AgentExecutor, ExecutorConfig};
use crate::git::{ChangeSummary, GitManager};
use crate::permissions::PermissionGate;
use crate::queue::{DecisionBridge, Question, QuestionBroker, QuestionType};
use crate::runner::{run_all, TaskResult};
use crate::spec::{parse_spec, validate_spec, write_validation_errors, PipelineMode};
use crate::util::atomic_write_json;
use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};
use state::{Stage, TaskState};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Optional collaborator that builds additional prompt context from the
/// target project. Purely additive; never required for correctness.
pub trait ContextProvider: Send + Sync {
    fn build_context(&self, project_path: &Path, spec_content: &str) -> Result<String>;
}

/// Outcome of running one approach end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationRecord {
    pub approach_id: usize,
    pub approach: Approach,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<ChangeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_success: Option<bool>,
}

/// Final report of one pipeline run. Always returned, never thrown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub success: bool,
    pub task_id: String,
    pub task_dir: PathBuf,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implementations: Vec<ImplementationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rankings: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_records: Vec<MergeRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_branch: Option<String>,
}

impl PipelineOutcome {
    fn empty(task_id: &str, task_dir: &Path) -> Self {
        Self {
            success: false,
            task_id: task_id.to_string(),
            task_dir: task_dir.to_path_buf(),
            stage: Stage::Initialized,
            error: None,
            validation_errors: Vec::new(),
            feedback: None,
            implementations: Vec::new(),
            rankings: None,
            merge_records: Vec::new(),
            selected_branch: None,
        }
    }
}

/// Parsed checkpoint reply. Accepts the JSON decision document or a bare
/// action word.
#[derive(Debug, Clone, Default, Deserialize)]
struct CheckpointDecision {
    #[serde(default)]
    action: String,
    #[serde(default)]
    approved_approaches: Option<Vec<usize>>,
    #[serde(default)]
    rejected_approaches: Option<Vec<usize>>,
    #[serde(default)]
    feedback: Option<String>,
}

fn parse_checkpoint_decision(response: &str) -> CheckpointDecision {
    if let Ok(decision) = serde_json::from_str::<CheckpointDecision>(response) {
        if !decision.action.is_empty() {
            return decision;
        }
    }
    CheckpointDecision {
        action: response.trim().to_lowercase(),
        ..Default::default()
    }
}

/// Apply the approved/rejected id subsets from a checkpoint decision.
fn filter_approaches(approaches: Vec<Approach>, decision: &CheckpointDecision) -> Vec<Approach> {
    approaches
        .into_iter()
        .filter(|a| {
            if let Some(approved) = &decision.approved_approaches {
                if !approved.contains(&a.id) {
                    return false;
                }
            }
            if let Some(rejected) = &decision.rejected_approaches {
                if rejected.contains(&a.id) {
                    return false;
                }
            }
            true
        })
        .collect()
}

fn parse_selection(response: &str) -> Option<usize> {
    #[derive(Deserialize)]
    struct Selection {
        selected_id: usize,
    }
    if let Ok(selection) = serde_json::from_str::<Selection>(response) {
        return Some(selection.selected_id);
    }
    response.trim().parse().ok()
}

fn generate_task_id() -> String {
    format!("task-{}", Local::now().format("%Y%m%d-%H%M%S"))
}

/// Review/test sub-task outcome, attached to its implementation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubTaskKind {
    Review,
    Test,
}

struct SubTaskOutcome {
    approach_id: usize,
    kind: SubTaskKind,
    success: bool,
}

type BoxedSubTask = Pin<Box<dyn Future<Output = Result<SubTaskOutcome>> + Send>>;

/// Drives one pipeline run end to end.
pub struct PipelineController {
    config: Config,
    context_provider: Option<Box<dyn ContextProvider>>,
}

impl PipelineController {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            context_provider: None,
        }
    }

    pub fn with_context_provider(mut self, provider: Box<dyn ContextProvider>) -> Self {
        self.context_provider = Some(provider);
        self
    }

    /// Run the whole pipeline for one spec. Infallible by contract: every
    /// failure is reported through the returned outcome.
    pub async fn run_from_spec(&self, spec_path: &Path) -> PipelineOutcome {
        let task_id = generate_task_id();
        let task_dir = self.config.task_dir(&task_id);

        let mut state = match TaskState::create(&task_dir, &task_id, spec_path) {
            Ok(state) => state,
            Err(e) => {
                let mut outcome = PipelineOutcome::empty(&task_id, &task_dir);
                outcome.stage = Stage::Failed;
                outcome.error = Some(format!("Failed to initialize task: {e}"));
                return outcome;
            }
        };

        info!(task_id = %task_id, spec = %spec_path.display(), "Pipeline starting");

        let broker = Arc::new(QuestionBroker::new(&task_dir));
        let bridge = DecisionBridge::new(broker.clone(), task_dir.clone()).spawn();

        let result = self
            .run_pipeline(spec_path, &task_id, &task_dir, &mut state, &broker)
            .await;

        bridge.abort();

        match result {
            Ok(outcome) => {
                info!(task_id = %task_id, "Pipeline completed");
                outcome
            }
            Err(e) => {
                let mut outcome = PipelineOutcome::empty(&task_id, &task_dir);
                match &e {
                    PipelineError::Aborted => {
                        state.set_stage(Stage::Aborted);
                        state.timeline("CHECKPOINT", "aborted");
                        outcome.stage = Stage::Aborted;
                    }
                    PipelineError::RevisionRequested { feedback } => {
                        state.set_stage(Stage::Revision);
                        state.timeline("CHECKPOINT", &format!("revision_requested: {feedback}"));
                        outcome.stage = Stage::Revision;
                        outcome.feedback = Some(feedback.clone());
                    }
                    PipelineError::ValidationFailed { errors } => {
                        state.set_stage(Stage::Failed);
                        state.timeline("ERROR", "validation_failed");
                        outcome.stage = Stage::Failed;
                        outcome.validation_errors = errors.clone();
                    }
                    _ => {
                        state.set_stage(Stage::Failed);
                        state.timeline("ERROR", &e.to_string());
                        outcome.stage = Stage::Failed;
                    }
                }
                outcome.error = Some(e.to_string());
                error!(task_id = %task_id, error = %e, "Pipeline halted");
                outcome
            }
        }
    }

    async fn run_pipeline(
        &self,
        spec_path: &Path,
        task_id: &str,
        task_dir: &Path,
        state: &mut TaskState,
        broker: &Arc<QuestionBroker>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let gate = PermissionGate::from_config(&self.config.permissions)
            .map_err(PipelineError::Other)?
            .with_broker(broker.clone());
        let executor = Arc::new(AgentExecutor::new(
            ExecutorConfig::from_config(&self.config.execution),
            Arc::new(gate),
        ));
        let git = Arc::new(GitManager::new(
            self.config.workspace.root.clone(),
            &self.config.project.target_repo,
            &self.config.project.default_branch,
            &self.config.project.access_token,
        ));

        // === Validation ===
        if self.config.validation.enabled {
            state.set_stage(Stage::Validation);
            state.timeline("PHASE", "validation_start");

            let report = validate_spec(spec_path);
            if !report.valid {
                let _ = write_validation_errors(&report, task_dir);
                state.record_phase(
                    "validation",
                    serde_json::json!({"status": "failed", "errors": report.errors}),
                );
                return Err(PipelineError::ValidationFailed {
                    errors: report.errors,
                });
            }
            for warning in &report.warnings {
                warn!(warning = %warning, "Spec validation warning");
            }
            state.record_phase("validation", serde_json::json!({"status": "completed"}));
            state.timeline("PHASE", "validation_done");
        }

        // === Spec parsing ===
        let spec = parse_spec(spec_path).map_err(PipelineError::Other)?;
        let num_approaches = spec
            .approach_count_hint
            .unwrap_or(self.config.pipeline.num_approaches)
            .max(1);
        info!(
            num_approaches,
            mode = ?spec.mode,
            "Planning spec parsed"
        );

        // === Git setup ===
        state.set_stage(Stage::GitSetup);
        state.timeline("PHASE", "git_setup_start");
        let clone_path = git.ensure_clone()?;
        state.timeline("PHASE", "git_setup_done");

        // === Design ===
        state.set_stage(Stage::Design);
        state.timeline("PHASE", "design_start");

        let project_context = self.build_project_context(&clone_path, &spec.raw_content);
        let architect = ArchitectAgent::new(
            task_dir.join("architect"),
            executor.clone(),
            self.prompt_path("architect.md"),
        )
        .map_err(PipelineError::Other)?;
        let approaches = architect
            .run(ArchitectContext {
                spec_content: spec.raw_content.clone(),
                num_approaches,
                project_path: clone_path.clone(),
                project_context,
            })
            .await
            .map_err(PipelineError::Other)?;

        state.record_phase(
            "design",
            serde_json::json!({"status": "completed", "num_approaches": approaches.len()}),
        );
        state.timeline(
            "PHASE",
            &format!("design_done (approaches={})", approaches.len()),
        );

        // === Checkpoint ===
        let approaches = if self.config.pipeline.checkpoint {
            state.set_stage(Stage::Checkpoint);
            state.timeline("CHECKPOINT", "waiting_for_decision");
            let approaches = self.run_checkpoint(broker, &approaches).await?;
            state.timeline("CHECKPOINT", "approved");
            approaches
        } else {
            approaches
        };

        // === Implementation ===
        state.set_stage(Stage::Implementation);
        state.timeline("PHASE", "implementation_start");

        let mut records = self
            .run_implementations(task_id, &approaches, &spec.raw_content, &executor, &git)
            .await?;

        state.record_phase(
            "implementation",
            serde_json::json!({
                "status": "completed",
                "implementations": records.iter().map(|r| serde_json::json!({
                    "approach_id": r.approach_id,
                    "branch": r.branch,
                    "success": r.success,
                })).collect::<Vec<_>>(),
            }),
        );
        state.timeline("PHASE", "implementation_done");

        // === Review & test ===
        if self.config.pipeline.review_test {
            state.set_stage(Stage::ReviewTest);
            state.timeline("PHASE", "review_test_start");
            self.run_review_test(task_dir, &mut records, &executor).await;
            state.record_phase("review_test", serde_json::json!({"status": "completed"}));
            state.timeline("PHASE", "review_test_done");
        }

        let successes: Vec<&ImplementationRecord> =
            records.iter().filter(|r| r.success).collect();
        if successes.is_empty() {
            return Err(PipelineError::AllImplementationsFailed);
        }

        // === Comparison or integration ===
        let mut rankings = None;
        let mut merge_records = Vec::new();
        let selected_branch;

        if spec.mode == PipelineMode::Concern && successes.len() >= 2 {
            state.set_stage(Stage::Integration);
            state.timeline("PHASE", "integration_start");
            let (branch, merges) = self
                .run_integration(task_id, task_dir, &records, &executor, &git)
                .await?;
            merge_records = merges;
            selected_branch = Some(branch);
            state.record_phase(
                "integration",
                serde_json::json!({"status": "completed", "merges": &merge_records}),
            );
            state.timeline("PHASE", "integration_done");
        } else if successes.len() >= 2 && self.config.pipeline.comparison {
            state.set_stage(Stage::Comparison);
            state.timeline("PHASE", "comparison_start");
            let ranked = self
                .run_comparison(task_dir, &records, &executor)
                .await?;
            state.record_phase(
                "comparison",
                serde_json::json!({"status": "completed", "rankings": &ranked}),
            );
            state.timeline("PHASE", "comparison_done");

            let selected_id = self.run_selection(broker, &ranked).await;
            selected_branch = records
                .iter()
                .find(|r| r.approach_id == selected_id)
                .map(|r| r.branch.clone());
            rankings = Some(ranked);
        } else {
            // Single surviving result.
            selected_branch = successes.first().map(|r| r.branch.clone());
        }

        // === Finalize ===
        state.set_stage(Stage::Finalize);
        state.timeline("PHASE", "finalize_start");
        self.write_evaluation(
            task_id,
            task_dir,
            &records,
            rankings.as_deref(),
            &merge_records,
            selected_branch.as_deref(),
        );
        state.set_stage(Stage::Completed);
        state.timeline("PHASE", "pipeline_completed");

        Ok(PipelineOutcome {
            success: true,
            task_id: task_id.to_string(),
            task_dir: task_dir.to_path_buf(),
            stage: Stage::Completed,
            error: None,
            validation_errors: Vec::new(),
            feedback: None,
            implementations: records,
            rankings,
            merge_records,
            selected_branch,
        })
    }

    fn build_project_context(&self, project_path: &Path, spec_content: &str) -> Option<String> {
        let provider = self.context_provider.as_ref()?;
        match provider.build_context(project_path, spec_content) {
            Ok(context) => Some(context),
            Err(e) => {
                warn!(error = %e, "Context provider failed, continuing without context");
                None
            }
        }
    }

    async fn run_checkpoint(
        &self,
        broker: &Arc<QuestionBroker>,
        approaches: &[Approach],
    ) -> Result<Vec<Approach>, PipelineError> {
        let detail = approaches
            .iter()
            .map(|a| format!("[{}] {}: {}", a.id, a.name, a.description))
            .collect::<Vec<_>>()
            .join("\n");

        let question = Question::new(
            QuestionType::Checkpoint,
            "pipeline",
            "checkpoint",
            "Approve the designed approaches?",
            detail,
        )
        .with_options(vec!["approve".into(), "revise".into(), "abort".into()])
        .with_default("abort")
        .with_timeout(self.config.pipeline.checkpoint_timeout as f64);

        let answer = broker.ask(question).await;
        let decision = parse_checkpoint_decision(&answer.response);

        match decision.action.as_str() {
            "approve" => {
                let filtered = filter_approaches(approaches.to_vec(), &decision);
                if filtered.is_empty() {
                    return Err(PipelineError::NoApprovedApproaches);
                }
                Ok(filtered)
            }
            "revise" => Err(PipelineError::RevisionRequested {
                feedback: decision.feedback.unwrap_or_default(),
            }),
            // Timeouts resolve to the default and land here too.
            _ => Err(PipelineError::Aborted),
        }
    }

    async fn run_implementations(
        &self,
        task_id: &str,
        approaches: &[Approach],
        spec_content: &str,
        executor: &Arc<AgentExecutor>,
        git: &Arc<GitManager>,
    ) -> Result<Vec<ImplementationRecord>, PipelineError> {
        // Worktree creation mutates the shared clone; do it up front,
        // sequentially, before the parallel part begins.
        let mut prepared = Vec::new();
        for approach in approaches {
            let (worktree, branch) = git.create_worktree(task_id, approach.id)?;
            info!(approach = approach.id, branch = %branch, "Worktree ready");
            prepared.push((approach.clone(), worktree, branch));
        }

        let tasks: Vec<_> = prepared
            .iter()
            .map(|(approach, worktree, branch)| {
                let approach = approach.clone();
                let worktree = worktree.clone();
                let branch = branch.clone();
                let spec_content = spec_content.to_string();
                let executor = executor.clone();
                let git = git.clone();
                let prompt_file = self.prompt_path("implementer.md");

                async move {
                    let implementer = ImplementerAgent::new(
                        approach.id,
                        worktree.clone(),
                        executor,
                        prompt_file,
                    )?;
                    let result = implementer
                        .run(ImplementationContext {
                            approach: approach.clone(),
                            spec_content,
                            project_context_path: None,
                        })
                        .await?;

                    let change_summary = if result.success {
                        // Capture any work the agent left uncommitted so the
                        // branch is complete before diffing or merging.
                        let message =
                            format!("Implement approach {}: {}", approach.id, approach.name);
                        if let Err(e) = git.commit_all(&worktree, &message) {
                            warn!(approach = approach.id, error = %e, "Worktree commit failed");
                        }
                        match git.change_summary(&worktree) {
                            Ok(summary) => Some(summary),
                            Err(e) => {
                                warn!(approach = approach.id, error = %e, "Change summary failed");
                                None
                            }
                        }
                    } else {
                        None
                    };

                    Ok(ImplementationRecord {
                        approach_id: approach.id,
                        approach,
                        worktree_path: worktree,
                        branch,
                        success: result.success,
                        error: (!result.success).then(|| result.error_message()),
                        change_summary,
                        review_success: None,
                        test_success: None,
                    })
                }
            })
            .collect();

        let results = run_all(tasks).await;

        let records = results
            .into_iter()
            .map(|task_result: TaskResult<ImplementationRecord>| {
                let ordinal = task_result.ordinal;
                match task_result.outcome {
                    Ok(record) => record,
                    Err(message) => {
                        let (approach, worktree, branch) = prepared[ordinal].clone();
                        ImplementationRecord {
                            approach_id: approach.id,
                            approach,
                            worktree_path: worktree,
                            branch,
                            success: false,
                            error: Some(message),
                            change_summary: None,
                            review_success: None,
                            test_success: None,
                        }
                    }
                }
            })
            .collect();

        Ok(records)
    }

    /// Review and test every successful implementation; sub-tasks all run
    /// concurrently and attach pass/fail outcomes to their records.
    async fn run_review_test(
        &self,
        task_dir: &Path,
        records: &mut [ImplementationRecord],
        executor: &Arc<AgentExecutor>,
    ) {
        let mut tasks: Vec<BoxedSubTask> = Vec::new();

        for record in records.iter().filter(|r| r.success) {
            let approach_id = record.approach_id;
            let approach_name = record.approach.name.clone();
            let impl_path = record.worktree_path.clone();

            let review_workspace = task_dir.join(format!("review-{approach_id}"));
            let review_executor = executor.clone();
            let review_prompt = self.prompt_path("reviewer.md");
            let review_path = impl_path.clone();
            tasks.push(Box::pin(async move {
                let reviewer = ReviewerAgent::new(
                    approach_id,
                    review_workspace,
                    review_executor,
                    review_prompt,
                )?;
                let result = reviewer
                    .run(ReviewContext {
                        approach_id,
                        approach_name,
                        impl_path: review_path,
                    })
                    .await?;
                Ok(SubTaskOutcome {
                    approach_id,
                    kind: SubTaskKind::Review,
                    success: result.success,
                })
            }));

            let test_workspace = task_dir.join(format!("test-{approach_id}"));
            let test_executor = executor.clone();
            let test_prompt = self.prompt_path("tester.md");
            tasks.push(Box::pin(async move {
                let tester =
                    TesterAgent::new(approach_id, test_workspace, test_executor, test_prompt)?;
                let result = tester
                    .run(TestContext {
                        approach_id,
                        impl_path,
                    })
                    .await?;
                Ok(SubTaskOutcome {
                    approach_id,
                    kind: SubTaskKind::Test,
                    success: result.success,
                })
            }));
        }

        for task_result in run_all(tasks).await {
            match task_result.outcome {
                Ok(outcome) => {
                    if let Some(record) = records
                        .iter_mut()
                        .find(|r| r.approach_id == outcome.approach_id)
                    {
                        match outcome.kind {
                            SubTaskKind::Review => record.review_success = Some(outcome.success),
                            SubTaskKind::Test => record.test_success = Some(outcome.success),
                        }
                    }
                }
                Err(message) => {
                    // A failed sub-task degrades its implementation's report
                    // but never the phase.
                    warn!(error = %message, "Review/test sub-task failed");
                }
            }
        }
    }

    async fn run_comparison(
        &self,
        task_dir: &Path,
        records: &[ImplementationRecord],
        executor: &Arc<AgentExecutor>,
    ) -> Result<Vec<usize>, PipelineError> {
        let entries: Vec<ComparisonEntry> = records
            .iter()
            .filter(|r| r.success)
            .map(|r| ComparisonEntry {
                approach: r.approach.clone(),
                impl_path: r.worktree_path.clone(),
                review_workspace: Some(task_dir.join(format!("review-{}", r.approach_id))),
                test_workspace: Some(task_dir.join(format!("test-{}", r.approach_id))),
            })
            .collect();

        let comparator = ComparatorAgent::new(
            task_dir.join("comparator"),
            executor.clone(),
            self.prompt_path("comparator.md"),
        )
        .map_err(PipelineError::Other)?;

        comparator
            .run(ComparisonContext { entries })
            .await
            .map_err(PipelineError::Other)
    }

    /// Ask which ranked implementation to adopt. Defaults to the top-ranked
    /// id on timeout or malformed replies.
    async fn run_selection(&self, broker: &Arc<QuestionBroker>, rankings: &[usize]) -> usize {
        let top = rankings[0];
        let question = Question::new(
            QuestionType::Decision,
            "pipeline",
            "comparison",
            "Select the implementation to adopt",
            format!("Ranked best first: {rankings:?}"),
        )
        .with_options(rankings.iter().map(|id| id.to_string()).collect())
        .with_default(top.to_string())
        .with_timeout(self.config.pipeline.checkpoint_timeout as f64);

        let answer = broker.ask(question).await;
        match parse_selection(&answer.response) {
            Some(id) if rankings.contains(&id) => id,
            _ => {
                warn!(response = %answer.response, "Invalid selection, using top-ranked");
                top
            }
        }
    }

    async fn run_integration(
        &self,
        task_id: &str,
        task_dir: &Path,
        records: &[ImplementationRecord],
        executor: &Arc<AgentExecutor>,
        git: &Arc<GitManager>,
    ) -> Result<(String, Vec<MergeRecord>), PipelineError> {
        let (integration_path, integration_branch) = git.create_integration_worktree(task_id)?;

        // Sequential merges; a conflict is recorded, not fatal.
        let mut merge_records = Vec::new();
        for record in records.iter().filter(|r| r.success) {
            let conflict = git.merge_branch(&record.branch, &integration_path)?;
            merge_records.push(MergeRecord {
                approach_id: record.approach_id,
                branch: record.branch.clone(),
                conflict,
            });
        }

        let integrator = IntegratorAgent::new(
            task_dir.join("integration-agent"),
            executor.clone(),
            self.prompt_path("integrator.md"),
        )
        .map_err(PipelineError::Other)?;

        let implementations = records
            .iter()
            .filter(|r| r.success)
            .map(|r| (r.approach.clone(), r.branch.clone()))
            .collect();
        let result = integrator
            .run(IntegrationContext {
                integration_path,
                implementations,
                merge_records: merge_records.clone(),
            })
            .await
            .map_err(PipelineError::Other)?;

        if !result.success {
            warn!(
                error = %result.error_message(),
                "Integration agent failed; mechanical merges are still on the branch"
            );
        }

        Ok((integration_branch, merge_records))
    }

    /// Persist the human-readable evaluation and the integration pointer.
    /// The final merge into the target project stays a manual action.
    fn write_evaluation(
        &self,
        task_id: &str,
        task_dir: &Path,
        records: &[ImplementationRecord],
        rankings: Option<&[usize]>,
        merge_records: &[MergeRecord],
        selected_branch: Option<&str>,
    ) {
        let mut lines = vec![
            format!("# Evaluation: {task_id}"),
            String::new(),
            "## Implementations".to_string(),
            String::new(),
        ];

        for record in records {
            let status = if record.success { "succeeded" } else { "failed" };
            lines.push(format!(
                "- [{}] {} ({status}), branch `{}`",
                record.approach_id, record.approach.name, record.branch
            ));
            if let Some(summary) = &record.change_summary {
                lines.push(format!(
                    "  - {} files changed, +{} / -{}",
                    summary.files_changed, summary.insertions, summary.deletions
                ));
            }
            if let Some(review) = record.review_success {
                lines.push(format!("  - review: {}", if review { "pass" } else { "fail" }));
            }
            if let Some(test) = record.test_success {
                lines.push(format!("  - tests: {}", if test { "pass" } else { "fail" }));
            }
            if let Some(error) = &record.error {
                lines.push(format!("  - error: {error}"));
            }
        }

        if let Some(rankings) = rankings {
            lines.push(String::new());
            lines.push("## Ranking".to_string());
            lines.push(String::new());
            lines.push(format!("Best first: {rankings:?}"));
        }

        if !merge_records.is_empty() {
            lines.push(String::new());
            lines.push("## Merges".to_string());
            lines.push(String::new());
            for merge in merge_records {
                lines.push(format!(
                    "- `{}`: {}",
                    merge.branch,
                    if merge.conflict { "conflict" } else { "merged" }
                ));
            }
        }

        if let Some(branch) = selected_branch {
            lines.push(String::new());
            lines.push("## Next step".to_string());
            lines.push(String::new());
            lines.push(format!(
                "Selected branch `{branch}`. Merge it manually when ready:\n\n\
                 ```\ngit merge {branch}\n```"
            ));
        }

        if let Err(e) = crate::util::atomic_write(&task_dir.join("evaluation.md"), &lines.join("\n"))
        {
            warn!(error = %e, "Failed to write evaluation");
        }

        if let Some(branch) = selected_branch {
            let worktree = records
                .iter()
                .find(|r| r.branch == branch)
                .map(|r| r.worktree_path.display().to_string());
            let info = serde_json::json!({
                "task_id": task_id,
                "branch": branch,
                "worktree_path": worktree,
                "status": "ready_for_integration",
                "created_at": chrono::Utc::now().to_rfc3339(),
                "instructions": format!(
                    "To integrate, run `git merge {branch}` in the target project, or open a pull request."
                ),
            });
            if let Err(e) = atomic_write_json(&task_dir.join("integration-info.json"), &info) {
                warn!(error = %e, "Failed to write integration info");
            }
        }
    }

    fn prompt_path(&self, name: &str) -> PathBuf {
        self.config.prompts.directory.join(name)
    }
}
