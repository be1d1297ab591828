//! CLI subcommand handlers. Thin wrappers over the library: they load the
//! config, call into the pipeline or write decision artifacts, and print.

use anyhow::{anyhow, Context, Result};
use crucible::config::Config;
use crucible::pipeline::PipelineController;
use crucible::queue::{CHECKPOINT_DECISION_FILE, QUEUE_FILE_NAME};
use crucible::util::atomic_write_json;
use std::path::Path;

/// `crucible init` — write a default config file.
pub fn init(output: &Path) -> Result<()> {
    if output.exists() {
        return Err(anyhow!(
            "{} already exists; remove it first to regenerate",
            output.display()
        ));
    }
    Config::write_default(output)?;
    println!("Wrote default configuration to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Set project.target_repo in {}", output.display());
    println!("  2. Write a planning spec (markdown)");
    println!("  3. Run: crucible run --spec planning-spec.md");
    Ok(())
}

/// `crucible run` — execute the full pipeline.
pub async fn run(config_path: &Path, spec_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let controller = PipelineController::new(config);
    let outcome = controller.run_from_spec(spec_path).await;

    println!();
    println!("Task:   {}", outcome.task_id);
    println!("Stage:  {}", outcome.stage);
    if let Some(branch) = &outcome.selected_branch {
        println!("Branch: {branch}");
    }
    if let Some(rankings) = &outcome.rankings {
        println!("Ranking (best first): {rankings:?}");
    }
    for record in &outcome.implementations {
        let status = if record.success { "ok" } else { "failed" };
        println!("  impl {} [{}] {}", record.approach_id, status, record.branch);
    }
    if let Some(feedback) = &outcome.feedback {
        println!("Feedback: {feedback}");
    }

    if outcome.success {
        println!("Artifacts: {}", outcome.task_dir.display());
        Ok(())
    } else {
        Err(anyhow!(
            "Pipeline did not complete: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        ))
    }
}

/// `crucible approve` — approve a checkpoint, optionally rejecting ids.
pub fn approve(config_path: &Path, task_id: &str, reject: &[usize]) -> Result<()> {
    let mut decision = serde_json::json!({"action": "approve"});
    if !reject.is_empty() {
        decision["rejected_approaches"] = serde_json::json!(reject);
    }
    write_checkpoint_decision(config_path, task_id, &decision)?;
    println!("Approval recorded for {task_id}");
    Ok(())
}

/// `crucible revise` — send the pipeline back with feedback.
pub fn revise(config_path: &Path, task_id: &str, feedback: &str) -> Result<()> {
    let decision = serde_json::json!({"action": "revise", "feedback": feedback});
    write_checkpoint_decision(config_path, task_id, &decision)?;
    println!("Revision request recorded for {task_id}");
    Ok(())
}

/// `crucible abort` — stop a task at its checkpoint.
pub fn abort(config_path: &Path, task_id: &str) -> Result<()> {
    let decision = serde_json::json!({"action": "abort"});
    write_checkpoint_decision(config_path, task_id, &decision)?;
    println!("Abort recorded for {task_id}");
    Ok(())
}

/// `crucible answer` — answer any pending question by id.
pub fn answer(
    config_path: &Path,
    task_id: &str,
    question_id: &str,
    response: &str,
) -> Result<()> {
    let task_dir = task_dir(config_path, task_id)?;
    let path = task_dir.join(format!("answer-{question_id}.json"));
    atomic_write_json(&path, &serde_json::json!({"response": response}))?;
    println!("Answer recorded for {question_id}");
    Ok(())
}

/// `crucible status` — show one task or list all of them.
pub fn status(config_path: &Path, task_id: Option<&str>) -> Result<()> {
    let config = Config::load(config_path)?;

    match task_id {
        Some(task_id) => {
            let task_dir = config.task_dir(task_id);
            let manifest = crucible::pipeline::state::TaskState::load(&task_dir)?;
            println!("Task:    {}", manifest.task_id);
            println!("Stage:   {}", manifest.stage);
            println!("Spec:    {}", manifest.spec_path);
            println!("Updated: {}", manifest.updated_at);
            for (phase, value) in &manifest.phases {
                println!("  {phase}: {value}");
            }
            print_pending_questions(&task_dir);
        }
        None => {
            let tasks_dir = config.tasks_dir();
            let Ok(entries) = std::fs::read_dir(&tasks_dir) else {
                println!("No tasks found in {}", tasks_dir.display());
                return Ok(());
            };
            let mut names: Vec<String> = entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect();
            names.sort();
            for name in names {
                match crucible::pipeline::state::TaskState::load(&tasks_dir.join(&name)) {
                    Ok(manifest) => println!("{name}  {}", manifest.stage),
                    Err(_) => println!("{name}  (no manifest)"),
                }
            }
        }
    }
    Ok(())
}

fn print_pending_questions(task_dir: &Path) {
    let Ok(content) = std::fs::read_to_string(task_dir.join(QUEUE_FILE_NAME)) else {
        return;
    };
    let Ok(snapshot) = serde_json::from_str::<serde_json::Value>(&content) else {
        return;
    };
    let Some(questions) = snapshot["questions"].as_array() else {
        return;
    };

    let pending: Vec<_> = questions
        .iter()
        .filter(|q| q["status"] == "pending")
        .collect();
    if pending.is_empty() {
        return;
    }

    println!("Pending questions:");
    for question in pending {
        println!(
            "  {} [{}] {}",
            question["id"].as_str().unwrap_or("?"),
            question["type"].as_str().unwrap_or("?"),
            question["title"].as_str().unwrap_or("")
        );
    }
}

fn write_checkpoint_decision(
    config_path: &Path,
    task_id: &str,
    decision: &serde_json::Value,
) -> Result<()> {
    let task_dir = task_dir(config_path, task_id)?;
    atomic_write_json(&task_dir.join(CHECKPOINT_DECISION_FILE), decision)
}

fn task_dir(config_path: &Path, task_id: &str) -> Result<std::path::PathBuf> {
    let config = Config::load(config_path)?;
    let task_dir = config.task_dir(task_id);
    if !task_dir.exists() {
        return Err(anyhow!("Task {task_id} not found under {}", task_dir.display()))
            .context("Run `crucible status` to list tasks");
    }
    Ok(task_dir)
}
