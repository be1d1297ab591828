//! Human-readable transcript persistence.
//!
//! Every invocation writes a `conversation.txt` in its working directory
//! and, when the working directory sits inside a task directory, appends
//! the same exchange to the task-wide `full-conversation.txt`.

use crate::executor::ExecResult;
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TRANSCRIPT_FILE: &str = "conversation.txt";
const FULL_TRANSCRIPT_FILE: &str = "full-conversation.txt";

/// Persist the exchange. Transcript failures are logged, never fatal.
pub fn save(prompt: &str, result: &ExecResult, working_dir: &Path) {
    let timestamp = Utc::now().to_rfc3339();

    let content = format!(
        "=== CONVERSATION TRANSCRIPT ===\n\
         Generated at: {timestamp}\n\
         \n\
         === PROMPT ===\n\
         {prompt}\n\
         \n\
         === AGENT OUTPUT ===\n\
         {output}\n\
         \n\
         === EXECUTION METADATA ===\n\
         Working Directory: {dir}\n\
         Success: {success}\n\
         Duration: {duration:.2}s\n\
         Session ID: {session}\n\
         Cost (USD): ${cost:.4}\n\
         Error: {error}\n",
        output = result.output,
        dir = working_dir.display(),
        success = result.success,
        duration = result.duration.as_secs_f64(),
        session = result.session_id,
        cost = result.cost_usd,
        error = result.error_message(),
    );

    let path = working_dir.join(TRANSCRIPT_FILE);
    if let Err(e) = std::fs::write(&path, &content) {
        warn!(file = %path.display(), error = %e, "Failed to save transcript");
        return;
    }
    debug!(file = %path.display(), "Transcript saved");

    append_full_transcript(prompt, result, working_dir, &timestamp);
}

/// Append to the task-level running transcript, if the working directory is
/// inside a task directory.
fn append_full_transcript(prompt: &str, result: &ExecResult, working_dir: &Path, timestamp: &str) {
    let resolved = working_dir
        .canonicalize()
        .unwrap_or_else(|_| working_dir.to_path_buf());

    let Some(task_dir) = find_task_dir(&resolved) else {
        debug!(dir = %working_dir.display(), "Not inside a task directory, skipping full transcript");
        return;
    };

    let task_id = task_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let phase_name = resolved
        .strip_prefix(&task_dir)
        .map(infer_phase_name)
        .unwrap_or_else(|_| "UNKNOWN PHASE".to_string());

    let entry = format!(
        "\n===== TASK: {task_id} =====\n\
         ===== {phase_name} =====\n\
         Timestamp: {timestamp}\n\
         Working Directory: {dir}\n\
         Duration: {duration:.2}s\n\
         Success: {success}\n\
         Session ID: {session}\n\
         Cost (USD): ${cost:.4}\n\
         \n\
         === PROMPT ===\n\
         {prompt}\n\
         \n\
         === AGENT OUTPUT ===\n\
         {output}\n\
         \n\
         ========================================\n",
        dir = working_dir.display(),
        duration = result.duration.as_secs_f64(),
        success = result.success,
        session = result.session_id,
        cost = result.cost_usd,
        output = result.output,
    );

    let path = task_dir.join(FULL_TRANSCRIPT_FILE);
    let append = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, entry.as_bytes()));

    match append {
        Ok(()) => debug!(file = %path.display(), "Appended to full transcript"),
        Err(e) => debug!(file = %path.display(), error = %e, "Failed to append full transcript"),
    }
}

/// Walk up from the working directory looking for a `task-YYYYMMDD-HHMMSS`
/// directory.
fn find_task_dir(path: &Path) -> Option<PathBuf> {
    let pattern = Regex::new(r"^task-\d{8}-\d{6}$").expect("valid task id pattern");
    path.ancestors()
        .find(|ancestor| {
            ancestor
                .file_name()
                .map(|name| pattern.is_match(&name.to_string_lossy()))
                .unwrap_or(false)
        })
        .map(|p| p.to_path_buf())
}

/// Derive a display name for the pipeline phase from the working directory's
/// position inside the task directory.
fn infer_phase_name(relative: &Path) -> String {
    let mut parts = relative.components().map(|c| c.as_os_str().to_string_lossy());
    let Some(first) = parts.next() else {
        return "UNKNOWN PHASE".to_string();
    };

    match first.as_ref() {
        "architect" => "PHASE 1: ARCHITECT".to_string(),
        "implementations" => match parts.next() {
            Some(second) => format!(
                "PHASE 2: IMPLEMENTER {}",
                second.trim_start_matches("impl-")
            ),
            None => "PHASE 2: IMPLEMENTER".to_string(),
        },
        name if name.starts_with("review-") => {
            format!("PHASE 3: REVIEWER {}", name.trim_start_matches("review-"))
        }
        name if name.starts_with("test-") => {
            format!("PHASE 3: TESTER {}", name.trim_start_matches("test-"))
        }
        "comparator" => "PHASE 4: COMPARATOR".to_string(),
        "integration" => "PHASE 5: INTEGRATOR".to_string(),
        other => format!("PHASE UNKNOWN: {other}"),
    }
}
