//! File-based decision plumbing: the cross-process compatibility shim.
//!
//! In-process waits always go through the broker's wakeup primitives. These
//! helpers exist so an external actor (the CLI in another process, or a
//! human editing a file) can settle decisions by writing JSON documents into
//! the task directory.

use crate::queue::broker::QuestionBroker;
use crate::queue::models::QuestionType;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CHECKPOINT_DECISION_FILE: &str = "checkpoint-decision.json";
pub const SELECTION_DECISION_FILE: &str = "selection-decision.json";

const BRIDGE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll for a JSON file containing a given key. Returns the parsed content,
/// or `None` on timeout.
pub async fn wait_for_json_key(
    path: &Path,
    key: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(value) = serde_json::from_str::<Value>(&content) {
                if value.get(key).is_some() {
                    return Some(value);
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Bridges decision files written by an external actor into broker answers.
///
/// Watches the task directory for `checkpoint-decision.json` and
/// `selection-decision.json`; when one appears while a matching question is
/// pending, its content becomes that question's answer and the file is
/// consumed.
pub struct DecisionBridge {
    broker: Arc<QuestionBroker>,
    task_dir: PathBuf,
}

impl DecisionBridge {
    pub fn new(broker: Arc<QuestionBroker>, task_dir: PathBuf) -> Self {
        Self { broker, task_dir }
    }

    /// Spawn the polling loop. Abort the handle to stop the bridge.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(dir = %self.task_dir.display(), "Decision bridge watching task directory");
            loop {
                self.poll_once();
                tokio::time::sleep(BRIDGE_POLL_INTERVAL).await;
            }
        })
    }

    fn poll_once(&self) {
        self.bridge_file(
            CHECKPOINT_DECISION_FILE,
            "action",
            QuestionType::Checkpoint,
        );
        self.bridge_file(
            SELECTION_DECISION_FILE,
            "selected_id",
            QuestionType::Decision,
        );
        self.bridge_answer_files();
    }

    /// Bridge `answer-<question-id>.json` files (`{"response": ...}`) into
    /// answers for the named question, whatever its type.
    fn bridge_answer_files(&self) {
        let Ok(entries) = std::fs::read_dir(&self.task_dir) else {
            return;
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(question_id) = file_name
                .strip_prefix("answer-")
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };

            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(&content) else {
                continue;
            };
            let Some(response) = value.get("response").and_then(Value::as_str) else {
                continue;
            };

            match self.broker.get(question_id) {
                None => {
                    // The question may not have been asked yet; try again on
                    // the next poll.
                    continue;
                }
                Some(question) => {
                    if self.broker.answer(question_id, response) {
                        info!(question = %question_id, "Bridged answer file");
                    } else {
                        debug!(
                            question = %question_id,
                            status = ?question.status,
                            "Discarding stale answer file"
                        );
                    }
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        warn!(file = %file_name, error = %e, "Failed to remove answer file");
                    }
                }
            }
        }
    }

    fn bridge_file(&self, file_name: &str, required_key: &str, question_type: QuestionType) {
        let path = self.task_dir.join(file_name);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return;
        };

        let value: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                debug!(file = %path.display(), error = %e, "Decision file not yet valid JSON");
                return;
            }
        };
        if value.get(required_key).is_none() {
            return;
        }

        let Some(pending) = self
            .broker
            .pending()
            .into_iter()
            .find(|q| q.question_type == question_type)
        else {
            return;
        };

        // Pass the raw document through; the asker parses it.
        if self.broker.answer(&pending.id, value.to_string().as_str()) {
            info!(
                file = %path.display(),
                question = %pending.id,
                "Bridged decision file into broker answer"
            );
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "Failed to remove consumed decision file");
            }
        }
    }
}
