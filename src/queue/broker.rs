//! Thread-safe, disk-persisted question broker.
//!
//! Any task can submit a question and await its answer; only that task
//! blocks. Answers arrive from another task, the CLI, or the file-decision
//! bridge. Every mutation flushes the full queue snapshot to
//! `question-queue.json` so a crashed process can reload it and re-arm the
//! wait primitives for questions still pending.

use crate::queue::models::{Answer, Question, QuestionStatus};
use crate::util::atomic_write_json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

pub const QUEUE_FILE_NAME: &str = "question-queue.json";

/// On-disk snapshot format.
#[derive(Debug, Serialize, Deserialize, Default)]
struct QueueSnapshot {
    questions: Vec<Question>,
}

#[derive(Default)]
struct BrokerState {
    questions: HashMap<String, Question>,
    waiters: HashMap<String, Arc<Notify>>,
}

type QuestionCallback = Box<dyn Fn(&Question) + Send + Sync>;

/// Per-question wakeups behind a single short-held mutex. The lock covers
/// map mutation plus the synchronous snapshot write, never a wait.
pub struct QuestionBroker {
    queue_file: PathBuf,
    state: Mutex<BrokerState>,
    on_question: Option<QuestionCallback>,
}

impl QuestionBroker {
    /// Open (or recover) the broker for a task directory.
    pub fn new(task_dir: &Path) -> Self {
        let broker = Self {
            queue_file: task_dir.join(QUEUE_FILE_NAME),
            state: Mutex::new(BrokerState::default()),
            on_question: None,
        };
        broker.load();
        broker
    }

    /// Register a callback fired (outside the lock) whenever a new question
    /// is submitted.
    pub fn with_on_question(mut self, callback: impl Fn(&Question) + Send + Sync + 'static) -> Self {
        self.on_question = Some(Box::new(callback));
        self
    }

    /// Submit a question and await its answer.
    ///
    /// Blocks only the calling task. On timeout the question is marked
    /// expired and the declared default (or "deny") is returned; a timeout
    /// is never an error.
    pub async fn ask(&self, question: Question) -> Answer {
        let id = question.id.clone();
        let timeout = Duration::from_secs_f64(question.timeout.max(0.0));
        let default = question.default_answer();
        let notify = Arc::new(Notify::new());

        {
            let mut state = self.state.lock().expect("broker lock poisoned");
            state.waiters.insert(id.clone(), notify.clone());
            state.questions.insert(id.clone(), question.clone());
            self.persist(&state);
        }

        info!(
            id = %id,
            question_type = ?question.question_type,
            source = %question.source,
            "Question registered"
        );

        if let Some(callback) = &self.on_question {
            callback(&question);
        }

        match tokio::time::timeout(timeout, notify.notified()).await {
            Ok(()) => {
                let mut state = self.state.lock().expect("broker lock poisoned");
                state.waiters.remove(&id);
                let response = state
                    .questions
                    .get(&id)
                    .and_then(|q| q.answer.clone())
                    .unwrap_or_default();
                Answer::new(id, response)
            }
            Err(_) => {
                let mut state = self.state.lock().expect("broker lock poisoned");
                state.waiters.remove(&id);
                // An answer may have landed between the timeout firing and
                // taking the lock; honor it instead of expiring.
                if let Some(q) = state.questions.get(&id) {
                    if q.status == QuestionStatus::Answered {
                        let response = q.answer.clone().unwrap_or_default();
                        return Answer::new(id, response);
                    }
                }
                warn!(id = %id, timeout_secs = question.timeout, "Question timed out");
                if let Some(q) = state.questions.get_mut(&id) {
                    q.status = QuestionStatus::Expired;
                }
                self.persist(&state);
                Answer::new(id, default)
            }
        }
    }

    /// Record an answer and wake the asking task. Returns false if the
    /// question is unknown or no longer pending.
    pub fn answer(&self, question_id: &str, response: &str) -> bool {
        let notify = {
            let mut state = self.state.lock().expect("broker lock poisoned");
            let Some(q) = state.questions.get_mut(question_id) else {
                warn!(id = %question_id, "Answer for unknown question");
                return false;
            };
            if q.status != QuestionStatus::Pending {
                warn!(id = %question_id, status = ?q.status, "Answer for settled question");
                return false;
            }
            q.answer = Some(response.to_string());
            q.answered_at = Some(chrono::Utc::now().to_rfc3339());
            q.status = QuestionStatus::Answered;
            self.persist(&state);
            state.waiters.get(question_id).cloned()
        };

        info!(id = %question_id, response = %response, "Question answered");

        if let Some(notify) = notify {
            notify.notify_one();
        }
        true
    }

    /// Cancel a pending question. The asking task wakes and receives the
    /// question's default.
    pub fn cancel(&self, question_id: &str) -> bool {
        let notify = {
            let mut state = self.state.lock().expect("broker lock poisoned");
            let Some(q) = state.questions.get_mut(question_id) else {
                return false;
            };
            if q.status != QuestionStatus::Pending {
                return false;
            }
            q.status = QuestionStatus::Cancelled;
            q.answered_at = Some(chrono::Utc::now().to_rfc3339());
            self.persist(&state);
            state.waiters.get(question_id).cloned()
        };

        if let Some(notify) = notify {
            notify.notify_one();
        }
        true
    }

    /// Pending questions in creation order.
    pub fn pending(&self) -> Vec<Question> {
        let state = self.state.lock().expect("broker lock poisoned");
        let mut pending: Vec<Question> = state
            .questions
            .values()
            .filter(|q| q.status == QuestionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// All known questions in creation order.
    pub fn all(&self) -> Vec<Question> {
        let state = self.state.lock().expect("broker lock poisoned");
        let mut all: Vec<Question> = state.questions.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn get(&self, question_id: &str) -> Option<Question> {
        let state = self.state.lock().expect("broker lock poisoned");
        state.questions.get(question_id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.lock().expect("broker lock poisoned");
        state
            .questions
            .values()
            .filter(|q| q.status == QuestionStatus::Pending)
            .count()
    }

    /// Write the full snapshot. Called with the lock held so persistence and
    /// queue mutation form one atomic step.
    fn persist(&self, state: &BrokerState) {
        let mut questions: Vec<Question> = state.questions.values().cloned().collect();
        questions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let snapshot = QueueSnapshot { questions };
        if let Err(e) = atomic_write_json(&self.queue_file, &snapshot) {
            warn!(error = %e, "Failed to persist question queue");
        }
    }

    /// Reload the snapshot after a crash, re-arming waiters for questions
    /// still pending.
    fn load(&self) {
        let Ok(content) = std::fs::read_to_string(&self.queue_file) else {
            return;
        };
        let snapshot: QueueSnapshot = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to load question queue snapshot");
                return;
            }
        };

        let mut state = self.state.lock().expect("broker lock poisoned");
        for question in snapshot.questions {
            if question.status == QuestionStatus::Pending {
                state
                    .waiters
                    .insert(question.id.clone(), Arc::new(Notify::new()));
            }
            state.questions.insert(question.id.clone(), question);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::models::QuestionType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::tempdir;

    fn question(title: &str, timeout: f64) -> Question {
        Question::new(QuestionType::Permission, "test", "execution", title, "")
            .with_options(vec!["allow".into(), "deny".into()])
            .with_default("deny")
            .with_timeout(timeout)
    }

    #[tokio::test]
    async fn test_ask_returns_answer() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(QuestionBroker::new(dir.path()));
        let q = question("use Bash?", 5.0);
        let id = q.id.clone();

        let broker2 = broker.clone();
        let answerer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(broker2.answer(&id, "allow"));
        });

        let answer = broker.ask(q).await;
        assert_eq!(answer.response, "allow");
        answerer.await.unwrap();
    }

    #[tokio::test]
    async fn test_ask_timeout_returns_default_and_expires() {
        let dir = tempdir().unwrap();
        let broker = QuestionBroker::new(dir.path());
        let q = question("never answered", 0.2);
        let id = q.id.clone();

        let start = Instant::now();
        let answer = broker.ask(q).await;
        assert_eq!(answer.response, "deny");
        // Within timeout + epsilon.
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(broker.get(&id).unwrap().status, QuestionStatus::Expired);
    }

    #[tokio::test]
    async fn test_one_pending_question_does_not_block_another() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(QuestionBroker::new(dir.path()));

        let q_slow = question("left pending", 2.0);
        let q_fast = question("answered quickly", 5.0);
        let fast_id = q_fast.id.clone();

        let broker_slow = broker.clone();
        let slow = tokio::spawn(async move { broker_slow.ask(q_slow).await });

        let broker_fast = broker.clone();
        let fast = tokio::spawn(async move { broker_fast.ask(q_fast).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let start = Instant::now();
        assert!(broker.answer(&fast_id, "allow"));

        let fast_answer = fast.await.unwrap();
        assert_eq!(fast_answer.response, "allow");
        // The answered question returned promptly despite the pending one.
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(broker.pending_count(), 1);

        let slow_answer = slow.await.unwrap();
        assert_eq!(slow_answer.response, "deny");
    }

    #[tokio::test]
    async fn test_answer_rejects_settled_question() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(QuestionBroker::new(dir.path()));
        let q = question("once only", 5.0);
        let id = q.id.clone();

        let broker2 = broker.clone();
        let ask = tokio::spawn(async move { broker2.ask(q).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(broker.answer(&id, "allow"));
        assert!(!broker.answer(&id, "deny"));
        assert!(!broker.answer("q-missing", "allow"));

        assert_eq!(ask.await.unwrap().response, "allow");
    }

    #[tokio::test]
    async fn test_cancel_wakes_asker_with_default() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(QuestionBroker::new(dir.path()));
        let q = question("cancelled", 10.0);
        let id = q.id.clone();

        let broker2 = broker.clone();
        let ask = tokio::spawn(async move { broker2.ask(q).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(broker.cancel(&id));
        let answer = ask.await.unwrap();
        // Cancelled questions resolve to the recorded (empty) answer.
        assert_eq!(answer.response, "");
        assert_eq!(broker.get(&id).unwrap().status, QuestionStatus::Cancelled);
        assert!(!broker.cancel(&id));
    }

    #[tokio::test]
    async fn test_snapshot_persisted_on_every_mutation() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(QuestionBroker::new(dir.path()));
        let q = question("persisted", 5.0);
        let id = q.id.clone();

        let broker2 = broker.clone();
        let ask = tokio::spawn(async move { broker2.ask(q).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queue_file = dir.path().join(QUEUE_FILE_NAME);
        let snapshot: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&queue_file).unwrap()).unwrap();
        assert_eq!(snapshot["questions"][0]["status"], "pending");

        broker.answer(&id, "allow");
        ask.await.unwrap();

        let snapshot: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&queue_file).unwrap()).unwrap();
        assert_eq!(snapshot["questions"][0]["status"], "answered");
        assert_eq!(snapshot["questions"][0]["answer"], "allow");
    }

    #[tokio::test]
    async fn test_crash_recovery_reloads_pending_questions() {
        let dir = tempdir().unwrap();
        let id;
        {
            let broker = Arc::new(QuestionBroker::new(dir.path()));
            let q = question("survives crash", 30.0);
            id = q.id.clone();
            let broker2 = broker.clone();
            // Leave the ask hanging to simulate a crash mid-wait.
            let handle = tokio::spawn(async move { broker2.ask(q).await });
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.abort();
        }

        let recovered = QuestionBroker::new(dir.path());
        let pending = recovered.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        // Recovered questions can still be answered.
        assert!(recovered.answer(&id, "allow"));
        assert_eq!(
            recovered.get(&id).unwrap().status,
            QuestionStatus::Answered
        );
    }

    #[tokio::test]
    async fn test_on_question_callback_fires() {
        let dir = tempdir().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let broker = QuestionBroker::new(dir.path()).with_on_question(move |_q| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        broker.ask(question("notified", 0.1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
