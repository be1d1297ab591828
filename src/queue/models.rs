//! Data model for the question queue.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_timeout_secs() -> f64 {
    3600.0
}

/// What kind of decision a question is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    /// Tool-permission decision (allow/deny).
    Permission,
    /// Pipeline checkpoint (approve/revise/abort).
    Checkpoint,
    /// Surfaced error needing acknowledgement.
    Error,
    /// Free-form or selection decision.
    Decision,
}

/// Lifecycle of a question. Only moves forward from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Expired,
    Cancelled,
}

/// A pending decision point, persisted with the queue snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    /// Who asked ("pipeline", "executor", "implementer-2", ...).
    pub source: String,
    /// Pipeline phase the question belongs to.
    pub phase: String,
    /// Short title for list display.
    pub title: String,
    /// Longer detail for the answering actor.
    #[serde(default)]
    pub detail: String,
    /// Allowed answers; empty means free text.
    #[serde(default)]
    pub options: Vec<String>,
    /// Returned when the question times out. Falls back to "deny".
    #[serde(default)]
    pub default: Option<String>,
    /// Seconds to wait for an answer.
    #[serde(default = "default_timeout_secs")]
    pub timeout: f64,
    pub status: QuestionStatus,
    pub created_at: String,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub answered_at: Option<String>,
}

impl Question {
    pub fn new(
        question_type: QuestionType,
        source: impl Into<String>,
        phase: impl Into<String>,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("q-{}", &Uuid::new_v4().simple().to_string()[..8]),
            question_type,
            source: source.into(),
            phase: phase.into(),
            title: title.into(),
            detail: detail.into(),
            options: Vec::new(),
            default: None,
            timeout: default_timeout_secs(),
            status: QuestionStatus::Pending,
            created_at: Utc::now().to_rfc3339(),
            answer: None,
            answered_at: None,
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: f64) -> Self {
        self.timeout = timeout_secs;
        self
    }

    /// The value `ask` resolves to when no answer arrives in time.
    pub fn default_answer(&self) -> String {
        self.default.clone().unwrap_or_else(|| "deny".to_string())
    }
}

/// The recorded response to a question. Created exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    pub response: String,
    pub timestamp: String,
}

impl Answer {
    pub fn new(question_id: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            question_id: question_id.into(),
            response: response.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}
