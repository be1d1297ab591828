//! Question/checkpoint broker: blocking decision requests across concurrent
//! pipeline tasks, with crash-recoverable persistence and a file-based
//! bridge for external actors.

pub mod broker;
pub mod models;
pub mod watcher;

pub use broker::{QuestionBroker, QUEUE_FILE_NAME};
pub use models::{Answer, Question, QuestionStatus, QuestionType};
pub use watcher::{DecisionBridge, CHECKPOINT_DECISION_FILE, SELECTION_DECISION_FILE};
