//! Typed error hierarchy for the Crucible orchestrator.
//!
//! Failures travel by value, never as unwinding control flow:
//! - `FailureKind`/`ExecFailure` — classified agent-subprocess failures,
//!   carried inside `ExecResult` so retry policy can match on the kind
//! - `GitError` — clone/worktree/merge plumbing failures
//! - `PipelineError` — phase-level failures; the controller converts every
//!   one into a reported outcome rather than letting it escape

use thiserror::Error;

/// Classification of an agent execution failure. Drives retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Generic failure worth retrying (non-zero exit, recoverable I/O).
    Transient,
    /// Rate limit, quota, billing or auth failure. Retrying is pointless.
    NonRetryable,
    /// The per-attempt deadline elapsed before a result event arrived.
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::NonRetryable => write!(f, "non-retryable"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// A classified agent execution failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NonRetryable,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
        }
    }

    /// Classify an error message against a list of non-retryable substrings.
    /// Matching is case-insensitive on both sides.
    pub fn classify(message: impl Into<String>, non_retryable_patterns: &[String]) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let kind = if non_retryable_patterns
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
        {
            FailureKind::NonRetryable
        } else {
            FailureKind::Transient
        };
        Self { kind, message }
    }
}

impl std::fmt::Display for ExecFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Errors from the version-control collaborator.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("No target repository configured. Set project.target_repo in the config file")]
    NoTargetRepo,

    #[error("Failed to open repository at {path}: {message}")]
    OpenFailed { path: String, message: String },

    #[error("Failed to clone {url}: {message}")]
    CloneFailed { url: String, message: String },

    #[error("Worktree operation failed for {path}: {message}")]
    WorktreeFailed { path: String, message: String },

    #[error("Merge of branch {branch} failed: {message}")]
    MergeFailed { branch: String, message: String },

    #[error(transparent)]
    Raw(#[from] git2::Error),
}

/// Phase-level failures surfaced by the pipeline controller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Spec validation failed: {}", errors.join("; "))]
    ValidationFailed { errors: Vec<String> },

    #[error("Design phase failed: {0}")]
    DesignFailed(String),

    #[error("Pipeline aborted at checkpoint")]
    Aborted,

    #[error("Revision requested at checkpoint: {feedback}")]
    RevisionRequested { feedback: String },

    #[error("Checkpoint approved an empty approach set")]
    NoApprovedApproaches,

    #[error("All implementations failed")]
    AllImplementationsFailed,

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
