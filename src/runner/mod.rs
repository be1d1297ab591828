//! Bounded-parallel task runner.
//!
//! Runs N independent units of work, one spawned task each, and aggregates
//! their outcomes into per-ordinal slots so the result order never depends
//! on completion order. Failure isolation is per-task: an error (or panic)
//! in one task becomes a failed result for that ordinal and leaves the
//! siblings running.

use anyhow::Result;
use std::future::Future;
use tracing::{info, warn};

/// Outcome slot for one task ordinal.
#[derive(Debug)]
pub struct TaskResult<R> {
    pub ordinal: usize,
    pub outcome: Result<R, String>,
}

impl<R> TaskResult<R> {
    pub fn success(ordinal: usize, value: R) -> Self {
        Self {
            ordinal,
            outcome: Ok(value),
        }
    }

    pub fn failure(ordinal: usize, message: impl Into<String>) -> Self {
        Self {
            ordinal,
            outcome: Err(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&R> {
        self.outcome.as_ref().ok()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }
}

/// Run all tasks and collect one result per ordinal, in ordinal order.
///
/// A single task runs inline without spawn overhead. Two or more run
/// concurrently, each on its own spawned task.
pub async fn run_all<R, Fut>(tasks: Vec<Fut>) -> Vec<TaskResult<R>>
where
    R: Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    match tasks.len() {
        0 => Vec::new(),
        1 => {
            let future = tasks.into_iter().next().expect("one task");
            vec![settle(0, future.await)]
        }
        n => {
            info!(tasks = n, "Running tasks in parallel");
            let handles: Vec<_> = tasks
                .into_iter()
                .enumerate()
                .map(|(ordinal, future)| tokio::spawn(async move { (ordinal, future.await) }))
                .collect();

            let mut slots: Vec<Option<TaskResult<R>>> = std::iter::repeat_with(|| None)
                .take(n)
                .collect();

            for (spawn_ordinal, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok((ordinal, outcome)) => {
                        slots[ordinal] = Some(settle(ordinal, outcome));
                    }
                    Err(join_error) => {
                        warn!(ordinal = spawn_ordinal, error = %join_error, "Task aborted");
                        slots[spawn_ordinal] = Some(TaskResult::failure(
                            spawn_ordinal,
                            format!("task panicked: {join_error}"),
                        ));
                    }
                }
            }

            slots
                .into_iter()
                .enumerate()
                .map(|(ordinal, slot)| {
                    slot.unwrap_or_else(|| TaskResult::failure(ordinal, "task produced no result"))
                })
                .collect()
        }
    }
}

fn settle<R>(ordinal: usize, outcome: Result<R>) -> TaskResult<R> {
    match outcome {
        Ok(value) => TaskResult::success(ordinal, value),
        Err(e) => {
            warn!(ordinal, error = %e, "Task failed");
            TaskResult::failure(ordinal, e.to_string())
        }
    }
}
