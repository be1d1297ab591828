//! Agent process executor.
//!
//! Owns the lifecycle of one agent CLI invocation: permission settings
//! injection, bidirectional stream-json I/O, per-attempt deadline, retry
//! policy, and transcript persistence. Tool gating happens inside the
//! subprocess via the injected settings; completed tool uses are logged
//! here for audit.

mod transcript;

use crate::config::ExecutionConfig;
use crate::errors::{ExecFailure, FailureKind};
use crate::permissions::PermissionGate;
use crate::stream::{DecodedEvent, StreamDecoder, ToolUseRecord};
use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Grace period for the subprocess to exit after emitting its result. Some
/// agent CLI builds hang here and need a kill.
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Configuration for the agent executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Agent CLI command (default: "claude").
    pub agent_cmd: String,
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Maximum attempts per execution.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Error substrings that abort without retry.
    pub non_retryable_patterns: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl ExecutorConfig {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            agent_cmd: config.agent_cmd.clone(),
            timeout: Duration::from_secs(config.timeout),
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_secs(config.retry_delay),
            non_retryable_patterns: config.non_retryable_patterns.clone(),
        }
    }
}

/// Outcome of one `execute` call (after retries).
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub output: String,
    pub error: Option<ExecFailure>,
    pub duration: Duration,
    pub session_id: String,
    pub cost_usd: f64,
}

impl ExecResult {
    fn failure(failure: ExecFailure, output: String, duration: Duration) -> Self {
        Self {
            success: false,
            output,
            error: Some(failure),
            duration,
            session_id: String::new(),
            cost_usd: 0.0,
        }
    }

    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_default()
    }
}

/// Executes agent CLI invocations with retry, timeout and audit logging.
pub struct AgentExecutor {
    config: ExecutorConfig,
    gate: Arc<PermissionGate>,
}

impl AgentExecutor {
    pub fn new(config: ExecutorConfig, gate: Arc<PermissionGate>) -> Self {
        Self { config, gate }
    }

    /// Run the agent with a prompt, retrying per policy. Never panics and
    /// never returns `Err`; failures are classified values in the result.
    pub async fn execute(
        &self,
        prompt: &str,
        working_dir: &Path,
        output_file: Option<&Path>,
    ) -> ExecResult {
        if let Err(e) = std::fs::create_dir_all(working_dir) {
            return ExecResult::failure(
                ExecFailure::non_retryable(format!(
                    "Failed to create working directory {}: {e}",
                    working_dir.display()
                )),
                String::new(),
                Duration::ZERO,
            );
        }

        let mut last_failure: Option<ExecFailure> = None;
        let mut last_output = String::new();
        let mut timeout_streak = 0u32;

        for attempt in 1..=self.config.max_retries {
            info!(
                attempt,
                max = self.config.max_retries,
                dir = %working_dir.display(),
                "Executing agent"
            );

            let result = self.run_attempt(prompt, working_dir).await;

            if result.success {
                info!(duration_secs = result.duration.as_secs_f64(), "Agent execution succeeded");
                if let Some(path) = output_file {
                    if let Err(e) = crate::util::atomic_write(path, &result.output) {
                        warn!(error = %e, "Failed to write output file");
                    }
                }
                transcript::save(prompt, &result, working_dir);
                return result;
            }

            let failure = result
                .error
                .clone()
                .unwrap_or_else(|| ExecFailure::transient("unknown error"));
            warn!(kind = %failure.kind, message = %failure.message, "Agent execution failed");

            match failure.kind {
                FailureKind::NonRetryable => {
                    error!(message = %failure.message, "Non-retryable error, aborting");
                    transcript::save(prompt, &result, working_dir);
                    return result;
                }
                FailureKind::Timeout => {
                    timeout_streak += 1;
                    if timeout_streak >= 2 {
                        let message = format!(
                            "{} consecutive timeouts. Raise execution.timeout \
                             (currently {}s) in the config file",
                            timeout_streak,
                            self.config.timeout.as_secs()
                        );
                        error!(message = %message, "Aborting after consecutive timeouts");
                        let aborted = ExecResult::failure(
                            ExecFailure::timeout(message),
                            result.output.clone(),
                            result.duration,
                        );
                        transcript::save(prompt, &aborted, working_dir);
                        return aborted;
                    }
                }
                FailureKind::Transient => {
                    timeout_streak = 0;
                }
            }

            last_failure = Some(failure);
            last_output = result.output;

            if attempt < self.config.max_retries {
                info!(delay_secs = self.config.retry_delay.as_secs(), "Retrying");
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        let last_message = last_failure
            .map(|f| f.message)
            .unwrap_or_else(|| "unknown error".to_string());
        let aggregate = ExecResult::failure(
            ExecFailure::transient(format!(
                "Failed after {} attempts. Last error: {}",
                self.config.max_retries, last_message
            )),
            last_output,
            Duration::ZERO,
        );
        transcript::save(prompt, &aggregate, working_dir);
        aggregate
    }

    /// Load the prompt from a file, then execute.
    pub async fn execute_with_file_prompt(
        &self,
        prompt_file: &Path,
        working_dir: &Path,
        output_file: Option<&Path>,
    ) -> ExecResult {
        let prompt = match std::fs::read_to_string(prompt_file) {
            Ok(p) => p,
            Err(e) => {
                return ExecResult::failure(
                    ExecFailure::non_retryable(format!(
                        "Prompt file not found: {} ({e})",
                        prompt_file.display()
                    )),
                    String::new(),
                    Duration::ZERO,
                );
            }
        };
        self.execute(&prompt, working_dir, output_file).await
    }

    /// One spawn/stream/cleanup cycle.
    async fn run_attempt(&self, prompt: &str, working_dir: &Path) -> ExecResult {
        let start = Instant::now();

        if let Err(e) = self.write_settings(working_dir) {
            return ExecResult::failure(
                ExecFailure::transient(format!("Failed to write agent settings: {e}")),
                String::new(),
                start.elapsed(),
            );
        }

        let mut child = match Command::new(&self.config.agent_cmd)
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ExecResult::failure(
                    ExecFailure::non_retryable(format!(
                        "Agent CLI '{}' not found. Install it first",
                        self.config.agent_cmd
                    )),
                    String::new(),
                    start.elapsed(),
                );
            }
            Err(e) => {
                return ExecResult::failure(
                    ExecFailure::transient(format!("Failed to spawn agent process: {e}")),
                    String::new(),
                    start.elapsed(),
                );
            }
        };

        debug!(pid = child.id().unwrap_or(0), "Agent process spawned");

        // One user record carrying the prompt opens the conversation.
        let init_message = serde_json::json!({
            "type": "user",
            "message": {"role": "user", "content": prompt},
        })
        .to_string();

        if let Some(mut stdin) = child.stdin.take() {
            let write_result = async {
                stdin.write_all(init_message.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            }
            .await;

            if let Err(e) = write_result {
                let stderr = read_stderr(&mut child).await;
                let _ = child.kill().await;
                return ExecResult::failure(
                    ExecFailure::classify(
                        format!("Failed to send prompt (broken pipe): {e} {stderr}"),
                        &self.config.non_retryable_patterns,
                    ),
                    String::new(),
                    start.elapsed(),
                );
            }
            // Keep stdin open: the CLI treats EOF as session end.
            child.stdin = Some(stdin);
        }

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return ExecResult::failure(
                ExecFailure::transient("Failed to capture agent stdout"),
                String::new(),
                start.elapsed(),
            );
        };

        let mut lines = BufReader::new(stdout).lines();
        let mut decoder = StreamDecoder::new();
        let deadline = Instant::now() + self.config.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return ExecResult::failure(
                    ExecFailure::timeout(format!(
                        "Execution timed out after {} seconds",
                        self.config.timeout.as_secs()
                    )),
                    decoder.accumulated_text().to_string(),
                    start.elapsed(),
                );
            }

            match tokio::time::timeout(remaining, lines.next_line()).await {
                Err(_) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return ExecResult::failure(
                        ExecFailure::timeout(format!(
                            "Execution timed out after {} seconds",
                            self.config.timeout.as_secs()
                        )),
                        decoder.accumulated_text().to_string(),
                        start.elapsed(),
                    );
                }
                Ok(Ok(Some(line))) => match decoder.process_line(&line) {
                    Some(DecodedEvent::ToolUseComplete(record)) => self.log_tool_use(&record),
                    Some(DecodedEvent::Result { .. }) => break,
                    _ => {}
                },
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return ExecResult::failure(
                        ExecFailure::transient(format!("Failed to read agent output: {e}")),
                        decoder.accumulated_text().to_string(),
                        start.elapsed(),
                    );
                }
            }
        }

        cleanup_process(&mut child).await;

        let output = decoder.build_output();
        let duration = start.elapsed();

        if output.success {
            ExecResult {
                success: true,
                output: output.output,
                error: None,
                duration,
                session_id: output.session_id,
                cost_usd: output.cost_usd,
            }
        } else {
            let message = output
                .error
                .unwrap_or_else(|| "unknown agent failure".to_string());
            ExecResult {
                success: false,
                output: output.output,
                error: Some(ExecFailure::classify(
                    message,
                    &self.config.non_retryable_patterns,
                )),
                duration,
                session_id: output.session_id,
                cost_usd: output.cost_usd,
            }
        }
    }

    /// (Re)write `.claude/settings.json` from the gate's current snapshot so
    /// the subprocess enforces the same allow/deny policy.
    fn write_settings(&self, working_dir: &Path) -> Result<()> {
        let settings_dir = working_dir.join(".claude");
        std::fs::create_dir_all(&settings_dir).context("Failed to create settings directory")?;

        let settings = self.gate.settings_snapshot();
        let content =
            serde_json::to_string_pretty(&settings).context("Failed to serialize settings")?;
        std::fs::write(settings_dir.join("settings.json"), &content)
            .context("Failed to write settings.json")?;
        std::fs::write(settings_dir.join("settings.local.json"), &content)
            .context("Failed to write settings.local.json")?;
        Ok(())
    }

    /// Audit log for completed tool uses. Shell commands are the interesting
    /// ones; everything else logs at debug.
    fn log_tool_use(&self, record: &ToolUseRecord) {
        if record.tool_name == "Bash" {
            let command = record
                .input
                .get("command")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            let shown: String = command.chars().take(100).collect();
            info!(tool = %record.tool_name, command = %shown, "Tool used");
        } else {
            let keys: Vec<&String> = record
                .input
                .as_object()
                .map(|m| m.keys().collect())
                .unwrap_or_default();
            debug!(tool = %record.tool_name, input_keys = ?keys, "Tool used");
        }
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let Some(stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut lines = BufReader::new(stderr).lines();
    let mut collected = String::new();
    // Bounded read so a chatty process cannot stall the error path.
    for _ in 0..50 {
        match tokio::time::timeout(Duration::from_millis(200), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                collected.push_str(&line);
                collected.push('\n');
            }
            _ => break,
        }
    }
    collected.trim().to_string()
}

/// Close stdin and give the process a grace period to exit, then kill it.
async fn cleanup_process(child: &mut Child) {
    drop(child.stdin.take());

    match tokio::time::timeout(EXIT_GRACE_PERIOD, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("Agent process did not exit after result, killing");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{PermissionGate, PermissionRule};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn test_gate() -> Arc<PermissionGate> {
        let rules = vec![
            PermissionRule::parse("Read(*)", crate::permissions::PermissionAction::Allow).unwrap(),
            PermissionRule::parse("Bash(sudo *)", crate::permissions::PermissionAction::Deny)
                .unwrap(),
        ];
        Arc::new(PermissionGate::new(rules, Duration::from_secs(1)))
    }

    fn executor_with(cmd: &str, timeout: Duration, max_retries: u32) -> AgentExecutor {
        AgentExecutor::new(
            ExecutorConfig {
                agent_cmd: cmd.to_string(),
                timeout,
                max_retries,
                retry_delay: Duration::from_millis(10),
                non_retryable_patterns: vec!["rate limit".into(), "billing".into()],
            },
            test_gate(),
        )
    }

    #[cfg(unix)]
    fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(unix)]
    fn result_line(text: &str) -> String {
        format!(
            r#"{{"type":"result","subtype":"success","is_error":false,"result":"{text}","session_id":"sess-stub","total_cost_usd":0.01}}"#
        )
    }

    #[tokio::test]
    async fn test_missing_cli_is_non_retryable() {
        let dir = tempdir().unwrap();
        let executor = executor_with(
            "definitely-not-a-real-agent-cli",
            Duration::from_secs(5),
            3,
        );
        let result = executor.execute("hi", dir.path(), None).await;
        assert!(!result.success);
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, FailureKind::NonRetryable);
        assert!(failure.message.contains("not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_execution_writes_settings_and_transcript() {
        let dir = tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            "agent-ok.sh",
            &format!("read _line\necho '{}'", result_line("done")),
        );
        let executor = executor_with(&stub.to_string_lossy(), Duration::from_secs(10), 3);

        let workdir = dir.path().join("work");
        let output_file = dir.path().join("out.txt");
        let result = executor
            .execute("do the thing", &workdir, Some(&output_file))
            .await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output, "done");
        assert_eq!(result.session_id, "sess-stub");
        assert_eq!(std::fs::read_to_string(&output_file).unwrap(), "done");

        // Settings injected from the gate snapshot.
        let settings: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(workdir.join(".claude/settings.json")).unwrap(),
        )
        .unwrap();
        assert!(settings["permissions"]["allow"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("Read")));

        // Transcript saved alongside.
        let transcript = std::fs::read_to_string(workdir.join("conversation.txt")).unwrap();
        assert!(transcript.contains("do the thing"));
        assert!(transcript.contains("done"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_retry_bound_performs_exact_attempts() {
        let dir = tempdir().unwrap();
        let counter = dir.path().join("attempts");
        // Exits without emitting a result event: a retryable failure.
        let stub = write_stub(
            dir.path(),
            "agent-fail.sh",
            &format!("echo x >> {}\nread _line\nexit 1", counter.display()),
        );
        let executor = executor_with(&stub.to_string_lossy(), Duration::from_secs(10), 3);

        let result = executor
            .execute("hi", &dir.path().join("work"), None)
            .await;

        assert!(!result.success);
        let attempts = std::fs::read_to_string(&counter).unwrap().lines().count();
        assert_eq!(attempts, 3);
        let message = result.error.unwrap().message;
        assert!(message.contains("Failed after 3 attempts"));
        assert!(message.contains("no result event received"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_retryable_error_aborts_immediately() {
        let dir = tempdir().unwrap();
        let counter = dir.path().join("attempts");
        let line = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"rate limit exceeded","session_id":"s","total_cost_usd":0}"#;
        let stub = write_stub(
            dir.path(),
            "agent-limit.sh",
            &format!("echo x >> {}\nread _line\necho '{}'", counter.display(), line),
        );
        let executor = executor_with(&stub.to_string_lossy(), Duration::from_secs(10), 3);

        let result = executor
            .execute("hi", &dir.path().join("work"), None)
            .await;

        assert!(!result.success);
        let attempts = std::fs::read_to_string(&counter).unwrap().lines().count();
        assert_eq!(attempts, 1);
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, FailureKind::NonRetryable);
        assert!(failure.message.contains("rate limit"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_consecutive_timeouts_abort_with_actionable_message() {
        let dir = tempdir().unwrap();
        let counter = dir.path().join("attempts");
        let stub = write_stub(
            dir.path(),
            "agent-slow.sh",
            &format!("echo x >> {}\nsleep 30", counter.display()),
        );
        let executor = executor_with(&stub.to_string_lossy(), Duration::from_millis(200), 5);

        let result = executor
            .execute("hi", &dir.path().join("work"), None)
            .await;

        assert!(!result.success);
        // Aborted after the second timeout, not after max_retries.
        let attempts = std::fs::read_to_string(&counter).unwrap().lines().count();
        assert_eq!(attempts, 2);
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.message.contains("consecutive timeouts"));
        assert!(failure.message.contains("execution.timeout"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_returns_partial_text() {
        let dir = tempdir().unwrap();
        let text_event = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial progress"}}}"#;
        let stub = write_stub(
            dir.path(),
            "agent-partial.sh",
            &format!("echo '{text_event}'\nsleep 30"),
        );
        // Two timeouts trigger the consecutive-timeout abort, which carries
        // the partial text from the last attempt.
        let executor = executor_with(&stub.to_string_lossy(), Duration::from_millis(300), 5);

        let result = executor
            .execute("hi", &dir.path().join("work"), None)
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, FailureKind::Timeout);
        assert_eq!(result.output, "partial progress");
    }

    #[tokio::test]
    async fn test_execute_with_missing_prompt_file() {
        let dir = tempdir().unwrap();
        let executor = executor_with("true", Duration::from_secs(1), 1);
        let result = executor
            .execute_with_file_prompt(&dir.path().join("nope.md"), dir.path(), None)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().message.contains("Prompt file not found"));
    }
}
