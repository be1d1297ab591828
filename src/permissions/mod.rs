//! Tool-permission gate.
//!
//! Ordered glob-style rules decide whether a requested tool action is
//! allowed, denied, or needs a human decision. Evaluation order is
//! security-critical: deny rules first, then allow, then ask, then a
//! default of ask — a deny match always wins and an unmatched tool never
//! passes silently.
//!
//! "Ask" resolution goes through the question broker when one is attached;
//! otherwise it falls back to a request file plus a polled decision file so
//! an external actor can settle it. Both paths default to deny on timeout.

use crate::config::PermissionsConfig;
use crate::queue::watcher::wait_for_json_key;
use crate::queue::{Question, QuestionBroker, QuestionType};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const REQUEST_FILE_NAME: &str = "permission-request.json";
pub const DECISION_FILE_NAME: &str = "permission-decision.json";

const DECISION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

/// Final decision after ask resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// One allow/deny/ask policy entry: exact tool name plus a glob pattern
/// applied to the tool's argument string.
#[derive(Debug, Clone)]
pub struct PermissionRule {
    pub tool: String,
    pub pattern: String,
    pub action: PermissionAction,
    matcher: glob::Pattern,
}

impl PermissionRule {
    pub fn new(tool: &str, pattern: &str, action: PermissionAction) -> Result<Self> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| anyhow!("Invalid permission pattern '{pattern}': {e}"))?;
        Ok(Self {
            tool: tool.to_string(),
            pattern: pattern.to_string(),
            action,
            matcher,
        })
    }

    /// Parse a rule entry: `Tool(pattern)`, or bare `Tool` meaning pattern `*`.
    pub fn parse(entry: &str, action: PermissionAction) -> Result<Self> {
        let entry = entry.trim();
        if let Some(open) = entry.find('(') {
            if entry.ends_with(')') && open > 0 {
                let tool = &entry[..open];
                let pattern = &entry[open + 1..entry.len() - 1];
                return Self::new(tool, pattern, action);
            }
            return Err(anyhow!("Malformed permission rule entry '{entry}'"));
        }
        Self::new(entry, "*", action)
    }

    pub fn matches(&self, tool_name: &str, tool_argument: &str) -> bool {
        if self.tool != tool_name {
            return false;
        }
        if self.pattern == "*" {
            return true;
        }
        self.matcher.matches(tool_argument)
    }

    /// The settings-artifact form of this rule.
    fn settings_entry(&self) -> String {
        if self.pattern == "*" {
            self.tool.clone()
        } else {
            format!("{}({})", self.tool, self.pattern)
        }
    }
}

/// Evaluates tool permissions and resolves "ask" outcomes.
pub struct PermissionGate {
    deny_rules: Vec<PermissionRule>,
    allow_rules: Vec<PermissionRule>,
    ask_rules: Vec<PermissionRule>,
    ask_timeout: Duration,
    broker: Option<Arc<QuestionBroker>>,
}

impl PermissionGate {
    pub fn new(rules: Vec<PermissionRule>, ask_timeout: Duration) -> Self {
        let mut deny_rules = Vec::new();
        let mut allow_rules = Vec::new();
        let mut ask_rules = Vec::new();
        for rule in rules {
            match rule.action {
                PermissionAction::Deny => deny_rules.push(rule),
                PermissionAction::Allow => allow_rules.push(rule),
                PermissionAction::Ask => ask_rules.push(rule),
            }
        }
        Self {
            deny_rules,
            allow_rules,
            ask_rules,
            ask_timeout,
            broker: None,
        }
    }

    pub fn from_config(config: &PermissionsConfig) -> Result<Self> {
        let mut rules = Vec::new();
        for (entries, action) in [
            (&config.deny, PermissionAction::Deny),
            (&config.allow, PermissionAction::Allow),
            (&config.ask, PermissionAction::Ask),
        ] {
            for entry in entries {
                rules.push(PermissionRule::parse(entry, action)?);
            }
        }
        Ok(Self::new(rules, Duration::from_secs(config.ask_timeout)))
    }

    /// Attach a broker; ask resolution then goes through the queue instead
    /// of the file fallback.
    pub fn with_broker(mut self, broker: Arc<QuestionBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Evaluate a tool invocation. Order: deny, allow, ask, default ask.
    pub fn evaluate(&self, tool_name: &str, tool_input: &Value) -> PermissionAction {
        let argument = extract_argument(tool_name, tool_input);

        for rule in &self.deny_rules {
            if rule.matches(tool_name, &argument) {
                info!(tool = %tool_name, arg = %argument, pattern = %rule.pattern, "Permission denied by rule");
                return PermissionAction::Deny;
            }
        }

        for rule in &self.allow_rules {
            if rule.matches(tool_name, &argument) {
                debug!(tool = %tool_name, arg = %argument, pattern = %rule.pattern, "Permission allowed by rule");
                return PermissionAction::Allow;
            }
        }

        for rule in &self.ask_rules {
            if rule.matches(tool_name, &argument) {
                info!(tool = %tool_name, arg = %argument, pattern = %rule.pattern, "Permission requires decision");
                return PermissionAction::Ask;
            }
        }

        info!(tool = %tool_name, arg = %argument, "Permission requires decision (unmatched)");
        PermissionAction::Ask
    }

    /// Resolve an "ask" outcome to allow or deny.
    pub async fn request_decision(
        &self,
        tool_name: &str,
        tool_input: &Value,
        working_dir: &Path,
    ) -> PermissionDecision {
        let argument = extract_argument(tool_name, tool_input);

        match &self.broker {
            Some(broker) => {
                self.request_via_broker(broker, tool_name, &argument, tool_input)
                    .await
            }
            None => {
                self.request_via_file(tool_name, &argument, tool_input, working_dir)
                    .await
            }
        }
    }

    async fn request_via_broker(
        &self,
        broker: &QuestionBroker,
        tool_name: &str,
        argument: &str,
        tool_input: &Value,
    ) -> PermissionDecision {
        let mut input_preview = tool_input.to_string();
        if input_preview.len() > 500 {
            input_preview.truncate(500);
            input_preview.push_str("...");
        }

        let question = Question::new(
            QuestionType::Permission,
            "executor",
            "execution",
            format!("Approve {} tool use", tool_name),
            format!("argument: {}\ninput: {}", argument, input_preview),
        )
        .with_options(vec!["allow".into(), "deny".into()])
        .with_default("deny")
        .with_timeout(self.ask_timeout.as_secs_f64());

        let answer = broker.ask(question).await;
        match answer.response.as_str() {
            "allow" => PermissionDecision::Allow,
            "deny" => PermissionDecision::Deny,
            other => {
                warn!(response = %other, "Invalid permission decision, defaulting to deny");
                PermissionDecision::Deny
            }
        }
    }

    async fn request_via_file(
        &self,
        tool_name: &str,
        argument: &str,
        tool_input: &Value,
        working_dir: &Path,
    ) -> PermissionDecision {
        let request_file = working_dir.join(REQUEST_FILE_NAME);
        let decision_file = working_dir.join(DECISION_FILE_NAME);

        // A leftover decision belongs to a previous request.
        let _ = std::fs::remove_file(&decision_file);

        let request = serde_json::json!({
            "tool": tool_name,
            "argument": argument,
            "input": tool_input,
            "timestamp": Utc::now().to_rfc3339(),
            "instructions": format!(
                "Write {{\"decision\": \"allow\"}} or {{\"decision\": \"deny\"}} to {}",
                DECISION_FILE_NAME
            ),
        });
        if let Err(e) = crate::util::atomic_write_json(&request_file, &request) {
            warn!(error = %e, "Failed to write permission request file, denying");
            return PermissionDecision::Deny;
        }

        info!(
            tool = %tool_name,
            arg = %argument,
            file = %request_file.display(),
            timeout_secs = self.ask_timeout.as_secs(),
            "Waiting for permission decision file"
        );

        let result = wait_for_json_key(
            &decision_file,
            "decision",
            self.ask_timeout,
            DECISION_POLL_INTERVAL,
        )
        .await;

        let decision = match result {
            None => {
                warn!(tool = %tool_name, "Permission request timed out, defaulting to deny");
                PermissionDecision::Deny
            }
            Some(value) => match value.get("decision").and_then(Value::as_str) {
                Some("allow") => PermissionDecision::Allow,
                Some("deny") => PermissionDecision::Deny,
                other => {
                    warn!(decision = ?other, "Invalid permission decision, defaulting to deny");
                    PermissionDecision::Deny
                }
            },
        };

        let _ = std::fs::remove_file(&request_file);
        let _ = std::fs::remove_file(&decision_file);

        decision
    }

    /// Settings document injected into the agent subprocess. Only allow and
    /// deny rules appear; ask rules are resolved out-of-band.
    pub fn settings_snapshot(&self) -> Value {
        let allow: Vec<String> = self.allow_rules.iter().map(|r| r.settings_entry()).collect();
        let deny: Vec<String> = self.deny_rules.iter().map(|r| r.settings_entry()).collect();

        let mut permissions = serde_json::Map::new();
        if !allow.is_empty() {
            permissions.insert("allow".into(), serde_json::json!(allow));
        }
        if !deny.is_empty() {
            permissions.insert("deny".into(), serde_json::json!(deny));
        }

        serde_json::json!({ "permissions": permissions })
    }
}

/// Pick the argument string a rule pattern applies to. Tool-specific:
/// the shell command for Bash, the path for file tools, the pattern for
/// search tools; unknown tools fall back to the first string-valued field.
fn extract_argument(tool_name: &str, tool_input: &Value) -> String {
    let field = match tool_name {
        "Bash" => Some("command"),
        "Write" | "Edit" | "Read" => Some("file_path"),
        "Glob" | "Grep" => Some("pattern"),
        _ => None,
    };

    if let Some(field) = field {
        return tool_input
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
    }

    tool_input
        .as_object()
        .and_then(|map| map.values().find_map(Value::as_str))
        .unwrap_or_default()
        .to_string()
}
