//! Incremental decoder for the agent CLI's stream-json output.
//!
//! The CLI emits newline-delimited JSON records. Content arrives as indexed
//! blocks: a `content_block_start` opens either a text block or a tool-use
//! block, `content_block_delta` records carry text fragments or partial-JSON
//! tool-input fragments, and `content_block_stop` closes the block. A
//! terminal `result` record carries the final text, session id and cost.
//!
//! The decoder is fed one line at a time and reconstructs identical output
//! no matter how the response was fragmented across delta records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// One decoded unit from the agent response stream.
#[derive(Debug, Clone)]
pub enum DecodedEvent {
    /// A text fragment was appended to the accumulated output.
    TextDelta { text: String },
    /// A tool-use block opened.
    ToolUseStart {
        tool_name: String,
        tool_use_id: String,
    },
    /// A partial-JSON fragment was appended to the open tool's input buffer.
    ToolInputDelta {
        tool_name: String,
        tool_use_id: String,
    },
    /// A tool-use block closed; its input is fully assembled.
    ToolUseComplete(ToolUseRecord),
    /// The terminal result record arrived. Callers stop reading on this.
    Result { subtype: String, is_error: bool },
    /// A record of an unrecognized top-level type.
    Unknown,
}

/// Audit record of one completed tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolUseRecord {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: Value,
}

/// Final output assembled from the stream.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub session_id: String,
    pub cost_usd: f64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum InnerEvent {
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        #[serde(default)]
        index: i64,
        content_block: ContentBlockKind,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta {
        #[serde(default)]
        index: i64,
        delta: Delta,
    },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {
        #[serde(default)]
        index: i64,
    },
    #[serde(rename = "message_start")]
    MessageStart,
    #[serde(rename = "message_delta")]
    MessageDelta,
    #[serde(rename = "message_stop")]
    MessageStop,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlockKind {
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "text")]
    Text,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

/// The block currently being assembled, if any.
#[derive(Debug, Default)]
enum OpenBlock {
    #[default]
    None,
    Text,
    ToolUse {
        tool_name: String,
        tool_use_id: String,
        input_parts: String,
    },
}

#[derive(Debug, Clone)]
struct ResultPayload {
    subtype: String,
    is_error: bool,
    text: String,
}

/// Stateful line-by-line decoder. One instance per agent invocation.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    text: String,
    tool_uses: Vec<ToolUseRecord>,
    seen_ids: HashSet<String>,
    open_block: OpenBlock,
    block_index: i64,
    result: Option<ResultPayload>,
    session_id: String,
    cost_usd: f64,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one newline-delimited record. Returns the decoded event, or
    /// `None` for blank, unparseable or uninteresting lines. Unparseable
    /// lines are dropped without aborting the stream.
    pub fn process_line(&mut self, line: &str) -> Option<DecodedEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let data: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                debug!(line = %truncate(line, 100), "Dropping invalid JSON line");
                return None;
            }
        };

        match data.get("type").and_then(Value::as_str) {
            Some("stream_event") => self.process_stream_event(&data),
            Some("result") => Some(self.process_result(&data)),
            _ => Some(DecodedEvent::Unknown),
        }
    }

    fn process_stream_event(&mut self, data: &Value) -> Option<DecodedEvent> {
        let inner = data.get("event")?;
        let event: InnerEvent = match serde_json::from_value(inner.clone()) {
            Ok(e) => e,
            Err(_) => {
                debug!("Unrecognized inner stream event");
                return None;
            }
        };

        match event {
            InnerEvent::ContentBlockStart {
                index,
                content_block,
            } => self.handle_block_start(index, content_block),
            InnerEvent::ContentBlockDelta { delta, .. } => self.handle_block_delta(delta),
            InnerEvent::ContentBlockStop { .. } => self.handle_block_stop(),
            InnerEvent::MessageStart | InnerEvent::MessageDelta | InnerEvent::MessageStop => None,
        }
    }

    fn handle_block_start(
        &mut self,
        index: i64,
        block: ContentBlockKind,
    ) -> Option<DecodedEvent> {
        self.block_index = index;

        match block {
            ContentBlockKind::ToolUse { id, name } => {
                // Repeated ids are replays, not new invocations.
                if !self.seen_ids.insert(id.clone()) {
                    return None;
                }
                debug!(tool = %name, id = %id, "Tool use started");
                self.open_block = OpenBlock::ToolUse {
                    tool_name: name.clone(),
                    tool_use_id: id.clone(),
                    input_parts: String::new(),
                };
                Some(DecodedEvent::ToolUseStart {
                    tool_name: name,
                    tool_use_id: id,
                })
            }
            ContentBlockKind::Text => {
                self.open_block = OpenBlock::Text;
                None
            }
            ContentBlockKind::Other => {
                self.open_block = OpenBlock::None;
                None
            }
        }
    }

    fn handle_block_delta(&mut self, delta: Delta) -> Option<DecodedEvent> {
        match delta {
            Delta::TextDelta { text } => {
                if text.is_empty() {
                    return None;
                }
                self.text.push_str(&text);
                Some(DecodedEvent::TextDelta { text })
            }
            Delta::InputJsonDelta { partial_json } => {
                if partial_json.is_empty() {
                    return None;
                }
                if let OpenBlock::ToolUse {
                    tool_name,
                    tool_use_id,
                    input_parts,
                } = &mut self.open_block
                {
                    input_parts.push_str(&partial_json);
                    Some(DecodedEvent::ToolInputDelta {
                        tool_name: tool_name.clone(),
                        tool_use_id: tool_use_id.clone(),
                    })
                } else {
                    None
                }
            }
            Delta::Other => None,
        }
    }

    fn handle_block_stop(&mut self) -> Option<DecodedEvent> {
        debug!(index = self.block_index, "Content block closed");
        match std::mem::take(&mut self.open_block) {
            OpenBlock::ToolUse {
                tool_name,
                tool_use_id,
                input_parts,
            } => {
                let input = if input_parts.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&input_parts).unwrap_or_else(|_| {
                        warn!(
                            tool = %tool_name,
                            fragment = %truncate(&input_parts, 200),
                            "Failed to parse tool input JSON"
                        );
                        Value::Object(Default::default())
                    })
                };

                let record = ToolUseRecord {
                    tool_name,
                    tool_use_id,
                    input,
                };
                self.tool_uses.push(record.clone());
                Some(DecodedEvent::ToolUseComplete(record))
            }
            _ => None,
        }
    }

    /// The live CLI emits result fields flat on the record; older builds nest
    /// them under a `result` object. Accept both shapes.
    fn process_result(&mut self, data: &Value) -> DecodedEvent {
        let container = match data.get("result") {
            Some(v) if v.is_object() => v,
            _ => data,
        };

        let subtype = container
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let is_error = container
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let text = container
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.session_id = container
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.cost_usd = container
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        debug!(session = %self.session_id, cost = self.cost_usd, "Stream result received");

        self.result = Some(ResultPayload {
            subtype: subtype.clone(),
            is_error,
            text,
        });

        DecodedEvent::Result { subtype, is_error }
    }

    /// Text accumulated from delta fragments so far.
    pub fn accumulated_text(&self) -> &str {
        &self.text
    }

    /// All completed tool invocations seen so far.
    pub fn tool_uses(&self) -> &[ToolUseRecord] {
        &self.tool_uses
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_usd
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// Assemble the final output. Without a result record (timeout, early
    /// EOF) this reports failure but still returns the accumulated text.
    pub fn build_output(&self) -> ExecOutput {
        match &self.result {
            Some(result) => {
                let output = if result.text.is_empty() {
                    self.text.clone()
                } else {
                    result.text.clone()
                };
                ExecOutput {
                    success: !result.is_error && result.subtype == "success",
                    output,
                    error: result.is_error.then(|| result.text.clone()),
                    session_id: self.session_id.clone(),
                    cost_usd: self.cost_usd,
                }
            }
            None => ExecOutput {
                success: false,
                output: self.text.clone(),
                error: Some("no result event received".to_string()),
                session_id: self.session_id.clone(),
                cost_usd: self.cost_usd,
            },
        }
    }
}

fn truncate(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
