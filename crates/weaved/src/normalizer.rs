//! Output stream normalizer (spec Section 4.2).
//!
//! Converts an agent's raw stream-JSON output lines into a deterministic
//! sequence of `NormalizedEntry` records, tracking tool calls and file
//! changes derived from them. No teacher equivalent exists; the line-by-line
//! JSON handling follows the flattened-event style used by `weave-core`'s
//! `events.rs` (`#[serde(flatten)]` payload maps) and the error taxonomy
//! follows the per-module `thiserror` convention used throughout `weaved`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use weave_core::{EntryKind, FileChange, FileOperation, Id, NormalizedEntry, ToolCall, ToolCallStatus};

/// Per-model token pricing, dollars per million tokens (input, output).
/// Unknown models fall back to `DEFAULT_PRICE`.
const PRICE_TABLE: &[(&str, f64, f64)] = &[
    ("claude-opus-4", 15.0, 75.0),
    ("claude-sonnet-4", 3.0, 15.0),
    ("claude-haiku-4", 0.8, 4.0),
    ("gpt-5", 5.0, 15.0),
    ("gpt-5-mini", 0.25, 1.0),
];
const DEFAULT_PRICE: (f64, f64) = (3.0, 15.0);

fn price_for_model(model: &str) -> (f64, f64) {
    PRICE_TABLE
        .iter()
        .find(|(name, _, _)| model.contains(name))
        .map(|(_, input, output)| (*input, *output))
        .unwrap_or(DEFAULT_PRICE)
}

/// Accumulated usage metrics for one execution.
#[derive(Debug, Clone, Default)]
pub struct UsageMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawContentPart>,
    #[serde(default)]
    usage: Option<RawUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawContentPart {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    line_type: String,
    #[serde(default)]
    message: Option<RawMessage>,
}

/// Parses an agent's stream-JSON output into normalized entries, tool calls,
/// and file changes. One normalizer instance is scoped to a single execution.
pub struct Normalizer {
    execution_id: Id,
    model: String,
    next_index: u64,
    entries: Vec<NormalizedEntry>,
    tool_calls: HashMap<String, ToolCall>,
    file_changes: Vec<FileChange>,
    usage: UsageMetrics,
}

impl Normalizer {
    pub fn new(execution_id: Id, model: impl Into<String>) -> Self {
        Self {
            execution_id,
            model: model.into(),
            next_index: 0,
            entries: Vec::new(),
            tool_calls: HashMap::new(),
            file_changes: Vec::new(),
            usage: UsageMetrics::default(),
        }
    }

    /// Feed one line of raw agent output. Blank lines are skipped. A line
    /// that fails to parse produces an `error` entry carrying the line
    /// number instead of aborting the stream.
    pub fn feed_line(&mut self, line: &str) -> Vec<NormalizedEntry> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Vec::new();
        }

        let now = Utc::now();
        let parsed: std::result::Result<RawLine, _> = serde_json::from_str(line);
        let raw = match parsed {
            Ok(raw) => raw,
            Err(err) => {
                return vec![self.push_entry(
                    EntryKind::Error,
                    serde_json::json!({
                        "error": err.to_string(),
                        "line_index": self.next_index,
                        "raw": line,
                    })
                    .to_string(),
                    now,
                )]
            }
        };

        let mut produced = Vec::new();
        let Some(message) = raw.message else {
            return produced;
        };

        if let Some(model) = message.model.as_ref() {
            self.model = model.clone();
        }
        if let Some(usage) = &message.usage {
            self.accumulate_usage(usage.input_tokens, usage.output_tokens);
        }

        let kind = match raw.line_type.as_str() {
            "user" => EntryKind::UserMessage,
            "assistant" => EntryKind::AssistantMessage,
            "system" => EntryKind::System,
            other => {
                tracing::debug!(line_type = other, "unrecognized stream line type");
                EntryKind::System
            }
        };

        for part in message.content {
            match part {
                RawContentPart::Text { text } => {
                    produced.push(self.push_entry(
                        kind,
                        serde_json::json!({ "text": text }).to_string(),
                        now,
                    ));
                }
                RawContentPart::Thinking { thinking } => {
                    produced.push(self.push_entry(
                        EntryKind::Thinking,
                        serde_json::json!({ "thinking": thinking }).to_string(),
                        now,
                    ));
                }
                RawContentPart::ToolUse { id, name, input } => {
                    let input_json = input.to_string();
                    self.tool_calls.insert(
                        id.clone(),
                        ToolCall {
                            tool_id: id.clone(),
                            execution_id: self.execution_id.clone(),
                            name: name.clone(),
                            input_json: input_json.clone(),
                            status: ToolCallStatus::Pending,
                            result: None,
                            error: None,
                            started_at: now,
                            completed_at: None,
                        },
                    );
                    produced.push(self.push_entry(
                        EntryKind::ToolUse,
                        serde_json::json!({ "tool_id": id, "name": name, "input": input }).to_string(),
                        now,
                    ));
                }
                RawContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    if let Some(call) = self.tool_calls.get_mut(&tool_use_id) {
                        call.status = if is_error {
                            ToolCallStatus::Error
                        } else {
                            ToolCallStatus::Success
                        };
                        call.completed_at = Some(now);
                        if is_error {
                            call.error = Some(content.to_string());
                        } else {
                            call.result = Some(content.to_string());
                        }

                        if !is_error {
                            if let Some(op) = FileOperation::from_tool_name(&call.name) {
                                if let Some(path) = extract_path(&call.input_json) {
                                    self.file_changes.push(FileChange {
                                        path,
                                        operation: op,
                                        tool_call_id: tool_use_id.clone(),
                                        timestamp: now,
                                    });
                                }
                            }
                        }
                    }
                    produced.push(self.push_entry(
                        EntryKind::ToolResult,
                        serde_json::json!({
                            "tool_id": tool_use_id,
                            "is_error": is_error,
                            "content": content,
                        })
                        .to_string(),
                        now,
                    ));
                }
            }
        }

        produced
    }

    fn push_entry(&mut self, kind: EntryKind, payload_json: String, timestamp: DateTime<Utc>) -> NormalizedEntry {
        let entry = NormalizedEntry {
            index: self.next_index,
            execution_id: self.execution_id.clone(),
            kind,
            payload_json,
            timestamp,
        };
        self.next_index += 1;
        self.entries.push(entry.clone());
        entry
    }

    fn accumulate_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.usage.input_tokens += input_tokens;
        self.usage.output_tokens += output_tokens;
        let (input_price, output_price) = price_for_model(&self.model);
        self.usage.cost_usd +=
            (input_tokens as f64 / 1_000_000.0) * input_price + (output_tokens as f64 / 1_000_000.0) * output_price;
    }

    pub fn entries(&self) -> &[NormalizedEntry] {
        &self.entries
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.tool_calls.values()
    }

    pub fn tool_calls_by_name(&self, name: &str) -> Vec<&ToolCall> {
        self.tool_calls.values().filter(|t| t.name == name).collect()
    }

    pub fn tool_calls_by_status(&self, status: ToolCallStatus) -> Vec<&ToolCall> {
        self.tool_calls.values().filter(|t| t.status == status).collect()
    }

    pub fn file_changes(&self) -> &[FileChange] {
        &self.file_changes
    }

    pub fn file_changes_for_path(&self, path: &str) -> Vec<&FileChange> {
        self.file_changes.iter().filter(|c| c.path == path).collect()
    }

    pub fn usage(&self) -> &UsageMetrics {
        &self.usage
    }
}

/// Best-effort extraction of a `file_path`/`path` key from a tool call's
/// JSON input, for deriving `FileChange` records.
fn extract_path(input_json: &str) -> Option<String> {
    let value: Value = serde_json::from_str(input_json).ok()?;
    value
        .get("file_path")
        .or_else(|| value.get("path"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
