//! Classification of raw stream-json records into display lines.
//!
//! | Record                         | Display                                   |
//! |--------------------------------|-------------------------------------------|
//! | `system` / `init`              | fixed banner                              |
//! | `assistant` text block         | the text verbatim, scanned for markers    |
//! | `assistant` tool_use block     | `[tool] <name>: <input, 300 chars>`       |
//! | `user` tool_result block       | `[result] <content, 300 chars>`           |
//! | `result`                       | completion banner                         |
//! | anything else                  | nothing                                   |
//! | not JSON                       | the line unchanged                        |
//!
//! Only assistant text is scanned for markers, so output echoed back from a
//! tool can never fabricate an event or memory.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::MarkerError;
use crate::session::TerminalMetadata;
use crate::stream::marker::{Marker, scan_markers};

/// Maximum characters of tool input or output shown in a display line.
pub const PREVIEW_CHARS: usize = 300;

pub const INIT_BANNER: &str = "=== Session initialized ===";

const NOT_REPORTED: &str = "n/a";

/// Rendering decision for one raw line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classified {
    pub display: Option<String>,
    pub markers: Vec<Marker>,
    pub rejected: Vec<MarkerError>,
    pub result: Option<ResultSummary>,
}

/// The agent's terminal result record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSummary {
    pub is_error: bool,
    pub response: Option<String>,
    pub cost_usd: Option<Decimal>,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
}

impl ResultSummary {
    pub fn metadata(&self) -> TerminalMetadata {
        TerminalMetadata {
            response: self.response.clone(),
            cost_usd: self.cost_usd,
            num_turns: self.num_turns,
            duration_ms: self.duration_ms,
        }
    }

    /// Completion banner. Values the agent did not report render as `n/a`.
    pub fn banner(&self) -> String {
        let turns = self
            .num_turns
            .map_or_else(|| NOT_REPORTED.to_string(), |n| n.to_string());
        let cost = self
            .cost_usd
            .map_or_else(|| NOT_REPORTED.to_string(), |c| format!("${:.4}", c));
        let duration = self.duration_ms.map_or_else(
            || NOT_REPORTED.to_string(),
            |ms| format!("{:.1}s", ms as f64 / 1000.0),
        );
        format!("=== Session complete: {} turns, {}, {} ===", turns, cost, duration)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamRecord {
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    Assistant {
        message: TurnMessage,
    },
    User {
        message: TurnMessage,
    },
    Result(ResultRecord),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TurnMessage {
    #[serde(default)]
    content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Blocks(Vec<ContentBlock>),
    Text(String),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        #[serde(default)]
        content: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultRecord {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    num_turns: Option<u32>,
    #[serde(default)]
    duration_ms: Option<u64>,
}

impl From<ResultRecord> for ResultSummary {
    fn from(r: ResultRecord) -> Self {
        let is_error = r.is_error
            || r
                .subtype
                .as_deref()
                .is_some_and(|s| s.starts_with("error"));
        Self {
            is_error,
            response: r.result,
            cost_usd: r
                .total_cost_usd
                .and_then(Decimal::from_f64_retain)
                .map(|d| d.round_dp(6)),
            num_turns: r.num_turns,
            duration_ms: r.duration_ms,
        }
    }
}

/// Classify one raw line of agent output. Pure; the same line always
/// produces the same result.
pub fn classify(line: &str) -> Classified {
    let record = match serde_json::from_str::<StreamRecord>(line) {
        Ok(record) => record,
        Err(_) => {
            return Classified {
                display: Some(line.to_string()),
                ..Default::default()
            };
        }
    };

    match record {
        StreamRecord::System { subtype } if subtype.as_deref() == Some("init") => Classified {
            display: Some(INIT_BANNER.to_string()),
            ..Default::default()
        },
        StreamRecord::Assistant { message } => classify_assistant(message.content),
        StreamRecord::User { message } => classify_user(message.content),
        StreamRecord::Result(record) => {
            let summary = ResultSummary::from(record);
            Classified {
                display: Some(summary.banner()),
                result: Some(summary),
                ..Default::default()
            }
        }
        StreamRecord::System { .. } | StreamRecord::Other => Classified::default(),
    }
}

fn classify_assistant(content: MessageContent) -> Classified {
    let mut out = Classified::default();
    let mut parts = Vec::new();

    let blocks = match content {
        MessageContent::Blocks(blocks) => blocks,
        MessageContent::Text(text) => vec![ContentBlock::Text { text }],
    };

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                let (markers, rejected) = scan_markers(&text);
                out.markers.extend(markers);
                out.rejected.extend(rejected);
                parts.push(text);
            }
            ContentBlock::ToolUse { name, input } => {
                let input = match input {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                parts.push(format!("[tool] {}: {}", name, truncate_preview(&input)));
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
        }
    }

    out.display = join_parts(parts);
    out
}

fn classify_user(content: MessageContent) -> Classified {
    let MessageContent::Blocks(blocks) = content else {
        return Classified::default();
    };

    let parts = blocks
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult { content } => Some(format!(
                "[result] {}",
                truncate_preview(&tool_result_text(&content))
            )),
            _ => None,
        })
        .collect();

    Classified {
        display: join_parts(parts),
        ..Default::default()
    }
}

/// Tool result content is either a string or a list of typed blocks.
fn tool_result_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                item.get("text")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
            })
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn join_parts(parts: Vec<String>) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Truncate to [`PREVIEW_CHARS`] characters with an ellipsis (char-aware).
pub fn truncate_preview(s: &str) -> String {
    if s.chars().count() <= PREVIEW_CHARS {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(PREVIEW_CHARS).collect::<String>())
    }
}

/// Re-render a durable raw log into display lines.
pub fn render_log<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    lines
        .into_iter()
        .filter_map(|line| classify(line).display)
        .collect()
}
