//! Typed streaming output of the orchestration loop.
//!
//! A [`StreamChunk`] is produced once and consumed once by the caller.
//! [`StreamRecord`] is its flat `{type, content}` rendering for callers
//! that want JSON lines.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::tools::{ToolCall, ToolResult};

/// The chunk vocabulary of a streamed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Model reasoning.
    Thinking,
    /// A complete tool call request.
    ToolCall,
    /// The result of executing a tool call.
    ToolResult,
    /// Final answer text.
    Content,
    /// End of turn.
    Done,
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Thinking => "thinking",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Content => "content",
            Self::Done => "done",
        };
        f.write_str(label)
    }
}

/// One unit of streamed progress.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Reasoning text.
    Thinking(String),
    /// A tool call the loop is about to execute.
    ToolCall(ToolCall),
    /// The outcome of a previously emitted tool call.
    ToolResult(ToolResult),
    /// Answer text.
    Content(String),
    /// The turn is over; nothing follows.
    Done,
}

impl StreamChunk {
    #[must_use]
    pub const fn kind(&self) -> ChunkKind {
        match self {
            Self::Thinking(_) => ChunkKind::Thinking,
            Self::ToolCall(_) => ChunkKind::ToolCall,
            Self::ToolResult(_) => ChunkKind::ToolResult,
            Self::Content(_) => ChunkKind::Content,
            Self::Done => ChunkKind::Done,
        }
    }

    /// Returns the text of a thinking or content chunk.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Thinking(text) | Self::Content(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Renders the chunk as a `{type, content}` record.
    #[must_use]
    pub fn to_record(&self) -> StreamRecord {
        let content = match self {
            Self::Thinking(text) | Self::Content(text) => serde_json::Value::from(text.as_str()),
            Self::ToolCall(call) => json!({
                "id": call.id,
                "name": call.function.name,
                "arguments": call.function.arguments,
            }),
            Self::ToolResult(result) => {
                let mut value = json!({
                    "tool_call_id": result.tool_call_id,
                    "name": result.name,
                    "duration_ms": u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
                });
                match &result.outcome {
                    Ok(output) => value["result"] = output.clone(),
                    Err(failure) => {
                        value["error"] = json!(failure.message);
                        value["error_type"] = json!(failure.kind);
                    }
                }
                value
            }
            Self::Done => serde_json::Value::Null,
        };
        StreamRecord {
            kind: self.kind(),
            content,
        }
    }
}

/// Flat JSON rendering of a [`StreamChunk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Chunk kind.
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    /// Chunk payload; absent on the end-of-turn record.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub content: serde_json::Value,
}

impl From<&StreamChunk> for StreamRecord {
    fn from(chunk: &StreamChunk) -> Self {
        chunk.to_record()
    }
}
