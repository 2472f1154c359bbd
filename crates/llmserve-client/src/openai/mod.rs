//! Wire types for the OpenAI-compatible chat completions API.
//!
//! Ollama, vLLM and llama.cpp all serve this API. Thinking models on these
//! servers report reasoning in a separate `reasoning` (Ollama) or
//! `reasoning_content` (vLLM, llama.cpp) field, and both are read.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use typed_builder::TypedBuilder;

use llmserve_common::chat::{Message, MessageRole};
use llmserve_common::client::{ChatRequest, Config, ToolCallDelta, Usage};
use llmserve_common::tools::{Tool, ToolCall};

pub mod client;
pub use client::{OpenAIClient, convert_chunk_to_chat_chunk};

/// A single choice from a chat completion response.
#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    /// The index of this choice in the response array.
    #[serde(default)]
    pub index: u32,
    /// The generated message.
    pub message: OpenAIMessage,
    /// Why generation stopped.
    pub finish_reason: Option<String>,
}

/// A message as sent to and received from the API.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct OpenAIMessage {
    /// The role of the message author.
    pub role: MessageRole,
    /// Text content, omitted when empty.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Function name on tool-role messages.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool calls requested by the assistant.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<SmallVec<[ToolCall; 2]>>,
    /// The call a tool-role message answers.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Reasoning text (Ollama).
    #[builder(default)]
    #[serde(default, skip_serializing)]
    pub reasoning: Option<String>,
    /// Reasoning text (vLLM, llama.cpp).
    #[builder(default)]
    #[serde(default, skip_serializing)]
    pub reasoning_content: Option<String>,
}

impl OpenAIMessage {
    /// Reasoning text from whichever field the server used.
    #[must_use]
    pub fn reasoning_text(&self) -> Option<&str> {
        self.reasoning
            .as_deref()
            .or(self.reasoning_content.as_deref())
            .filter(|text| !text.is_empty())
    }
}

impl From<&Message> for OpenAIMessage {
    fn from(message: &Message) -> Self {
        let tool_calls = (!message.tool_calls.is_empty()).then(|| message.tool_calls.clone());
        let content = (!message.content.is_empty()).then(|| message.content.clone());

        Self::builder()
            .role(message.role)
            .content(content)
            .name(message.name.clone())
            .tool_calls(tool_calls)
            .tool_call_id(message.tool_call_id.clone())
            .build()
    }
}

/// Request body for `/chat/completions`.
#[derive(Debug, Clone, Serialize, TypedBuilder)]
pub struct ChatCompletionRequest {
    /// The model identifier.
    pub model: String,
    /// The conversation.
    pub messages: Vec<OpenAIMessage>,
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Whether to stream the response.
    #[builder(default = false)]
    pub stream: bool,
    /// Tools advertised to the model.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    /// Tool selection strategy.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    /// Streaming options, e.g. `{"include_usage": true}`.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<serde_json::Value>,
}

impl From<(&ChatRequest, &Config)> for ChatCompletionRequest {
    fn from((request, config): (&ChatRequest, &Config)) -> Self {
        Self::builder()
            .model(
                request
                    .model
                    .clone()
                    .unwrap_or_else(|| config.model.clone()),
            )
            .messages(request.messages.iter().map(OpenAIMessage::from).collect())
            .max_tokens(request.max_tokens)
            .temperature(request.temperature)
            .top_p(request.top_p)
            .stop(request.stop.clone())
            .stream(request.stream)
            .tools(request.tools.clone())
            .tool_choice(request.tool_choice.clone().map(Into::into))
            .build()
    }
}

/// Response body of a non-streamed completion.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    /// Completion identifier.
    pub id: String,
    /// Unix timestamp of creation.
    #[serde(default)]
    pub created: u64,
    /// The model that answered.
    pub model: String,
    /// Generated choices.
    pub choices: Vec<ChatChoice>,
    /// Token usage, if reported.
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// A single choice from a streaming chunk.
#[derive(Debug, Deserialize)]
pub struct ChatStreamChoice {
    #[serde(default)]
    pub index: u32,
    /// Incremental message delta.
    pub delta: OpenAIMessageDelta,
    /// Why generation stopped, on the final chunk.
    pub finish_reason: Option<String>,
}

/// Incremental changes to the assistant message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAIMessageDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<SmallVec<[OpenAIToolCallDelta; 2]>>,
}

/// Incremental changes to one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIToolCallDelta {
    /// Position of the call in the turn.
    #[serde(default)]
    pub index: Option<u32>,
    /// Present on the first delta of a call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<OpenAIFunctionDelta>,
}

/// Incremental changes to a function call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIFunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Argument text fragment. Some servers send the whole object at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

impl From<&OpenAIToolCallDelta> for ToolCallDelta {
    fn from(delta: &OpenAIToolCallDelta) -> Self {
        let function = delta.function.as_ref();
        Self {
            index: delta.index,
            id: delta.id.clone().filter(|id| !id.is_empty()),
            name: function
                .and_then(|f| f.name.clone())
                .filter(|name| !name.is_empty()),
            arguments: function
                .and_then(|f| f.arguments.as_ref())
                .and_then(|args| match args {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(text) => Some(text.clone()),
                    other => Some(other.to_string()),
                }),
        }
    }
}

/// A chunk of a streamed completion.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatStreamChoice>,
    /// Token usage, on the final chunk when `include_usage` is set.
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Tool calls on a parsed reply, with the id generated when a server omits it.
pub(crate) fn normalize_tool_calls(calls: &[ToolCall]) -> SmallVec<[ToolCall; 2]> {
    calls
        .iter()
        .map(|call| {
            if call.id.is_empty() {
                ToolCall::new(call.function.name.clone(), call.function.arguments.clone())
            } else {
                call.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use llmserve_common::client::ToolChoice;
    use llmserve_common::tools::FunctionCall;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_message_conversion_omits_empty_fields() {
        let msg = Message::user(Uuid::new_v4(), "hi");
        let json = serde_json::to_value(OpenAIMessage::from(&msg)).unwrap();
        assert_eq!(json, json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_assistant_tool_calls_serialize_as_wire_directives() {
        let call = ToolCall::with_id("call_1", "get_current_temperature", r#"{"location":"Tokyo"}"#);
        let msg = Message::assistant(Uuid::new_v4(), "")
            .with_tool_calls(vec![call])
            .unwrap();
        let json = serde_json::to_value(OpenAIMessage::from(&msg)).unwrap();

        assert!(json.get("content").is_none());
        assert_eq!(json["tool_calls"][0]["id"], "call_1");
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(
            json["tool_calls"][0]["function"]["arguments"],
            r#"{"location":"Tokyo"}"#
        );
    }

    #[test]
    fn test_tool_message_carries_call_id() {
        let msg = Message::tool(Uuid::new_v4(), "18°C", "call_1".into(), "f".into()).unwrap();
        let json = serde_json::to_value(OpenAIMessage::from(&msg)).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
    }

    #[test]
    fn test_request_conversion_uses_config_model() {
        let config = Config::ollama("qwen3:0.6b");
        let request = ChatRequest::new(vec![Message::user(Uuid::new_v4(), "hi")])
            .with_tool_choice(ToolChoice::Auto);
        let body = ChatCompletionRequest::from((&request, &config));

        assert_eq!(body.model, "qwen3:0.6b");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["tool_choice"], "auto");
        assert_eq!(json["stream"], false);
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn test_delta_with_structured_arguments() {
        let delta: OpenAIToolCallDelta = serde_json::from_value(json!({
            "index": 0,
            "id": "call_a",
            "function": {"name": "f", "arguments": {"x": 1}}
        }))
        .unwrap();
        let converted = ToolCallDelta::from(&delta);
        assert_eq!(converted.arguments.as_deref(), Some(r#"{"x":1}"#));
        assert_eq!(converted.id.as_deref(), Some("call_a"));
    }

    #[test]
    fn test_reasoning_field_variants() {
        let ollama: OpenAIMessage =
            serde_json::from_value(json!({"role": "assistant", "content": "", "reasoning": "hmm"}))
                .unwrap();
        assert_eq!(ollama.reasoning_text(), Some("hmm"));

        let vllm: OpenAIMessage = serde_json::from_value(
            json!({"role": "assistant", "content": "x", "reasoning_content": "think"}),
        )
        .unwrap();
        assert_eq!(vllm.reasoning_text(), Some("think"));
    }

    #[test]
    fn test_missing_ids_are_generated() {
        let calls = vec![ToolCall::with_id("", "f", "{}")];
        let normalized = normalize_tool_calls(&calls);
        assert!(normalized[0].id.starts_with("call_"));
        assert_eq!(normalized[0].function, FunctionCall {
            name: "f".into(),
            arguments: "{}".into()
        });
    }
}
