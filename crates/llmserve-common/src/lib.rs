//! # llmserve-common
//!
//! Data types shared by the llmserve crates: conversations and messages,
//! tool definitions and calls, backend request/response shapes, and the
//! streaming chunk vocabulary.
//!
//! ## Example
//!
//! ```
//! use llmserve_common::{Conversation, Parameters, Property, Tool, ToolCall};
//!
//! let mut conv = Conversation::with_system_prompt("You are a helpful assistant.");
//! let msg = conv.user_message("What time is it in Tokyo?");
//! conv.add_message(msg).unwrap();
//!
//! let tool = Tool::function(
//!     "get_current_time",
//!     "Get the current time in a timezone",
//!     Parameters::from_fields([("timezone", Property::string("Timezone name"), false)]),
//! );
//! assert_eq!(tool.name(), "get_current_time");
//!
//! let call = ToolCall::new("get_current_time", r#"{"timezone":"JST"}"#);
//! assert!(call.id.starts_with("call_"));
//! ```

/// Conversations, messages and roles.
pub mod chat;
/// Backend configuration and request/response types.
pub mod client;
/// Streaming chunk vocabulary.
pub mod events;
/// Tool definitions, calls and results.
pub mod tools;

pub use chat::{Conversation, Message, MessageRole};
pub use client::{
    ChatChunk, ChatRequest, ChatResponse, Config, DEFAULT_MODEL, DEFAULT_OLLAMA_HOST,
    DEFAULT_OLLAMA_PORT, FinishReason, RetryConfig, ToolCallDelta, ToolChoice, Usage,
    ollama_base_url,
};
pub use events::{ChunkKind, StreamChunk, StreamRecord};
pub use tools::{
    Function, FunctionCall, ObjectSchema, Parameters, Property, Tool, ToolCall, ToolFailure,
    ToolFailureKind, ToolResult,
};
