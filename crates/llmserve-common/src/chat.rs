//! Conversation and message types for tool-calling chat sessions.
//!
//! A [`Conversation`] is an append-only list of [`Message`]s. Four roles are
//! supported via [`MessageRole`]:
//!
//! - **System**: instructions for the model, normally the first message
//! - **User**: input from the caller
//! - **Assistant**: model replies, optionally carrying tool call requests
//! - **Tool**: the result of one tool call, linked back by `tool_call_id`
//!
//! # Tool result ordering
//!
//! When an assistant message requests tools, the messages that follow it must
//! be the tool results for those requests, one per call and in the order the
//! calls were made. [`Conversation::add_message`] enforces this.
//!
//! ```
//! use llmserve_common::chat::Conversation;
//! use llmserve_common::tools::ToolCall;
//!
//! let mut conversation = Conversation::new();
//! conversation.add_message(conversation.system_message("You are helpful.")).unwrap();
//! conversation.add_message(conversation.user_message("What's the weather in Tokyo?")).unwrap();
//!
//! let call = ToolCall::new("get_current_temperature", r#"{"location": "Tokyo"}"#);
//! let assistant = conversation
//!     .assistant_message("")
//!     .with_tool_calls(vec![call.clone()])
//!     .unwrap();
//! conversation.add_message(assistant).unwrap();
//!
//! let result = conversation
//!     .tool_message("The current temperature in Tokyo is 18.0°C", call.id.clone(), call.function.name.clone())
//!     .unwrap();
//! conversation.add_message(result).unwrap();
//!
//! assert!(conversation.pending_tool_call_ids().is_empty());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::tools::{ToolCall, ToolResult};

/// Role of a message sender.
///
/// Serialized to the lowercase strings used by OpenAI-compatible APIs.
///
/// ```
/// use llmserve_common::chat::MessageRole;
///
/// let json = serde_json::to_string(&MessageRole::Tool).unwrap();
/// assert_eq!(json, "\"tool\"");
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions and context for the model.
    System,
    /// Input from the caller.
    User,
    /// A model reply, possibly requesting tool calls.
    Assistant,
    /// The result of executing one tool call.
    Tool,
}

/// A single message in a conversation.
///
/// `tool_calls` is only non-empty on assistant messages and `tool_call_id`
/// is only set on tool messages. The convenience constructors and
/// [`Message::with_tool_calls`] keep those fields consistent with the role.
#[derive(Debug, Serialize, Deserialize, Clone, TypedBuilder)]
pub struct Message {
    /// Unique identifier for this message.
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// The conversation this message belongs to.
    pub conversation_id: Uuid,

    /// The role of the sender.
    pub role: MessageRole,

    /// Text content. Empty for assistant messages that only request tools.
    #[builder(default)]
    pub content: String,

    /// Reasoning text the backend marked as internal thinking.
    ///
    /// Kept for inspection; it is never sent back to the backend.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// When this message was created.
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,

    /// Tool calls requested by an assistant message, in request order.
    ///
    /// Uses `SmallVec` since most turns request one or two tools.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub tool_calls: SmallVec<[ToolCall; 2]>,

    /// The tool call a tool message answers.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Function name for tool messages.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Creates a message with the given role and content.
    pub fn new(conversation_id: Uuid, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content: content.into(),
            reasoning: None,
            timestamp: Utc::now(),
            tool_calls: SmallVec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Creates a system message.
    pub fn system(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self::new(conversation_id, MessageRole::System, content)
    }

    /// Creates a user message.
    pub fn user(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self::new(conversation_id, MessageRole::User, content)
    }

    /// Creates an assistant message.
    pub fn assistant(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self::new(conversation_id, MessageRole::Assistant, content)
    }

    /// Creates a tool result message.
    ///
    /// # Errors
    ///
    /// Returns an error if `tool_call_id` or `function_name` is empty.
    pub fn tool(
        conversation_id: Uuid,
        content: impl Into<String>,
        tool_call_id: String,
        function_name: String,
    ) -> anyhow::Result<Self> {
        if tool_call_id.is_empty() {
            anyhow::bail!("Tool call ID cannot be empty");
        }
        if function_name.is_empty() {
            anyhow::bail!("Function name cannot be empty for tool messages");
        }
        let mut msg = Self::new(conversation_id, MessageRole::Tool, content);
        msg.tool_call_id = Some(tool_call_id);
        msg.name = Some(function_name);
        Ok(msg)
    }

    /// Attaches reasoning text.
    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        let reasoning = reasoning.into();
        self.reasoning = (!reasoning.is_empty()).then_some(reasoning);
        self
    }

    /// Sets the tool calls of an assistant message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is not an assistant message, or if two
    /// calls share an id.
    pub fn with_tool_calls(
        mut self,
        tool_calls: impl Into<SmallVec<[ToolCall; 2]>>,
    ) -> anyhow::Result<Self> {
        if self.role != MessageRole::Assistant {
            anyhow::bail!(
                "Tool calls can only be added to assistant messages, found {:?}",
                self.role
            );
        }
        let tool_calls = tool_calls.into();
        for (i, call) in tool_calls.iter().enumerate() {
            if tool_calls[..i].iter().any(|other| other.id == call.id) {
                anyhow::bail!("Duplicate tool call id '{}' in one message", call.id);
            }
        }
        self.tool_calls = tool_calls;
        Ok(self)
    }

    /// Returns true if this is an assistant message requesting tools.
    #[must_use]
    pub fn requests_tools(&self) -> bool {
        self.role == MessageRole::Assistant && !self.tool_calls.is_empty()
    }
}

/// An ordered, append-only thread of messages.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Conversation {
    /// Unique identifier, shared by every message in the conversation.
    pub id: Uuid,

    /// When the conversation was created.
    pub created_at: DateTime<Utc>,

    /// When a message was last appended.
    pub updated_at: DateTime<Utc>,

    messages: Vec<Message>,
}

impl Conversation {
    /// Creates an empty conversation.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Creates a conversation seeded with a system prompt.
    #[must_use]
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut conversation = Self::new();
        let system = Message::system(conversation.id, prompt);
        conversation.messages.push(system);
        conversation
    }

    /// Appends a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message belongs to another conversation, if a
    /// tool message does not answer the next outstanding call of the preceding
    /// assistant message, or if a non-tool message is appended while calls are
    /// still outstanding.
    pub fn add_message(&mut self, message: Message) -> anyhow::Result<()> {
        if message.conversation_id != self.id {
            anyhow::bail!(
                "Message conversation_id {} does not match conversation id {}",
                message.conversation_id,
                self.id
            );
        }

        let expected = self.pending_tool_call_ids().first().cloned();
        match (message.role, expected) {
            (MessageRole::Tool, Some(expected)) => {
                if message.tool_call_id.as_deref() != Some(expected.as_str()) {
                    anyhow::bail!(
                        "Tool message answers {:?} but the next outstanding call is '{expected}'",
                        message.tool_call_id
                    );
                }
            }
            (MessageRole::Tool, None) => {
                anyhow::bail!("Tool message without an outstanding tool call");
            }
            (role, Some(expected)) => {
                anyhow::bail!("Cannot append a {role:?} message while tool call '{expected}' is unanswered");
            }
            (_, None) => {}
        }

        self.messages.push(message);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Ids of tool calls from the latest assistant message that have no result yet,
    /// in request order.
    #[must_use]
    pub fn pending_tool_call_ids(&self) -> Vec<String> {
        let Some(pos) = self
            .messages
            .iter()
            .rposition(|m| m.role == MessageRole::Assistant)
        else {
            return Vec::new();
        };
        let answered = self.messages[pos + 1..]
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .count();
        self.messages[pos]
            .tool_calls
            .iter()
            .skip(answered)
            .map(|call| call.id.clone())
            .collect()
    }

    /// All messages, oldest first.
    #[must_use]
    pub fn get_messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the conversation has no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The most recent message, if any.
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Drops everything except the leading system messages.
    pub fn reset_to_system(&mut self) {
        let keep = self
            .messages
            .iter()
            .take_while(|m| m.role == MessageRole::System)
            .count();
        self.messages.truncate(keep);
        self.updated_at = Utc::now();
    }

    /// Builds a user message for this conversation.
    pub fn user_message(&self, content: impl Into<String>) -> Message {
        Message::user(self.id, content)
    }

    /// Builds an assistant message for this conversation.
    pub fn assistant_message(&self, content: impl Into<String>) -> Message {
        Message::assistant(self.id, content)
    }

    /// Builds a system message for this conversation.
    pub fn system_message(&self, content: impl Into<String>) -> Message {
        Message::system(self.id, content)
    }

    /// Builds a tool result message for this conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the id or function name is empty.
    pub fn tool_message(
        &self,
        content: impl Into<String>,
        tool_call_id: String,
        function_name: String,
    ) -> anyhow::Result<Message> {
        Message::tool(self.id, content, tool_call_id, function_name)
    }

    /// Appends the tool-role message answering `result`.
    ///
    /// # Errors
    ///
    /// Returns an error if `result` does not answer the next outstanding call.
    pub fn add_tool_result(&mut self, result: &ToolResult) -> anyhow::Result<()> {
        let message = self.tool_message(
            result.content(),
            result.tool_call_id.clone(),
            result.name.clone(),
        )?;
        self.add_message(message)
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}
