//! A conversation session on top of [`Core`].

use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use llmserve_client::LLMClient;
use llmserve_common::Conversation;
use llmserve_tools::{ToolImplementation, ToolRegistry};

use crate::core::{ChunkStream, Core, CoreConfig};
use crate::error::CoreError;

/// System prompt used by [`Agent::new`].
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to tools. \
When a question needs live data, a calculation or a file, call the matching tool and \
answer from its result. If a tool reports an error, explain it or try again with \
corrected arguments. Answer directly when no tool is needed.";

/// How a message should be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatOptions {
    /// Advertise the registry's tools to the model.
    pub use_tools: bool,
    /// Return chunks as they are produced instead of the final text.
    pub stream: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            use_tools: true,
            stream: false,
        }
    }
}

/// The answer to [`Agent::respond`].
pub enum Reply<'a> {
    Text(String),
    Stream(ChunkStream<'a>),
}

impl std::fmt::Debug for Reply<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// One user's conversation with a tool-using model.
///
/// The agent owns its history. Each call appends the user message, runs the
/// orchestration loop and keeps whatever the loop appended, so later calls see
/// earlier tool results.
#[derive(Debug)]
pub struct Agent<C: LLMClient> {
    system_prompt: String,
    conversation: Conversation,
    core: Core<C>,
    cancel: CancellationToken,
}

impl<C: LLMClient> Agent<C> {
    pub fn new(client: C, registry: Arc<ToolRegistry>) -> Self {
        Self::with_system_prompt(client, registry, DEFAULT_SYSTEM_PROMPT)
    }

    pub fn with_system_prompt(
        client: C,
        registry: Arc<ToolRegistry>,
        system_prompt: impl Into<String>,
    ) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            conversation: Conversation::with_system_prompt(system_prompt.clone()),
            system_prompt,
            core: Core::new(client, registry),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.core.config = config;
        self
    }

    /// Installs a token that interrupts the current and all later calls.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replaces the cancellation token, for example after a cancelled call.
    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub const fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub const fn core(&self) -> &Core<C> {
        &self.core
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Adds a tool to the shared registry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Schema`] if the tool's definition is malformed.
    pub fn register_tool(&self, tool: Arc<dyn ToolImplementation>) -> Result<(), CoreError> {
        Ok(self.core.registry.register(tool)?)
    }

    fn push_user(&mut self, message: String) -> Result<(), CoreError> {
        let message = self.conversation.user_message(message);
        self.conversation.add_message(message)?;
        Ok(())
    }

    /// Sends `message` and returns the model's final answer.
    ///
    /// # Errors
    ///
    /// Returns the [`CoreError`] that ended the run. Tool failures are not
    /// errors; the model sees them and answers anyway.
    pub async fn chat(
        &mut self,
        message: impl Into<String>,
        use_tools: bool,
    ) -> Result<String, CoreError> {
        self.push_user(message.into())?;
        let reply = self
            .core
            .run(&mut self.conversation, use_tools, &self.cancel)
            .await?;
        Ok(reply.content)
    }

    /// Sends `message` and streams the run as classified chunks.
    ///
    /// # Errors
    ///
    /// Fails before streaming if the message cannot be appended.
    pub fn chat_stream(
        &mut self,
        message: impl Into<String>,
        use_tools: bool,
    ) -> Result<ChunkStream<'_>, CoreError> {
        self.push_user(message.into())?;
        Ok(self
            .core
            .run_stream(&mut self.conversation, use_tools, self.cancel.clone()))
    }

    /// Answers `message` as text or as a stream, per `options`.
    ///
    /// # Errors
    ///
    /// See [`Agent::chat`] and [`Agent::chat_stream`].
    pub async fn respond(
        &mut self,
        message: impl Into<String>,
        options: ChatOptions,
    ) -> Result<Reply<'_>, CoreError> {
        if options.stream {
            self.chat_stream(message, options.use_tools).map(Reply::Stream)
        } else {
            self.chat(message, options.use_tools).await.map(Reply::Text)
        }
    }

    /// Drops the history, keeping only the system prompt.
    pub fn reset_conversation(&mut self) {
        info!(
            "Resetting conversation {} ({} messages)",
            self.conversation.id,
            self.conversation.len()
        );
        self.conversation.reset_to_system();
    }
}
