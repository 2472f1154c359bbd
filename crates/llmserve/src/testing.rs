//! An in-memory backend that replays a script.
//!
//! [`ScriptedClient`] answers each backend call with the next step of its
//! script and records every request it receives. It is meant for tests that
//! exercise the orchestration loop without a model server, and is only built
//! with the `test-utils` feature.
//!
//! ```
//! use llmserve::testing::ScriptedClient;
//! use llmserve_common::ToolCall;
//!
//! let client = ScriptedClient::new()
//!     .reply_tool_calls(vec![ToolCall::new("get_current_time", r#"{"timezone":"JST"}"#)])
//!     .reply("It is noon in Tokyo.");
//! assert_eq!(client.remaining(), 2);
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use llmserve_client::{ChatStream, ClientError, LLMClient};
use llmserve_common::{
    ChatChunk, ChatRequest, ChatResponse, Config, FinishReason, Message, ToolCall, ToolCallDelta,
};

const SCRIPTED_MODEL: &str = "scripted";

#[derive(Debug)]
enum Step {
    Reply(Message),
    Stream(Vec<Result<ChatChunk, ClientError>>),
    Fail(ClientError),
}

/// A backend that replays canned replies, fragment sequences and failures.
///
/// Steps are consumed in order by both [`LLMClient::chat`] and
/// [`LLMClient::chat_stream`]. A reply step asked for as a stream is delivered
/// as a single fragment, and a stream step asked for as a reply is collapsed
/// into one message. An exhausted script fails with a protocol error.
#[derive(Debug)]
pub struct ScriptedClient {
    config: Config,
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ChatRequest>>,
    latency: Option<Duration>,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: Config::new("scripted", SCRIPTED_MODEL),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Delays every call, to exercise deadlines and cancellation.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn push(self, step: Step) -> Self {
        lock(&self.script).push_back(step);
        self
    }

    /// Queues a plain text answer.
    #[must_use]
    pub fn reply(self, content: impl Into<String>) -> Self {
        self.reply_message(Message::assistant(Uuid::nil(), content))
    }

    /// Queues an assistant message as-is.
    #[must_use]
    pub fn reply_message(self, message: Message) -> Self {
        self.push(Step::Reply(message))
    }

    /// Queues an answer that requests `calls` and has no text.
    #[must_use]
    pub fn reply_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        let mut message = Message::assistant(Uuid::nil(), "");
        message.tool_calls = calls.into();
        self.push(Step::Reply(message))
    }

    /// Queues a streamed turn made of `chunks`.
    #[must_use]
    pub fn stream(self, chunks: Vec<ChatChunk>) -> Self {
        self.push(Step::Stream(chunks.into_iter().map(Ok).collect()))
    }

    /// Queues a streamed turn whose fragments may fail part-way.
    #[must_use]
    pub fn stream_results(self, items: Vec<Result<ChatChunk, ClientError>>) -> Self {
        self.push(Step::Stream(items))
    }

    /// Queues a streamed turn of plain text fragments.
    #[must_use]
    pub fn stream_text(self, fragments: &[&str]) -> Self {
        let mut chunks: Vec<ChatChunk> = fragments
            .iter()
            .map(|text| ChatChunk::new(SCRIPTED_MODEL).with_content(*text))
            .collect();
        chunks.push(ChatChunk::new(SCRIPTED_MODEL).with_finish_reason(FinishReason::Stop));
        self.stream(chunks)
    }

    /// Queues a failed call.
    #[must_use]
    pub fn fail(self, error: ClientError) -> Self {
        self.push(Step::Fail(error))
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    /// Steps not yet consumed.
    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }

    async fn next_step(&self, request: &ChatRequest) -> Result<Step> {
        lock(&self.requests).push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let step = lock(&self.script).pop_front();
        match step {
            Some(Step::Fail(error)) => Err(error.into()),
            Some(step) => Ok(step),
            None => Err(ClientError::InvalidResponse("script exhausted".to_string()).into()),
        }
    }
}

/// Splits a complete message into stream fragments, one per part.
fn message_chunks(message: Message) -> Vec<Result<ChatChunk, ClientError>> {
    let mut chunks = Vec::new();
    if let Some(reasoning) = message.reasoning {
        chunks.push(Ok(ChatChunk::new(SCRIPTED_MODEL).with_reasoning(reasoning)));
    }
    if !message.content.is_empty() {
        chunks.push(Ok(ChatChunk::new(SCRIPTED_MODEL).with_content(message.content)));
    }
    let finish = if message.tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolCalls
    };
    for (index, call) in (0u32..).zip(message.tool_calls) {
        chunks.push(Ok(ChatChunk::new(SCRIPTED_MODEL).with_tool_calls(vec![ToolCallDelta {
            index: Some(index),
            id: Some(call.id),
            name: Some(call.function.name),
            arguments: Some(call.function.arguments),
        }])));
    }
    chunks.push(Ok(ChatChunk::new(SCRIPTED_MODEL).with_finish_reason(finish)));
    chunks
}

/// Collapses a streamed turn into one message; tool call deltas are merged by index.
fn collapse(chunks: Vec<Result<ChatChunk, ClientError>>) -> Result<Message> {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut calls: Vec<ToolCall> = Vec::new();

    for chunk in chunks {
        let chunk = chunk?;
        content.push_str(chunk.delta_content.as_deref().unwrap_or_default());
        reasoning.push_str(chunk.delta_reasoning.as_deref().unwrap_or_default());
        for delta in chunk.delta_tool_calls.unwrap_or_default() {
            let index = delta
                .index
                .and_then(|i| usize::try_from(i).ok())
                .unwrap_or(calls.len());
            if index >= calls.len() {
                calls.push(ToolCall::with_id(
                    delta.id.unwrap_or_default(),
                    delta.name.unwrap_or_default(),
                    delta.arguments.unwrap_or_default(),
                ));
            } else {
                calls[index]
                    .function
                    .arguments
                    .push_str(delta.arguments.as_deref().unwrap_or_default());
            }
        }
    }

    let mut message = Message::assistant(Uuid::nil(), content).with_reasoning(reasoning);
    message.tool_calls = calls.into();
    Ok(message)
}

#[async_trait]
impl LLMClient for ScriptedClient {
    fn config(&self) -> &Config {
        &self.config
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.validate_request(request)?;
        let mut message = match self.next_step(request).await? {
            Step::Reply(message) => message,
            Step::Stream(chunks) => collapse(chunks)?,
            Step::Fail(error) => return Err(error.into()),
        };
        if let Some(first) = request.messages.first() {
            message.conversation_id = first.conversation_id;
        }

        let finish_reason = Some(if message.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });
        Ok(ChatResponse {
            message,
            model: SCRIPTED_MODEL.to_string(),
            usage: None,
            finish_reason,
            created_at: Utc::now(),
            response_id: None,
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        self.validate_request(request)?;
        let items = match self.next_step(request).await? {
            Step::Reply(message) => message_chunks(message),
            Step::Stream(items) => items,
            Step::Fail(error) => return Err(error.into()),
        };
        let items = items.into_iter().map(|item| item.map_err(anyhow::Error::from));
        Ok(Box::pin(futures::stream::iter(items)))
    }

    fn supports_tools(&self) -> bool {
        true
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}
