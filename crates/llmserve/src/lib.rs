//! # llmserve
//!
//! Tool-calling orchestration for conversational language models.
//!
//! A [`Core`] sends the conversation to a backend ([`LLMClient`]), executes the
//! tools the model asks for through a [`ToolRegistry`], feeds the results back
//! and repeats until the model answers. [`Agent`] wraps a `Core` with a
//! conversation and the `chat` / `reset_conversation` surface.
//!
//! ## Quick Start
//!
//! The example runs against `testing::ScriptedClient`, an in-memory
//! backend available with the `test-utils` feature; real programs
//! use [`OpenAIClient`].
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use llmserve::testing::ScriptedClient;
//! use llmserve::{Agent, ToolCall, ToolRegistry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), llmserve::CoreError> {
//! let registry = Arc::new(ToolRegistry::with_defaults()?);
//! let client = ScriptedClient::new()
//!     .reply_tool_calls(vec![ToolCall::new("get_current_time", r#"{"timezone":"JST"}"#)])
//!     .reply("It is evening in Tokyo.");
//!
//! let mut agent = Agent::new(client, registry);
//! let answer = agent.chat("What time is it in Tokyo?", true).await?;
//! assert_eq!(answer, "It is evening in Tokyo.");
//! # Ok(())
//! # }
//! ```
//!
//! ## Streaming
//!
//! [`Agent::chat_stream`] yields [`StreamChunk`]s in a fixed order per round:
//! thinking, then tool calls and their results, then answer content, and a
//! final [`StreamChunk::Done`]. When tools are offered, a round's content is
//! released once the round is known to request none.

pub mod agent;
pub mod classifier;
pub mod core;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use llmserve_client::*;
pub use llmserve_common::*;
pub use llmserve_tools::*;

pub use agent::{Agent, ChatOptions, DEFAULT_SYSTEM_PROMPT, Reply};
pub use classifier::{Fragment, StreamClassifier};
pub use core::{ChunkStream, Core, CoreConfig, LoopState};
pub use error::{CoreError, ErrorKind};
