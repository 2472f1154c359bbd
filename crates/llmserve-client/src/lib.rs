//! # llmserve-client
//!
//! Backend adapters for text-generation services.
//!
//! Every backend implements [`LLMClient`], which offers a complete reply
//! ([`LLMClient::chat`]) or a lazy stream of raw fragments
//! ([`LLMClient::chat_stream`]). The orchestration layer only depends on
//! this trait, so backends are chosen once at construction.
//!
//! [`OpenAIClient`] speaks the OpenAI-compatible `/chat/completions` API and
//! targets a local Ollama server by default.
//!
//! ## Example
//!
//! ```no_run
//! use llmserve_client::{LLMClient, OpenAIClient};
//! use llmserve_common::{Config, Message};
//! use uuid::Uuid;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = OpenAIClient::new(Config::ollama("qwen3:0.6b"))?;
//!
//! let message = Message::user(Uuid::new_v4(), "Hello!");
//! let request = client.config().chat_request(vec![message]);
//!
//! let response = client.chat(&request).await?;
//! println!("{}", response.message.content);
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use reqwest_eventsource::retry::RetryPolicy;

use llmserve_common::{ChatChunk, ChatRequest, ChatResponse, Config};

pub mod error;
pub mod openai;

pub use error::ClientError;
pub use openai::OpenAIClient;

/// A lazy, finite stream of raw reply fragments.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// Disables `reqwest-eventsource` reconnects.
///
/// A streamed turn cannot be resumed, so retries happen above the adapter.
pub(crate) struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn retry(
        &self,
        _error: &reqwest_eventsource::Error,
        _last_retry: Option<(usize, Duration)>,
    ) -> Option<Duration> {
        None
    }

    fn set_reconnection_time(&mut self, _duration: Duration) {}
}

/// A text-generation backend.
///
/// Errors returned by implementations should wrap a [`ClientError`] so callers
/// can tell unavailable backends from protocol mismatches with
/// `err.downcast_ref::<ClientError>()`.
#[must_use = "LLMClient must be used to make requests"]
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// The configuration this client was built with.
    fn config(&self) -> &Config;

    /// Requests one complete assistant turn.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid, the backend cannot be
    /// reached, or its reply cannot be parsed.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Requests one assistant turn as a stream of fragments.
    ///
    /// The returned stream ends after the backend's end-of-turn marker.
    /// Dropping it closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or the stream cannot be opened.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream>;

    /// Whether tool schemas can be sent to this backend.
    fn supports_tools(&self) -> bool;

    /// Whether [`LLMClient::chat_stream`] is available.
    fn supports_streaming(&self) -> bool;

    /// Checks that sampling defaults are in range.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    fn validate_config(&self, config: &Config) -> Result<()> {
        if config
            .temperature
            .is_some_and(|t| !(0.0..=2.0).contains(&t))
        {
            return Err(ClientError::InvalidTemperature.into());
        }

        if config.top_p.is_some_and(|p| !(0.0..=1.0).contains(&p)) {
            return Err(ClientError::InvalidTopP.into());
        }

        Ok(())
    }

    /// Checks a request before it is sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the request has no messages, is out of range, or
    /// asks for tools or streaming this client does not support.
    fn validate_request(&self, request: &ChatRequest) -> Result<()> {
        request
            .validate()
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

        if !self.supports_tools() && request.has_tools() {
            return Err(ClientError::ToolsNotSupported.into());
        }

        if !self.supports_streaming() && request.stream {
            return Err(ClientError::StreamingNotSupported.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use futures::StreamExt;
    use llmserve_common::{Message, Parameters, Property, Tool};
    use uuid::Uuid;

    struct MockLLMClient {
        config: Config,
        supports_tools: bool,
        supports_streaming: bool,
    }

    impl MockLLMClient {
        fn new() -> Self {
            Self {
                config: Config::new("mock", "mock-model"),
                supports_tools: true,
                supports_streaming: true,
            }
        }

        fn without_tools() -> Self {
            Self {
                supports_tools: false,
                ..Self::new()
            }
        }

        fn without_streaming() -> Self {
            Self {
                supports_streaming: false,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl LLMClient for MockLLMClient {
        fn config(&self) -> &Config {
            &self.config
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            self.validate_request(request)?;
            Ok(ChatResponse {
                message: Message::assistant(request.messages[0].conversation_id, "pong"),
                model: "mock-model".to_string(),
                usage: None,
                finish_reason: None,
                created_at: chrono::Utc::now(),
                response_id: Some("test-response".to_string()),
            })
        }

        async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
            self.validate_request(request)?;
            let chunks = vec![
                Ok(ChatChunk::new("mock-model").with_content("po")),
                Ok(ChatChunk::new("mock-model").with_content("ng")),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        fn supports_tools(&self) -> bool {
            self.supports_tools
        }

        fn supports_streaming(&self) -> bool {
            self.supports_streaming
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![Message::user(Uuid::new_v4(), "ping")])
    }

    fn test_tool() -> Tool {
        Tool::function(
            "test_function",
            "A test function",
            Parameters::from_fields([("arg", Property::string("A test argument"), true)]),
        )
    }

    #[test]
    fn test_validate_request_empty_messages() {
        let client = MockLLMClient::new();
        let err = client
            .validate_request(&ChatRequest::new(Vec::<Message>::new()))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>().unwrap(),
            ClientError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_validate_request_tools_not_supported() {
        let request = request().with_tools(vec![test_tool()]);

        let err = MockLLMClient::without_tools()
            .validate_request(&request)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>().unwrap(),
            ClientError::ToolsNotSupported
        ));
        assert!(MockLLMClient::new().validate_request(&request).is_ok());
    }

    #[test]
    fn test_validate_request_streaming_not_supported() {
        let request = request().with_streaming(true);

        let err = MockLLMClient::without_streaming()
            .validate_request(&request)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>().unwrap(),
            ClientError::StreamingNotSupported
        ));
        assert!(MockLLMClient::new().validate_request(&request).is_ok());
    }

    #[test]
    fn test_validate_config() {
        let client = MockLLMClient::new();
        assert!(client.validate_config(&Config::ollama("m")).is_ok());

        let err = client
            .validate_config(&Config::ollama("m").with_top_p(1.5))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>().unwrap(),
            ClientError::InvalidTopP
        ));
    }

    #[tokio::test]
    async fn test_chat_and_stream_through_trait_object() {
        let client: Box<dyn LLMClient> = Box::new(MockLLMClient::new());

        let response = client.chat(&request()).await.unwrap();
        assert_eq!(response.message.content, "pong");

        let stream = client.chat_stream(&request().with_streaming(true)).await.unwrap();
        let text: String = stream
            .filter_map(|chunk| async move { chunk.ok().and_then(|c| c.delta_content) })
            .collect()
            .await;
        assert_eq!(text, "pong");
    }
}
