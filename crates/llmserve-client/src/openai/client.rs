//! OpenAI-compatible client implementation.
//!
//! Talks to any server implementing `/chat/completions`; the default
//! [`Config`] points it at a local Ollama instance.
//!
//! # Features
//!
//! - **Chat Completions**: unary requests through `reqwest-middleware` with
//!   exponential backoff and `Retry-After` support
//! - **Streaming**: server-sent events via `reqwest-eventsource`, with
//!   reasoning, content and tool-call deltas mapped onto [`ChatChunk`]
//! - **Optional API key**: local servers need none; hosted ones get a bearer
//!   token held in a `SecretString`
//!
//! # Examples
//!
//! ```no_run
//! use llmserve_client::{LLMClient, OpenAIClient};
//! use llmserve_common::chat::Conversation;
//! use llmserve_common::client::Config;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = OpenAIClient::new(Config::ollama("qwen3:0.6b"))?;
//!
//! let mut conversation = Conversation::with_system_prompt("You are a helpful assistant");
//! conversation.add_message(conversation.user_message("Hello!"))?;
//!
//! let request = client.config().chat_request(conversation.get_messages().to_vec());
//! let response = client.chat(&request).await?;
//! println!("Response: {}", response.message.content);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use log::{debug, error, warn};
use reqwest_eventsource::{Event, EventSource};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use reqwest_retry_after::RetryAfterMiddleware;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use llmserve_common::chat::Message;
use llmserve_common::client::{
    ChatChunk, ChatRequest, ChatResponse, Config, DEFAULT_OLLAMA_HOST, DEFAULT_OLLAMA_PORT,
    ollama_base_url,
};

use crate::error::{ClientError, ErrorResponse};
use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, OpenAIMessage,
    normalize_tool_calls,
};
use crate::{ChatStream, LLMClient, NoRetryPolicy};

const COMPLETIONS_ENDPOINT: &str = "chat/completions";

/// Client for OpenAI-compatible APIs.
#[derive(Clone)]
pub struct OpenAIClient {
    client: ClientWithMiddleware,
    streaming_client: reqwest::Client,
    api_key: Option<Arc<SecretString>>,
    base_url: String,
    config: Arc<Config>,
}

impl std::fmt::Debug for OpenAIClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Convert a streaming chunk to the common [`ChatChunk`] format.
pub fn convert_chunk_to_chat_chunk(chunk: &ChatCompletionChunk) -> ChatChunk {
    let choice = chunk.choices.first();
    let delta = choice.map(|c| &c.delta);

    let delta_reasoning = delta
        .and_then(|d| d.reasoning.clone().or_else(|| d.reasoning_content.clone()))
        .filter(|text| !text.is_empty());

    let delta_tool_calls = delta
        .and_then(|d| d.tool_calls.as_ref())
        .map(|deltas| deltas.iter().map(Into::into).collect());

    ChatChunk {
        model: chunk.model.clone(),
        delta_content: delta.and_then(|d| d.content.clone()),
        delta_reasoning,
        delta_role: delta.and_then(|d| d.role),
        delta_tool_calls,
        finish_reason: choice
            .and_then(|c| c.finish_reason.as_ref())
            .and_then(|reason| reason.parse().ok()),
        usage: chunk.usage,
        response_id: (!chunk.id.is_empty()).then(|| chunk.id.clone()),
        created_at: timestamp(chunk.created),
    }
}

fn timestamp(created: u64) -> DateTime<Utc> {
    i64::try_from(created)
        .ok()
        .filter(|secs| *secs > 0)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

impl OpenAIClient {
    /// Create a new client from a configuration.
    ///
    /// Without a base URL the client targets the default local Ollama server.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| ollama_base_url(DEFAULT_OLLAMA_HOST, DEFAULT_OLLAMA_PORT));
        let base_url = base_url.trim_end_matches('/').to_string();

        url::Url::parse(&base_url).map_err(|e| {
            ClientError::ConfigurationError(format!("Invalid base URL '{base_url}': {e}"))
        })?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(
                config.retry_config.initial_delay,
                config.retry_config.max_delay,
            )
            .build_with_max_retries(
                u32::try_from(config.retry_config.max_retries).unwrap_or(u32::MAX),
            );

        // No timeout by default: small local models on slow hardware can take minutes.
        let reqwest_client = match config.timeout_seconds {
            Some(timeout) => reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout))
                .build()?,
            None => reqwest::Client::builder().build()?,
        };

        // RetryAfterMiddleware must run before RetryTransientMiddleware.
        let client = reqwest_middleware::ClientBuilder::new(reqwest_client.clone())
            .with(RetryAfterMiddleware::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        debug!(
            "Created {} client for model '{}' at {base_url}",
            config.provider, config.model
        );

        Ok(Self {
            client,
            streaming_client: reqwest_client,
            api_key: config.api_key.clone().map(Arc::new),
            base_url,
            config: Arc::new(config),
        })
    }

    /// Set the model to use for chat completions.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).model = model.into();
        self
    }

    /// The API root this client posts to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    fn authorize<B: Authorize>(&self, builder: B) -> B {
        match &self.api_key {
            Some(key) => builder.bearer(key.expose_secret()),
            None => builder,
        }
    }

    async fn make_request<T: for<'de> Deserialize<'de>, B: Serialize + Sync>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = self.endpoint(endpoint);
        let request_builder = self
            .authorize(self.client.post(&url))
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(body)?);

        let response = request_builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.map_err(|e| {
                warn!("Failed to read error response body: {e}");
                ClientError::NetworkError(e)
            })?;

            let error_message = match serde_json::from_str::<ErrorResponse>(&error_text) {
                Ok(parsed) => parsed.error.message().to_string(),
                Err(parse_err) => {
                    debug!("Error body is not structured JSON ({parse_err}), using raw text");
                    error_text
                }
            };

            error!(
                "API request failed with status {}: {error_message}",
                status.as_u16()
            );
            return Err(ClientError::from_status(status, error_message));
        }

        let response_text = response.text().await?;
        debug!("Raw API response: {response_text}");
        Ok(serde_json::from_str(&response_text)?)
    }

    fn convert_message(openai_msg: &OpenAIMessage, conversation_id: uuid::Uuid) -> Message {
        let mut message = Message::new(
            conversation_id,
            openai_msg.role,
            openai_msg.content.clone().unwrap_or_default(),
        );
        if let Some(calls) = &openai_msg.tool_calls {
            // Arguments are passed through unvalidated; the tool registry checks them.
            message.tool_calls = normalize_tool_calls(calls);
        }
        if let Some(reasoning) = openai_msg.reasoning_text() {
            message = message.with_reasoning(reasoning);
        }
        message
    }
}

/// Adds a bearer token to either flavour of request builder.
trait Authorize {
    fn bearer(self, token: &str) -> Self;
}

impl Authorize for reqwest_middleware::RequestBuilder {
    fn bearer(self, token: &str) -> Self {
        self.bearer_auth(token)
    }
}

impl Authorize for reqwest::RequestBuilder {
    fn bearer(self, token: &str) -> Self {
        self.bearer_auth(token)
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    fn config(&self) -> &Config {
        &self.config
    }

    fn supports_tools(&self) -> bool {
        true
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.validate_request(request)?;

        let mut openai_request = ChatCompletionRequest::from((request, self.config.as_ref()));
        openai_request.stream = false;

        let response: ChatCompletionResponse = self
            .make_request(COMPLETIONS_ENDPOINT, &openai_request)
            .await?;

        let choice = response.choices.first().ok_or_else(|| {
            warn!(
                "Received empty choices array. Response ID: {}, Model: {}",
                response.id, response.model
            );
            ClientError::InvalidResponse("API returned no choices in response".to_string())
        })?;

        let conversation_id = request
            .messages
            .first()
            .ok_or_else(|| {
                ClientError::InvalidRequest("Request must contain at least one message".to_string())
            })?
            .conversation_id;

        Ok(ChatResponse {
            message: Self::convert_message(&choice.message, conversation_id),
            model: response.model,
            usage: response.usage,
            finish_reason: choice
                .finish_reason
                .as_ref()
                .and_then(|reason| reason.parse().ok()),
            created_at: timestamp(response.created),
            response_id: Some(response.id),
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        self.validate_request(request)?;

        let mut openai_request = ChatCompletionRequest::from((request, self.config.as_ref()));
        openai_request.stream = true;
        openai_request.stream_options = Some(serde_json::json!({ "include_usage": true }));

        // The streaming client has no retry middleware: a half-read stream cannot be replayed.
        let request_builder = self
            .authorize(self.streaming_client.post(self.endpoint(COMPLETIONS_ENDPOINT)))
            .json(&openai_request);

        let mut event_source = EventSource::new(request_builder).map_err(|e| {
            ClientError::ConfigurationError(format!("Failed to create event source: {e}"))
        })?;
        event_source.set_retry_policy(Box::new(NoRetryPolicy));

        let stream = event_source
            .take_while(|event| {
                let done = matches!(
                    event,
                    Err(reqwest_eventsource::Error::StreamEnded)
                ) || matches!(event, Ok(Event::Message(m)) if m.data.trim() == "[DONE]");
                futures::future::ready(!done)
            })
            .filter_map(|event| async move {
                match event {
                    Ok(Event::Open) => {
                        debug!("Stream connection opened");
                        None
                    }
                    Ok(Event::Message(message)) => {
                        match serde_json::from_str::<ChatCompletionChunk>(&message.data) {
                            Ok(chunk) => Some(Ok(convert_chunk_to_chat_chunk(&chunk))),
                            Err(e) => {
                                warn!("Failed to parse streaming chunk: {e}");
                                debug!("Problematic chunk data: {}", message.data);
                                Some(Err(ClientError::SerializationError(e).into()))
                            }
                        }
                    }
                    Err(e) => {
                        let err = ClientError::from(e);
                        error!("Stream error: {err}");
                        Some(Err(err.into()))
                    }
                }
            });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use llmserve_common::client::FinishReason;
    use llmserve_common::{Parameters, Property, Tool};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> Config {
        Config::ollama("qwen3:0.6b").with_base_url(base_url)
    }

    fn no_retry_config(base_url: &str) -> Config {
        let mut config = test_config(base_url);
        config.retry_config.max_retries = 0;
        config
    }

    fn test_request() -> ChatRequest {
        ChatRequest::new(vec![Message::user(uuid::Uuid::new_v4(), "Hello")])
    }

    fn sse_body(events: &[serde_json::Value]) -> String {
        let mut body = String::new();
        for event in events {
            body.push_str("data: ");
            body.push_str(&event.to_string());
            body.push_str("\n\n");
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn delta_chunk(delta: serde_json::Value, finish_reason: Option<&str>) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1_700_000_000,
            "model": "qwen3:0.6b",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
        })
    }

    #[tokio::test]
    async fn test_successful_chat_completion_without_api_key() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"model": "qwen3:0.6b", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-123",
                "object": "chat.completion",
                "created": 1_677_652_288,
                "model": "qwen3:0.6b",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello there!", "reasoning": "greet back"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = OpenAIClient::new(test_config(&mock_server.uri())).unwrap();
        let request = test_request();
        let response = client.chat(&request).await.unwrap();

        assert_eq!(response.message.content, "Hello there!");
        assert_eq!(response.message.reasoning.as_deref(), Some("greet back"));
        assert_eq!(
            response.message.conversation_id,
            request.messages[0].conversation_id
        );
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
        assert_eq!(response.usage.unwrap().total_tokens, 12);
    }

    #[tokio::test]
    async fn test_api_key_sent_as_bearer() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "x",
                "model": "m",
                "choices": [{"message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = test_config(&mock_server.uri()).with_api_key("test-key");
        let client = OpenAIClient::new(config).unwrap();
        assert!(client.chat(&test_request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_chat_completion_with_tool_calls() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({
                "tools": [{"type": "function", "function": {"name": "get_current_temperature"}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-tools",
                "created": 1_677_652_288,
                "model": "qwen3:0.6b",
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": "",
                        "tool_calls": [{
                            "id": "call_abc",
                            "type": "function",
                            "function": {"name": "get_current_temperature", "arguments": "{\"location\":\"Tokyo\"}"}
                        }, {
                            "function": {"name": "get_current_time", "arguments": {"timezone": "JST"}}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .mount(&mock_server)
            .await;

        let tool = Tool::function(
            "get_current_temperature",
            "Get the temperature",
            Parameters::from_fields([("location", Property::string("City"), true)]),
        );
        let client = OpenAIClient::new(test_config(&mock_server.uri())).unwrap();
        let response = client
            .chat(&test_request().with_tools(vec![tool]))
            .await
            .unwrap();

        let calls = &response.message.tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].function.arguments, r#"{"location":"Tokyo"}"#);
        assert!(calls[1].id.starts_with("call_"));
        assert_eq!(calls[1].function.arguments, r#"{"timezone":"JST"}"#);
        assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));
    }

    #[tokio::test]
    async fn test_empty_choices_is_protocol_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "x", "model": "m", "choices": []
            })))
            .mount(&mock_server)
            .await;

        let client = OpenAIClient::new(test_config(&mock_server.uri())).unwrap();
        let err = client.chat(&test_request()).await.unwrap_err();
        let client_err = err.downcast_ref::<ClientError>().unwrap();
        assert!(matches!(client_err, ClientError::InvalidResponse(_)));
        assert!(client_err.is_protocol());
    }

    #[tokio::test]
    async fn test_malformed_body_is_protocol_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let client = OpenAIClient::new(test_config(&mock_server.uri())).unwrap();
        let err = client.chat(&test_request()).await.unwrap_err();
        assert!(err.downcast_ref::<ClientError>().unwrap().is_protocol());
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "loading model"})))
            .mount(&mock_server)
            .await;

        let client = OpenAIClient::new(no_retry_config(&mock_server.uri())).unwrap();
        let err = client.chat(&test_request()).await.unwrap_err();
        let client_err = err.downcast_ref::<ClientError>().unwrap();
        assert!(matches!(client_err, ClientError::ServiceUnavailable(_)));
        assert!(client_err.is_unavailable());
    }

    #[tokio::test]
    async fn test_model_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(json!({"error": {"message": "model \"nope\" not found"}})),
            )
            .mount(&mock_server)
            .await;

        let client = OpenAIClient::new(test_config(&mock_server.uri())).unwrap();
        let err = client.chat(&test_request()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>().unwrap(),
            ClientError::RequestError { status: 404, message } if message.contains("not found")
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let client = OpenAIClient::new(no_retry_config("http://127.0.0.1:9")).unwrap();
        let err = client.chat(&test_request()).await.unwrap_err();
        assert!(err.downcast_ref::<ClientError>().unwrap().is_unavailable());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let err = OpenAIClient::new(test_config("not a url")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>().unwrap(),
            ClientError::ConfigurationError(_)
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let client = OpenAIClient::new(test_config("http://localhost:11434/v1").with_api_key("sk-secret"))
            .unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_streaming_maps_reasoning_content_and_tool_calls() {
        let mock_server = MockServer::start().await;

        let body = sse_body(&[
            delta_chunk(json!({"role": "assistant", "reasoning": "Need weather."}), None),
            delta_chunk(
                json!({"tool_calls": [{"index": 0, "id": "call_1", "type": "function",
                    "function": {"name": "get_current_temperature", "arguments": "{\"loc"}}]}),
                None,
            ),
            delta_chunk(
                json!({"tool_calls": [{"index": 0, "function": {"arguments": "ation\":\"Tokyo\"}"}}]}),
                None,
            ),
            delta_chunk(json!({}), Some("tool_calls")),
        ]);

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&mock_server)
            .await;

        let client = OpenAIClient::new(test_config(&mock_server.uri())).unwrap();
        let stream = client
            .chat_stream(&test_request().with_streaming(true))
            .await
            .unwrap();
        let chunks: Vec<ChatChunk> = stream.map(|c| c.unwrap()).collect().await;

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].delta_reasoning.as_deref(), Some("Need weather."));
        let first = &chunks[1].delta_tool_calls.as_ref().unwrap()[0];
        assert_eq!(first.id.as_deref(), Some("call_1"));
        assert_eq!(first.name.as_deref(), Some("get_current_temperature"));
        let second = &chunks[2].delta_tool_calls.as_ref().unwrap()[0];
        assert_eq!(second.index, Some(0));
        assert!(second.id.is_none());
        assert_eq!(second.arguments.as_deref(), Some("ation\":\"Tokyo\"}"));
        assert_eq!(chunks[3].finish_reason, Some(FinishReason::ToolCalls));
    }

    #[tokio::test]
    async fn test_streaming_bad_chunk_is_protocol_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: {not json}\n\ndata: [DONE]\n\n", "text/event-stream"),
            )
            .mount(&mock_server)
            .await;

        let client = OpenAIClient::new(test_config(&mock_server.uri())).unwrap();
        let stream = client
            .chat_stream(&test_request().with_streaming(true))
            .await
            .unwrap();
        let results: Vec<Result<ChatChunk>> = stream.collect().await;

        assert_eq!(results.len(), 1);
        let err = results[0].as_ref().unwrap_err();
        assert!(err.downcast_ref::<ClientError>().unwrap().is_protocol());
    }
}
