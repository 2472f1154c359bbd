use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::chat::{Message, MessageRole};
use crate::tools::Tool;

/// Default model served by a local Ollama instance.
pub const DEFAULT_MODEL: &str = "qwen3:0.6b";
/// Default Ollama host.
pub const DEFAULT_OLLAMA_HOST: &str = "localhost";
/// Default Ollama port.
pub const DEFAULT_OLLAMA_PORT: u16 = 11434;

/// Controls how the model selects which tool to call, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ToolChoice {
    /// The model decides whether to call a tool.
    #[serde(rename = "auto")]
    Auto,
    /// Tool calling is disabled for this request.
    #[serde(rename = "none")]
    None,
    /// The model must call at least one tool.
    #[serde(rename = "required")]
    Required,
    /// Force a specific function by name.
    Function {
        /// The name of the function to call
        name: String,
    },
}

impl From<ToolChoice> for serde_json::Value {
    fn from(tool_choice: ToolChoice) -> Self {
        match tool_choice {
            ToolChoice::Auto => Self::from("auto"),
            ToolChoice::None => Self::from("none"),
            ToolChoice::Required => Self::from("required"),
            ToolChoice::Function { name } => serde_json::json!({
                "type": "function",
                "function": { "name": name }
            }),
        }
    }
}

/// Indicates why the model stopped generating tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FinishReason {
    /// Natural end of the reply.
    Stop,
    /// The token limit was reached.
    Length,
    /// The model requested tool calls.
    ToolCalls,
    /// The provider's content filter stopped generation.
    ContentFilter,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
        };
        f.write_str(label)
    }
}

impl FromStr for FinishReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" | "end_turn" => Ok(Self::Stop),
            "length" | "max_tokens" => Ok(Self::Length),
            "tool_calls" | "function_call" => Ok(Self::ToolCalls),
            "content_filter" => Ok(Self::ContentFilter),
            _ => anyhow::bail!("Unknown finish reason: {s}"),
        }
    }
}

/// Exponential backoff settings for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts before failing.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between retries.
    pub max_delay: Duration,
    /// Growth factor applied after each attempt.
    pub backoff_multiplier: f64,
    /// Add random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(alias = "input_tokens")]
    pub prompt_tokens: u32,
    /// Tokens generated.
    #[serde(alias = "output_tokens")]
    pub completion_tokens: u32,
    /// Sum of the two.
    pub total_tokens: u32,
}

/// A request for one assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The conversation sent to the model.
    pub messages: Arc<[Message]>,
    /// Model identifier.
    pub model: Option<String>,
    /// Sampling temperature (0.0 to 2.0).
    pub temperature: Option<f32>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Nucleus sampling threshold (0.0 to 1.0).
    pub top_p: Option<f32>,
    /// Stop sequences.
    pub stop: Option<Vec<String>>,
    /// Tools advertised to the model.
    pub tools: Option<Vec<Tool>>,
    /// Tool selection strategy.
    pub tool_choice: Option<ToolChoice>,
    /// Whether the reply is streamed.
    pub stream: bool,
}

impl ChatRequest {
    /// Creates a request with no sampling overrides.
    pub fn new(messages: impl Into<Arc<[Message]>>) -> Self {
        Self {
            messages: messages.into(),
            model: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            stream: false,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Advertises tools. An empty list clears them.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = if tools.is_empty() { None } else { Some(tools) };
        self
    }

    #[must_use]
    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }

    #[must_use]
    pub const fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Checks the request has messages and its sampling parameters are in range.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.messages.is_empty() {
            anyhow::bail!("Chat request must have at least one message");
        }
        validate_sampling(self.temperature, self.top_p)
    }

    /// Returns true if tools are present and non-empty.
    #[must_use]
    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }
}

fn validate_sampling(temperature: Option<f32>, top_p: Option<f32>) -> anyhow::Result<()> {
    if let Some(temp) = temperature
        && !(0.0..=2.0).contains(&temp)
    {
        anyhow::bail!("Temperature must be between 0.0 and 2.0, got {temp}");
    }
    if let Some(top_p) = top_p
        && !(0.0..=1.0).contains(&top_p)
    {
        anyhow::bail!("top_p must be between 0.0 and 1.0, got {top_p}");
    }
    Ok(())
}

/// A complete, non-streamed assistant reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The assistant message, possibly carrying tool calls.
    pub message: Message,
    /// Model that produced the reply.
    pub model: String,
    /// Token usage, if reported.
    pub usage: Option<Usage>,
    /// Why generation stopped.
    pub finish_reason: Option<FinishReason>,
    /// When the reply was received.
    pub created_at: DateTime<Utc>,
    /// Provider-side identifier.
    pub response_id: Option<String>,
}

/// One incremental piece of a tool call in a streamed reply.
///
/// The first delta of a call normally carries `id` and `name`; later deltas
/// usually carry only `index` and an `arguments` fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Position of the call within the assistant turn.
    pub index: Option<u32>,
    /// Call identifier, when present.
    pub id: Option<String>,
    /// Function name, when present.
    pub name: Option<String>,
    /// Fragment of the JSON argument text.
    pub arguments: Option<String>,
}

/// A raw fragment of a streamed reply, as produced by the backend adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Model that produced the chunk.
    pub model: String,
    /// Incremental reply text.
    pub delta_content: Option<String>,
    /// Incremental reasoning text, for backends that mark it separately.
    pub delta_reasoning: Option<String>,
    /// Role, usually only on the first chunk.
    pub delta_role: Option<MessageRole>,
    /// Tool call fragments.
    pub delta_tool_calls: Option<Vec<ToolCallDelta>>,
    /// Set on the final chunk of the turn.
    pub finish_reason: Option<FinishReason>,
    /// Token usage, if reported on the final chunk.
    pub usage: Option<Usage>,
    /// Provider-side identifier.
    pub response_id: Option<String>,
    /// When the chunk was received.
    pub created_at: DateTime<Utc>,
}

impl ChatChunk {
    /// An empty chunk for the given model.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            delta_content: None,
            delta_reasoning: None,
            delta_role: None,
            delta_tool_calls: None,
            finish_reason: None,
            usage: None,
            response_id: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.delta_content = Some(content.into());
        self
    }

    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.delta_reasoning = Some(reasoning.into());
        self
    }

    #[must_use]
    pub fn with_tool_calls(mut self, deltas: Vec<ToolCallDelta>) -> Self {
        self.delta_tool_calls = Some(deltas);
        self
    }

    #[must_use]
    pub const fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }
}

/// Connection and sampling settings for a backend client.
///
/// The API key is held as a `SecretString` and never serialized.
///
/// ```
/// use llmserve_common::Config;
///
/// let config = Config::ollama("qwen3:0.6b").with_temperature(0.2);
/// assert_eq!(config.base_url.as_deref(), Some("http://localhost:11434/v1"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Provider label, used in logs.
    pub provider: String,
    /// Default model identifier.
    pub model: String,
    /// Base URL of the OpenAI-compatible API.
    pub base_url: Option<String>,
    /// Bearer token, if the backend needs one.
    #[serde(skip_serializing, default)]
    pub api_key: Option<SecretString>,
    /// Request timeout in seconds.
    pub timeout_seconds: Option<u64>,
    /// Retry behaviour for transient failures.
    #[serde(skip)]
    pub retry_config: RetryConfig,
    /// Default sampling temperature.
    pub temperature: Option<f32>,
    /// Default token limit.
    pub max_tokens: Option<u32>,
    /// Default nucleus sampling threshold.
    pub top_p: Option<f32>,
    /// Default stop sequences.
    pub stop_sequences: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::ollama(DEFAULT_MODEL)
    }
}

impl Config {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            base_url: None,
            api_key: None,
            timeout_seconds: None,
            retry_config: RetryConfig::default(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop_sequences: None,
        }
    }

    /// Settings for a local Ollama server on the default host and port.
    pub fn ollama(model: impl Into<String>) -> Self {
        Self::new("ollama", model).with_base_url(ollama_base_url(
            DEFAULT_OLLAMA_HOST,
            DEFAULT_OLLAMA_PORT,
        ))
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(api_key.into().into()));
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub const fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    #[must_use]
    pub fn with_stop_sequences(
        mut self,
        stop_sequences: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.stop_sequences = Some(stop_sequences.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub const fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Builds a request carrying this configuration's model and sampling defaults.
    #[must_use]
    pub fn chat_request(&self, messages: impl Into<Arc<[Message]>>) -> ChatRequest {
        let mut request = ChatRequest::new(messages).with_model(&self.model);
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;
        request.top_p = self.top_p;
        request.stop.clone_from(&self.stop_sequences);
        request
    }

    /// Checks the sampling defaults are in range.
    ///
    /// # Errors
    ///
    /// Returns an error if `temperature` or `top_p` is out of range.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model.trim().is_empty() {
            anyhow::bail!("Model name must not be empty");
        }
        validate_sampling(self.temperature, self.top_p)
    }
}

/// Base URL of the OpenAI-compatible API of an Ollama server.
#[must_use]
pub fn ollama_base_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}/v1")
}
