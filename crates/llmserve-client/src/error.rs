//! Error types for the backend adapters.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Error body returned by OpenAI-compatible servers.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    /// The error detail object.
    pub error: ErrorDetail,
}

/// Detailed error information.
///
/// Ollama sometimes sends `{"error": "message"}` instead of an object, so
/// both shapes are accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    /// `{"error": {"message": "..."}}`
    Object {
        /// The error message text.
        message: String,
    },
    /// `{"error": "..."}`
    Text(String),
}

impl ErrorDetail {
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Object { message } | Self::Text(message) => message,
        }
    }
}

/// Errors raised while talking to an inference backend.
///
/// Every variant falls into one of two classes, see
/// [`ClientError::is_unavailable`] and [`ClientError::is_protocol`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Connection, DNS or socket failure.
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Failure inside the retry middleware stack.
    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),

    /// The backend sent JSON we could not decode.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// SSE transport or framing failure.
    #[error("EventSource error: {0}")]
    EventSourceError(#[from] reqwest_eventsource::Error),

    /// HTTP 401 or 403.
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// HTTP 429.
    #[error("Rate limit exceeded: {retry_after:?}")]
    RateLimitError {
        /// Suggested wait before retrying, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// HTTP 5xx.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Any other non-success HTTP status.
    #[error("Request failed with status {status}: {message}")]
    RequestError {
        /// The HTTP status code.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },

    /// Invalid base URL or client settings.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The request took longer than the configured timeout.
    #[error("Timeout error")]
    TimeoutError,

    /// The request was rejected before it was sent.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The reply parsed but did not have the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Tools were supplied to a client that cannot send them.
    #[error("Tool execution not supported")]
    ToolsNotSupported,

    /// Streaming was requested from a client that cannot stream.
    #[error("Streaming not supported")]
    StreamingNotSupported,

    /// Temperature must be between 0.0 and 2.0.
    #[error("Temperature must be between 0.0 & 2.0")]
    InvalidTemperature,

    /// `top_p` must be between 0.0 and 1.0.
    #[error("TopP must be between 0.0 & 1.0")]
    InvalidTopP,
}

impl ClientError {
    /// Maps an HTTP status and message to the matching variant.
    #[must_use]
    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 | 403 => Self::AuthenticationError(message),
            408 => Self::TimeoutError,
            429 => Self::RateLimitError { retry_after: None },
            code if status.is_server_error() => {
                Self::ServiceUnavailable(format!("{code}: {message}"))
            }
            code => Self::RequestError {
                status: code,
                message,
            },
        }
    }

    /// Check if this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_)
                | Self::MiddlewareError(_)
                | Self::TimeoutError
                | Self::RateLimitError { .. }
                | Self::ServiceUnavailable(_)
        ) || self.is_transport_event_error()
    }

    /// The backend could not be reached or refused to serve the request.
    pub fn is_unavailable(&self) -> bool {
        !self.is_protocol()
    }

    /// The backend answered, but not in a format this client understands.
    pub fn is_protocol(&self) -> bool {
        match self {
            Self::SerializationError(_) | Self::InvalidResponse(_) => true,
            Self::EventSourceError(_) => !self.is_transport_event_error(),
            _ => false,
        }
    }

    fn is_transport_event_error(&self) -> bool {
        match self {
            Self::EventSourceError(reqwest_eventsource::Error::Transport(_)) => true,
            Self::EventSourceError(reqwest_eventsource::Error::InvalidStatusCode(status, _)) => {
                status.is_server_error()
            }
            _ => false,
        }
    }

    /// Check if this is an authentication error.
    pub const fn is_authentication_error(&self) -> bool {
        matches!(self, Self::AuthenticationError(_))
    }

    /// Get the retry-after duration if this is a rate limit error.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitError { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ClientError::from_status(StatusCode::UNAUTHORIZED, "nope".into()),
            ClientError::AuthenticationError(_)
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ClientError::RateLimitError { retry_after: None }
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::BAD_GATEWAY, "down".into()),
            ClientError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::NOT_FOUND, "model not found".into()),
            ClientError::RequestError { status: 404, .. }
        ));
    }

    #[test]
    fn test_classification() {
        let unavailable = ClientError::ServiceUnavailable("503".into());
        assert!(unavailable.is_unavailable());
        assert!(unavailable.is_retryable());
        assert!(!unavailable.is_protocol());

        let protocol = ClientError::InvalidResponse("no choices".into());
        assert!(protocol.is_protocol());
        assert!(!protocol.is_retryable());

        let parse = ClientError::from(serde_json::from_str::<u8>("x").unwrap_err());
        assert!(parse.is_protocol());

        let ended = ClientError::EventSourceError(reqwest_eventsource::Error::StreamEnded);
        assert!(ended.is_protocol());

        let auth = ClientError::AuthenticationError("bad key".into());
        assert!(auth.is_unavailable());
        assert!(!auth.is_retryable());
    }

    #[test]
    fn test_error_body_shapes() {
        let object: ErrorResponse =
            serde_json::from_str(r#"{"error":{"message":"bad","type":"x"}}"#).unwrap();
        assert_eq!(object.error.message(), "bad");

        let text: ErrorResponse = serde_json::from_str(r#"{"error":"model 'x' not found"}"#).unwrap();
        assert_eq!(text.error.message(), "model 'x' not found");
    }
}
