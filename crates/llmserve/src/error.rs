//! Errors that end an orchestration run.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use llmserve_client::ClientError;
use llmserve_common::Conversation;
use llmserve_tools::ToolError;

/// Why a `chat` call failed.
///
/// Tool failures never appear here: they are returned to the model as tool
/// results. Only infrastructure failures end a run.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    /// The backend could not be reached or refused the request.
    #[error("Backend unavailable: {0:#}")]
    BackendUnavailable(anyhow::Error),

    /// The backend replied in a format the adapter does not understand.
    #[error("Backend protocol error: {0:#}")]
    BackendProtocol(anyhow::Error),

    /// The model kept requesting tools past the round limit.
    #[error("Orchestration limit reached: still requesting tools after {rounds} rounds")]
    OrchestrationLimit {
        /// Tool rounds that were executed.
        rounds: usize,
        /// The conversation at the point the limit was hit, including the
        /// unanswered assistant message.
        conversation: Box<Conversation>,
    },

    /// The caller cancelled the run.
    #[error("Cancelled")]
    Cancelled,

    /// The run exceeded its overall deadline.
    #[error("Deadline of {}ms exceeded", .0.as_millis())]
    DeadlineExceeded(Duration),

    /// A tool definition was rejected.
    #[error(transparent)]
    Schema(#[from] ToolError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BackendUnavailable,
    BackendProtocol,
    OrchestrationLimit,
    Cancelled,
    Schema,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BackendUnavailable => "backend_unavailable",
            Self::BackendProtocol => "backend_protocol",
            Self::OrchestrationLimit => "orchestration_limit",
            Self::Cancelled => "cancelled",
            Self::Schema => "schema",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

impl CoreError {
    /// Classifies an error returned by an [`llmserve_client::LLMClient`].
    ///
    /// Errors that do not wrap a [`ClientError`] are treated as protocol
    /// errors, since the adapter could not describe them.
    #[must_use]
    pub fn from_backend(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ClientError>() {
            Some(client_err) if client_err.is_unavailable() => Self::BackendUnavailable(err),
            _ => Self::BackendProtocol(err),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::BackendProtocol(_) => ErrorKind::BackendProtocol,
            Self::OrchestrationLimit { .. } => ErrorKind::OrchestrationLimit,
            Self::Cancelled | Self::DeadlineExceeded(_) => ErrorKind::Cancelled,
            Self::Schema(_) => ErrorKind::Schema,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether another attempt at the same backend call might succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BackendUnavailable(err) => err
                .downcast_ref::<ClientError>()
                .is_some_and(ClientError::is_retryable),
            _ => false,
        }
    }

    /// The partial conversation, for [`CoreError::OrchestrationLimit`].
    #[must_use]
    pub fn conversation(&self) -> Option<&Conversation> {
        match self {
            Self::OrchestrationLimit { conversation, .. } => Some(conversation),
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
    fn test_backend_classification() {
        let err = CoreError::from_backend(ClientError::ServiceUnavailable("503".into()).into());
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert!(err.is_retryable());

        let err = CoreError::from_backend(ClientError::AuthenticationError("bad key".into()).into());
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert!(!err.is_retryable());

        let err = CoreError::from_backend(ClientError::InvalidResponse("no choices".into()).into());
        assert_eq!(err.kind(), ErrorKind::BackendProtocol);
        assert!(!err.is_retryable());

        let err = CoreError::from_backend(anyhow::anyhow!("mystery"));
        assert_eq!(err.kind(), ErrorKind::BackendProtocol);
    }

    #[test]
    fn test_context_is_preserved_through_classification() {
        let err = anyhow::Error::from(ClientError::TimeoutError).context("opening stream");
        let err = CoreError::from_backend(err);
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(err.to_string(), "Backend unavailable: opening stream: Timeout error");
    }

    #[test]
    fn test_limit_carries_conversation() {
        let conversation = Conversation::with_system_prompt("sys");
        let err = CoreError::OrchestrationLimit {
            rounds: 3,
            conversation: Box::new(conversation.clone()),
        };
        assert_eq!(err.kind(), ErrorKind::OrchestrationLimit);
        assert_eq!(err.conversation().unwrap().id, conversation.id);
        assert!(err.to_string().contains("3 rounds"));
    }
}
