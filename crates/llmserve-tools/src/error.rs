//! Errors raised by the tool registry and sandbox.

use std::time::Duration;

use thiserror::Error;

use llmserve_common::{ToolFailure, ToolFailureKind};

/// Failures of tool registration or invocation.
///
/// Only [`ToolError::Schema`] ever reaches a caller as an `Err`. Every other
/// variant is converted into a [`ToolFailure`] and handed back to the model
/// inside a tool result.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// The tool definition is malformed and was not registered.
    #[error("Invalid tool definition '{name}': {message}")]
    Schema {
        /// Name of the rejected tool (may be empty).
        name: String,
        /// What is wrong with the definition.
        message: String,
    },

    /// The model asked for a tool that is not registered.
    #[error("Tool '{0}' not found")]
    UnknownTool(String),

    /// Arguments could not be decoded or failed schema validation.
    #[error("Invalid arguments for '{tool}': {message}")]
    InvalidArguments {
        /// The requested tool.
        tool: String,
        /// Decoding or validation errors.
        message: String,
    },

    /// The tool did not finish within its budget.
    #[error("Tool '{tool}' timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// The requested tool.
        tool: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// The tool body returned an error.
    #[error("{0:#}")]
    Execution(anyhow::Error),

    /// The tool body panicked.
    #[error("Tool '{tool}' panicked: {message}")]
    Panicked {
        /// The requested tool.
        tool: String,
        /// The panic payload, when it was a string.
        message: String,
    },

    /// The tool produced output that has no JSON representation.
    #[error("Tool output is not serializable: {0}")]
    NotSerializable(String),

    /// The invocation was cancelled before it finished.
    #[error("Tool '{0}' was cancelled")]
    Cancelled(String),
}

impl ToolError {
    pub(crate) fn schema(name: &str, message: impl Into<String>) -> Self {
        Self::Schema {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// The failure category reported to the model.
    #[must_use]
    pub const fn kind(&self) -> ToolFailureKind {
        match self {
            Self::UnknownTool(_) => ToolFailureKind::UnknownTool,
            Self::Schema { .. } | Self::InvalidArguments { .. } => {
                ToolFailureKind::InvalidArguments
            }
            Self::Timeout { .. } => ToolFailureKind::Timeout,
            Self::Execution(_) => ToolFailureKind::Execution,
            Self::Panicked { .. } => ToolFailureKind::Panicked,
            Self::NotSerializable(_) => ToolFailureKind::NotSerializable,
            Self::Cancelled(_) => ToolFailureKind::Cancelled,
        }
    }
}

impl From<ToolError> for ToolFailure {
    fn from(err: ToolError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_failure_conversion() {
        let failure = ToolFailure::from(ToolError::UnknownTool("get_weather".into()));
        assert_eq!(failure.kind, ToolFailureKind::UnknownTool);
        assert_eq!(failure.message, "Tool 'get_weather' not found");

        let failure = ToolFailure::from(ToolError::Timeout {
            tool: "slow".into(),
            timeout: Duration::from_millis(250),
        });
        assert_eq!(failure.kind, ToolFailureKind::Timeout);
        assert_eq!(failure.message, "Tool 'slow' timed out after 250ms");
    }

    #[test]
    fn test_execution_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("geocoding failed");
        let failure = ToolFailure::from(ToolError::Execution(err));
        assert_eq!(failure.kind, ToolFailureKind::Execution);
        assert_eq!(failure.message, "geocoding failed: connection refused");
    }
}
