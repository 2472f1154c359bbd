//! Bounded, failure-isolated execution of tool bodies.
//!
//! Each invocation runs on its own tokio task. The caller waits for it under a
//! time budget and a cancellation token; a tool that hangs, errors or panics
//! only ever produces a [`ToolError`], never a crash or a stalled loop.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::ToolImplementation;
use crate::error::ToolError;

/// Budget used when neither the caller nor the tool sets one.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs tool bodies with a time budget and a cancellation token.
///
/// A tool's own [`ToolImplementation::timeout`] takes precedence over the
/// sandbox budget.
#[derive(Debug, Clone)]
pub struct Sandbox {
    timeout: Duration,
    cancel: CancellationToken,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl Sandbox {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Aborts in-flight tools when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Executes `tool` with `args` and waits for it within the budget.
    ///
    /// The task is aborted on timeout, on cancellation, and when the returned
    /// future is dropped early. Tools that spawn child processes should set
    /// `kill_on_drop` so the abort reaches them.
    ///
    /// # Errors
    ///
    /// Returns the contained failure: [`ToolError::Timeout`],
    /// [`ToolError::Cancelled`], [`ToolError::Panicked`], or the error the
    /// tool body returned.
    pub async fn run(
        &self,
        name: &str,
        tool: Arc<dyn ToolImplementation>,
        args: Value,
    ) -> Result<Value, ToolError> {
        if self.cancel.is_cancelled() {
            return Err(ToolError::Cancelled(name.to_string()));
        }

        let budget = tool.timeout().unwrap_or(self.timeout);
        debug!("Running tool '{name}' with a {}ms budget", budget.as_millis());

        let mut task = AbortOnDrop(tokio::spawn(async move { tool.execute(&args).await }));

        let joined = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!("Tool '{name}' cancelled");
                return Err(ToolError::Cancelled(name.to_string()));
            }
            joined = tokio::time::timeout(budget, &mut task.0) => joined,
        };

        match joined {
            Err(_elapsed) => {
                warn!("Tool '{name}' timed out after {}ms", budget.as_millis());
                Err(ToolError::Timeout {
                    tool: name.to_string(),
                    timeout: budget,
                })
            }
            Ok(Err(join_error)) => Err(join_failure(name, join_error)),
            Ok(Ok(Err(err))) => Err(match err.downcast::<ToolError>() {
                Ok(tool_error) => tool_error,
                Err(err) => ToolError::Execution(err),
            }),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn join_failure(name: &str, err: JoinError) -> ToolError {
    if err.is_panic() {
        let message = panic_message(err.into_panic().as_ref());
        warn!("Tool '{name}' panicked: {message}");
        ToolError::Panicked {
            tool: name.to_string(),
            message,
        }
    } else {
        ToolError::Cancelled(name.to_string())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
