//! Closure-backed tools.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use llmserve_common::Tool;

use crate::ToolImplementation;
use crate::error::ToolError;

/// A tool whose body is an async closure returning any serializable value.
///
/// The closure's output is converted to JSON after it returns; output that has
/// no JSON form (for example a map with non-string keys) is reported as
/// [`ToolError::NotSerializable`].
///
/// ```rust
/// use llmserve_common::{Parameters, Property};
/// use llmserve_tools::{FunctionTool, ToolRegistry};
///
/// # fn example() -> Result<(), llmserve_tools::ToolError> {
/// let shout = FunctionTool::new(
///     "shout",
///     "Upper-cases a word",
///     Parameters::from_fields([("word", Property::string("The word"), true)]),
///     |args| async move {
///         let word = args["word"].as_str().unwrap_or_default().to_uppercase();
///         Ok::<_, anyhow::Error>(word)
///     },
/// );
///
/// let registry = ToolRegistry::new();
/// registry.register_tool(shout)?;
/// # Ok(())
/// # }
/// ```
pub struct FunctionTool<F> {
    definition: Tool,
    handler: F,
    timeout: Option<Duration>,
}

impl<F> FunctionTool<F> {
    pub fn new<Fut, T>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: impl Into<Value>,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        Self {
            definition: Tool::function(name, description, parameters),
            handler,
            timeout: None,
        }
    }

    /// Overrides the sandbox budget for this tool.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl<F, Fut, T> ToolImplementation for FunctionTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    fn get_definition(&self) -> Tool {
        self.definition.clone()
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let output = (self.handler)(args.clone()).await?;
        serde_json::to_value(output).map_err(|e| ToolError::NotSerializable(e.to_string()).into())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
