//! # llmserve-tools
//!
//! Tool registry, argument validation and sandboxed execution.
//!
//! ## Core Components
//!
//! - [`ToolImplementation`]: Trait for defining tools with execution logic
//! - [`ToolRegistry`]: Concurrent registry that validates definitions and
//!   invokes tool calls requested by a model
//! - [`Sandbox`]: Runs one tool body with a time budget and contains its failures
//! - [`FunctionTool`]: Wraps an async closure as a tool
//!
//! ## Built-in Tools
//!
//! - [`TemperatureTool`]: Current temperature from the Open-Meteo API
//! - [`CurrentTimeTool`]: Current time in a named timezone
//! - [`CurrencyConverterTool`]: Currency conversion from a fixed rate table
//! - [`RandomNumberTool`]: Random integer in a range
//! - [`CodeInterpreterTool`]: Runs Python snippets in a child process
//! - [`CatFileTool`]: Reads a file under a root directory
//! - [`ParsePdfTool`]: Page-by-page text of a PDF from a URL or file path
//!
//! ## Example
//!
//! ```rust
//! use llmserve_common::{Parameters, Property, Tool, ToolCall};
//! use llmserve_tools::{ToolImplementation, ToolRegistry};
//! use serde_json::{json, Value};
//! use async_trait::async_trait;
//! use std::time::Duration;
//!
//! struct GreetingTool;
//!
//! #[async_trait]
//! impl ToolImplementation for GreetingTool {
//!     fn get_definition(&self) -> Tool {
//!         Tool::function(
//!             "greet",
//!             "Greet a person by name",
//!             Parameters::from_fields([("name", Property::string("The person's name"), true)]),
//!         )
//!     }
//!
//!     async fn execute(&self, args: &Value) -> anyhow::Result<Value> {
//!         let name = args["name"].as_str().unwrap_or("stranger");
//!         Ok(json!(format!("Hello, {name}!")))
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = ToolRegistry::new();
//! registry.register_tool(GreetingTool)?;
//!
//! let call = ToolCall::new("greet", r#"{"name": "Ada"}"#);
//! let result = registry.invoke(&call, Duration::from_secs(5)).await;
//! assert_eq!(result.content(), "Hello, Ada!");
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! The [`ToolRegistry`] uses `DashMap` for concurrent lookups, so one registry
//! can be shared by many conversations behind an `Arc`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use log::{debug, warn};
use serde_json::Value;
use tokio::time::Instant;

use llmserve_common::{Tool, ToolCall, ToolFailure, ToolResult};

pub mod cat_file;
pub mod code_interpreter;
pub mod error;
mod function;
pub mod generic;
pub mod parse_pdf;
pub mod sandbox;
pub mod schema;
pub mod temperature;

pub use cat_file::CatFileTool;
pub use code_interpreter::CodeInterpreterTool;
pub use error::ToolError;
pub use function::FunctionTool;
pub use generic::{CurrencyConverterTool, CurrentTimeTool, RandomNumberTool};
pub use parse_pdf::ParsePdfTool;
pub use sandbox::{DEFAULT_TOOL_TIMEOUT, Sandbox};
pub use schema::ArgumentSchema;
pub use temperature::TemperatureTool;

/// A callable the model may request.
#[async_trait]
pub trait ToolImplementation: Send + Sync {
    /// The definition advertised to the model.
    fn get_definition(&self) -> Tool;

    /// Runs the tool with validated arguments.
    ///
    /// Strings are placed in the tool message verbatim; other values are
    /// JSON-encoded.
    async fn execute(&self, args: &Value) -> Result<Value>;

    /// Per-tool time budget, overriding the sandbox default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// All built-in tools in their advertised order.
#[must_use]
pub fn default_tools() -> Vec<Arc<dyn ToolImplementation>> {
    vec![
        Arc::new(TemperatureTool::new()),
        Arc::new(CurrentTimeTool),
        Arc::new(CurrencyConverterTool),
        Arc::new(CodeInterpreterTool::new()),
        Arc::new(ParsePdfTool::new()),
        Arc::new(RandomNumberTool),
        Arc::new(CatFileTool::new()),
    ]
}

struct RegisteredTool {
    seq: u64,
    definition: Tool,
    schema: ArgumentSchema,
    tool: Arc<dyn ToolImplementation>,
}

/// Named tools with compiled argument schemas.
///
/// Registering a name that already exists replaces the previous tool
/// (last write wins) but keeps its position in [`ToolRegistry::list_definitions`].
pub struct ToolRegistry {
    tools: DashMap<String, Arc<RegisteredTool>>,
    next_seq: AtomicU64,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// A registry holding every built-in tool.
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in definition fails validation.
    pub fn with_defaults() -> Result<Self, ToolError> {
        let registry = Self::new();
        for tool in default_tools() {
            registry.register(tool)?;
        }
        Ok(registry)
    }

    /// Validates and inserts a tool, replacing any tool with the same name.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Schema`] if the name or parameter schema is
    /// malformed. The registry is unchanged in that case.
    pub fn register(&self, tool: Arc<dyn ToolImplementation>) -> Result<(), ToolError> {
        let definition = tool.get_definition();
        let schema = ArgumentSchema::compile(&definition)?;
        let name = definition.function.name.clone();

        match self.tools.entry(name) {
            Entry::Occupied(mut entry) => {
                warn!("Tool '{}' re-registered, replacing previous definition", entry.key());
                let seq = entry.get().seq;
                entry.insert(Arc::new(RegisteredTool {
                    seq,
                    definition,
                    schema,
                    tool,
                }));
            }
            Entry::Vacant(entry) => {
                debug!("Registered tool '{}'", entry.key());
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                entry.insert(Arc::new(RegisteredTool {
                    seq,
                    definition,
                    schema,
                    tool,
                }));
            }
        }
        Ok(())
    }

    /// Convenience wrapper around [`ToolRegistry::register`].
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Schema`] if the definition is malformed.
    pub fn register_tool<T: ToolImplementation + 'static>(&self, tool: T) -> Result<(), ToolError> {
        self.register(Arc::new(tool))
    }

    /// Removes a tool, returning it if it was registered.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn ToolImplementation>> {
        self.tools.remove(name).map(|(_, entry)| Arc::clone(&entry.tool))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolImplementation>> {
        self.tools.get(name).map(|entry| Arc::clone(&entry.tool))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn ordered(&self) -> Vec<Arc<RegisteredTool>> {
        let mut entries: Vec<_> = self
            .tools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    /// Tool names in registration order.
    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        self.ordered()
            .iter()
            .map(|entry| entry.definition.function.name.clone())
            .collect()
    }

    /// Snapshot of every definition in registration order, ready to send to
    /// a backend.
    #[must_use]
    pub fn list_definitions(&self) -> Vec<Tool> {
        self.ordered()
            .iter()
            .map(|entry| entry.definition.clone())
            .collect()
    }

    /// Invokes one tool call with a fresh [`Sandbox`].
    pub async fn invoke(&self, call: &ToolCall, timeout: Duration) -> ToolResult {
        self.invoke_in(call, &Sandbox::new(timeout)).await
    }

    /// Invokes one tool call inside `sandbox`.
    ///
    /// Never fails: unknown tools, bad arguments and tool failures all come
    /// back as a [`ToolResult`] carrying a [`ToolFailure`].
    pub async fn invoke_in(&self, call: &ToolCall, sandbox: &Sandbox) -> ToolResult {
        let started = Instant::now();
        let name = call.function.name.as_str();
        debug!("Invoking tool '{name}' (call {})", call.id);

        let outcome = match self.prepare(call) {
            Ok((tool, args)) => sandbox.run(name, tool, args).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(value) => ToolResult::success(call, value, started.elapsed()),
            Err(err) => {
                warn!("Tool call {} to '{name}' failed: {err}", call.id);
                ToolResult::failure(call, ToolFailure::from(err), started.elapsed())
            }
        }
    }

    /// Invokes calls with at most `max_concurrency` running at once.
    ///
    /// Results are returned in the order of `calls`, whatever order the tools
    /// finish in.
    pub async fn invoke_all(
        &self,
        calls: &[ToolCall],
        sandbox: &Sandbox,
        max_concurrency: usize,
    ) -> Vec<ToolResult> {
        let invocations: Vec<_> = calls
            .iter()
            .map(|call| self.invoke_in(call, sandbox))
            .collect();
        futures::stream::iter(invocations)
            .buffered(max_concurrency.max(1))
            .collect()
            .await
    }

    fn prepare(&self, call: &ToolCall) -> Result<(Arc<dyn ToolImplementation>, Value), ToolError> {
        let name = &call.function.name;
        let entry = self
            .tools
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ToolError::UnknownTool(name.clone()))?;

        let invalid = |message: String| ToolError::InvalidArguments {
            tool: name.clone(),
            message,
        };

        let mut args = schema::decode_arguments(call.function.arguments_json()).map_err(invalid)?;
        entry.schema.apply_defaults(&mut args);
        entry.schema.validate(&args).map_err(invalid)?;

        Ok((Arc::clone(&entry.tool), args))
    }
}
