//! Tool definitions, tool call requests and tool results.
//!
//! The serialized shapes match OpenAI-compatible chat APIs:
//!
//! - a [`Tool`] advertises `{type: "function", function: {name, description, parameters}}`
//! - a [`ToolCall`] arrives as `{id, type: "function", function: {name, arguments}}`
//! - a [`ToolResult`] goes back as a tool-role message whose content is
//!   [`ToolResult::content`]

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Represents an object schema used as array items or nested objects.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ObjectSchema {
    /// The JSON type, always "object".
    #[serde(rename = "type")]
    pub schema_type: String,
    /// Map of property names to their definitions.
    pub properties: HashMap<String, Property>,
    /// List of required property names.
    pub required: Vec<String>,
}

impl ObjectSchema {
    /// Creates a new `ObjectSchema` with the given properties and required fields.
    #[must_use]
    pub fn new(properties: HashMap<String, Property>, required: Vec<String>) -> Self {
        Self {
            schema_type: "object".to_string(),
            properties,
            required,
        }
    }
}

/// Describes a single property in a function parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Property {
    /// The JSON type (e.g., "string", "number", "integer", "object").
    #[serde(rename = "type")]
    pub prop_type: String,
    /// Human-readable description of this property.
    pub description: String,
    /// Allowed enum values for this property.
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    /// Value the tool assumes when the argument is omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Schema for array items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ObjectSchema>>,
    /// Nested object properties.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, Self>>,
    /// Required fields for nested objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

impl Property {
    fn typed(prop_type: &str, description: impl Into<String>) -> Self {
        Self {
            prop_type: prop_type.to_string(),
            description: description.into(),
            enum_values: None,
            default: None,
            items: None,
            properties: None,
            required: None,
        }
    }

    /// Creates a string property.
    #[must_use]
    pub fn string(description: impl Into<String>) -> Self {
        Self::typed("string", description)
    }

    /// Creates a number property.
    #[must_use]
    pub fn number(description: impl Into<String>) -> Self {
        Self::typed("number", description)
    }

    /// Creates an integer property.
    #[must_use]
    pub fn integer(description: impl Into<String>) -> Self {
        Self::typed("integer", description)
    }

    /// Creates a boolean property.
    #[must_use]
    pub fn boolean(description: impl Into<String>) -> Self {
        Self::typed("boolean", description)
    }

    /// Creates a string property with allowed enum values.
    #[must_use]
    pub fn string_enum(description: impl Into<String>, values: Vec<&str>) -> Self {
        Self {
            enum_values: Some(values.into_iter().map(String::from).collect()),
            ..Self::typed("string", description)
        }
    }

    /// Creates an array property with the given item schema.
    #[must_use]
    pub fn array(description: impl Into<String>, items: ObjectSchema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::typed("array", description)
        }
    }

    /// Creates an object property with nested properties.
    #[must_use]
    pub fn object(
        description: impl Into<String>,
        properties: HashMap<String, Self>,
        required: Vec<String>,
    ) -> Self {
        Self {
            properties: Some(properties),
            required: Some(required),
            ..Self::typed("object", description)
        }
    }

    /// Sets the default value advertised to the model.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<serde_json::Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Defines the parameter schema for a function using JSON Schema conventions.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Parameters {
    /// The JSON type, typically "object".
    #[serde(rename = "type")]
    pub param_type: String,
    /// Map of parameter names to their property definitions.
    pub properties: HashMap<String, Property>,
    /// List of required parameter names.
    pub required: Vec<String>,
}

impl Parameters {
    /// Creates a new `Parameters` with type "object".
    #[must_use]
    pub fn new(properties: HashMap<String, Property>, required: Vec<String>) -> Self {
        Self {
            param_type: "object".to_string(),
            properties,
            required,
        }
    }

    /// Creates a parameter schema from `(name, property, required)` triples.
    #[must_use]
    pub fn from_fields<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, Property, bool)>,
    {
        let mut properties = HashMap::new();
        let mut required = Vec::new();
        for (name, property, is_required) in fields {
            if is_required {
                required.push(name.to_string());
            }
            properties.insert(name.to_string(), property);
        }
        Self::new(properties, required)
    }

    /// Fallible conversion to `serde_json::Value` for contexts that can propagate errors.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if serialization fails.
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl From<Parameters> for serde_json::Value {
    fn from(params: Parameters) -> Self {
        match serde_json::to_value(params) {
            Ok(value) => value,
            Err(e) => {
                warn!("Parameters serialization unexpectedly failed: {e}");
                Self::Null
            }
        }
    }
}

/// Describes a function that can be called by an LLM.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Function {
    /// The name of the function.
    pub name: String,
    /// Human-readable description of what the function does.
    pub description: String,
    /// JSON Schema definition of the function's parameters.
    pub parameters: serde_json::Value,
}

/// Represents a tool available to the LLM, typically wrapping a function.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Eq, PartialEq)]
pub struct Tool {
    /// The type of tool (defaults to "function").
    #[serde(rename = "type")]
    #[builder(default = "function".to_string())]
    pub r#type: String,
    /// The function definition.
    pub function: Function,
}

impl Tool {
    /// Creates a function tool.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            r#type: "function".to_string(),
            function: Function {
                name: name.into(),
                description: description.into(),
                parameters: parameters.into(),
            },
        }
    }

    /// The function name, which is the tool's registry key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// Represents an invocation of a function with arguments.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    /// The name of the function being called.
    pub name: String,
    /// The raw, unvalidated arguments as JSON text.
    ///
    /// Backends that send a structured object instead of a string are
    /// accepted; the object is stored re-encoded as JSON text.
    #[serde(default, deserialize_with = "deserialize_arguments")]
    pub arguments: String,
}

impl FunctionCall {
    /// Returns the arguments as a JSON string slice.
    ///
    /// Returns `"{}"` if the arguments string is empty.
    #[must_use]
    pub fn arguments_json(&self) -> &str {
        if self.arguments.trim().is_empty() {
            "{}"
        } else {
            &self.arguments
        }
    }
}

fn deserialize_arguments<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(text) => text,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// A model-issued request to invoke one tool.
///
/// Arguments are passed through as-is from the backend; validation happens
/// when the registry invokes the tool.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ToolCall {
    /// Identifier, unique within the assistant message that issued it.
    #[serde(default)]
    pub id: String,
    /// The type of call, typically "function".
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    /// The function being invoked.
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Creates a new tool call with a generated ID.
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self::with_id(format!("call_{}", Uuid::new_v4().simple()), name, arguments)
    }

    /// Creates a tool call with an explicit ID.
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: default_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Merges tool call deltas by ID, concatenating argument fragments.
    ///
    /// Used when processing streaming responses where tool calls arrive
    /// incrementally. A delta with an empty ID continues the most recent call.
    #[must_use]
    pub fn merge_deltas(mut accumulated: Vec<Self>, deltas: &[Self]) -> Vec<Self> {
        for delta in deltas {
            let existing = if delta.id.is_empty() {
                accumulated.last_mut()
            } else {
                accumulated.iter_mut().find(|tc| tc.id == delta.id)
            };
            if let Some(existing) = existing {
                if existing.function.name.is_empty() {
                    existing.function.name.clone_from(&delta.function.name);
                }
                existing
                    .function
                    .arguments
                    .push_str(&delta.function.arguments);
            } else {
                accumulated.push(delta.clone());
            }
        }

        accumulated
    }
}

/// Why a tool invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    /// No tool with the requested name is registered.
    UnknownTool,
    /// Arguments could not be decoded or did not match the schema.
    InvalidArguments,
    /// The tool exceeded its time budget.
    Timeout,
    /// The tool body returned an error.
    Execution,
    /// The tool body panicked.
    Panicked,
    /// The tool returned a value that cannot be represented as JSON.
    NotSerializable,
    /// The invocation was cancelled by the caller.
    Cancelled,
}

impl fmt::Display for ToolFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UnknownTool => "unknown_tool",
            Self::InvalidArguments => "invalid_arguments",
            Self::Timeout => "timeout",
            Self::Execution => "execution_error",
            Self::Panicked => "panicked",
            Self::NotSerializable => "not_serializable",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// A contained tool failure, reported back to the model as a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    /// Failure category.
    pub kind: ToolFailureKind,
    /// Human-readable description.
    pub message: String,
}

impl ToolFailure {
    /// Creates a failure of the given kind.
    pub fn new(kind: ToolFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ToolFailure {}

/// The outcome of executing one [`ToolCall`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// The id of the call this result answers.
    pub tool_call_id: String,
    /// The function name that was requested.
    pub name: String,
    /// The returned value or the contained failure.
    pub outcome: Result<serde_json::Value, ToolFailure>,
    /// Wall-clock time spent on the invocation.
    pub duration: Duration,
}

impl ToolResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(call: &ToolCall, value: serde_json::Value, duration: Duration) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.function.name.clone(),
            outcome: Ok(value),
            duration,
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failure(call: &ToolCall, failure: ToolFailure, duration: Duration) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.function.name.clone(),
            outcome: Err(failure),
            duration,
        }
    }

    /// Returns true if the tool produced a value.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The failure, if the invocation failed.
    #[must_use]
    pub fn error(&self) -> Option<&ToolFailure> {
        self.outcome.as_ref().err()
    }

    /// Text placed in the tool-role message.
    ///
    /// Strings are passed through, other values are JSON-encoded, and failures
    /// become `{"error": "...", "error_type": "..."}`.
    #[must_use]
    pub fn content(&self) -> String {
        match &self.outcome {
            Ok(serde_json::Value::String(text)) => text.clone(),
            Ok(value) => value.to_string(),
            Err(failure) => serde_json::json!({
                "error": failure.message,
                "error_type": failure.kind,
            })
            .to_string(),
        }
    }
}
