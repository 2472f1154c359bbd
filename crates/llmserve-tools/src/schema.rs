//! Tool definition checks and argument validation.
//!
//! Definitions are checked once at registration and their parameter schema
//! is compiled with `jsonschema`. Each invocation then decodes the raw
//! argument text, fills in declared defaults and validates the result
//! against the compiled schema.

use std::fmt;

use jsonschema::Validator;
use serde_json::{Map, Value};

use llmserve_common::Tool;

use crate::error::ToolError;

/// Longest tool name accepted by OpenAI-compatible backends.
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Checks that `name` matches `^[a-zA-Z0-9_-]{1,64}$`.
///
/// # Errors
///
/// Returns [`ToolError::Schema`] if the name is empty, too long or contains
/// other characters.
pub fn validate_name(name: &str) -> Result<(), ToolError> {
    if name.is_empty() {
        return Err(ToolError::schema(name, "tool name must not be empty"));
    }
    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(ToolError::schema(
            name,
            format!("tool name is longer than {MAX_TOOL_NAME_LEN} characters"),
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(ToolError::schema(
            name,
            format!("tool name contains invalid character {bad:?}"),
        ));
    }
    Ok(())
}

/// A parameter schema that passed registration checks.
pub struct ArgumentSchema {
    schema: Value,
    validator: Validator,
}

impl fmt::Debug for ArgumentSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentSchema")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl ArgumentSchema {
    /// Checks a tool definition and compiles its parameter schema.
    ///
    /// The parameters must be an object schema with `"type": "object"`, a
    /// `properties` object whose entries each declare a `type`, and a
    /// `required` list naming only declared properties. Both keys must be
    /// present even when empty, as [`llmserve_common::Parameters`] always
    /// writes them.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Schema`] describing the first problem found.
    pub fn compile(tool: &Tool) -> Result<Self, ToolError> {
        let name = tool.name();
        validate_name(name)?;

        if tool.r#type != "function" {
            return Err(ToolError::schema(
                name,
                format!("unsupported tool type \"{}\"", tool.r#type),
            ));
        }

        let schema = &tool.function.parameters;
        check_shape(name, schema)?;

        let validator = jsonschema::validator_for(schema)
            .map_err(|e| ToolError::schema(name, format!("invalid JSON schema: {e}")))?;

        Ok(Self {
            schema: schema.clone(),
            validator,
        })
    }

    /// The raw schema as registered.
    #[must_use]
    pub const fn schema(&self) -> &Value {
        &self.schema
    }

    /// Inserts declared `default` values for properties the caller omitted.
    pub fn apply_defaults(&self, args: &mut Value) {
        let (Some(properties), Some(args)) = (
            self.schema.get("properties").and_then(Value::as_object),
            args.as_object_mut(),
        ) else {
            return;
        };

        for (key, property) in properties {
            if let Some(default) = property.get("default")
                && !args.contains_key(key)
            {
                args.insert(key.clone(), default.clone());
            }
        }
    }

    /// Validates decoded arguments against the schema.
    ///
    /// # Errors
    ///
    /// Returns every validation error joined with `"; "`.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(args)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

fn check_shape(name: &str, schema: &Value) -> Result<(), ToolError> {
    let Some(schema) = schema.as_object() else {
        return Err(ToolError::schema(name, "parameters must be a JSON object"));
    };

    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {}
        Some(other) => {
            return Err(ToolError::schema(
                name,
                format!("parameters must have type \"object\", got \"{other}\""),
            ));
        }
        None => {
            return Err(ToolError::schema(
                name,
                "parameters must declare \"type\": \"object\"",
            ));
        }
    }

    let properties = match schema.get("properties") {
        None => {
            return Err(ToolError::schema(name, "parameters must declare \"properties\""));
        }
        Some(Value::Object(properties)) => properties,
        Some(_) => {
            return Err(ToolError::schema(name, "\"properties\" must be an object"));
        }
    };

    for (key, property) in properties {
        let declares_type = property
            .get("type")
            .is_some_and(|t| t.is_string() || t.is_array());
        if !declares_type {
            return Err(ToolError::schema(
                name,
                format!("property \"{key}\" must be an object with a \"type\""),
            ));
        }
    }

    match schema.get("required") {
        None => Err(ToolError::schema(
            name,
            "parameters must declare \"required\" (use [] for none)",
        )),
        Some(Value::Array(required)) => {
            for field in required {
                let Some(field) = field.as_str() else {
                    return Err(ToolError::schema(
                        name,
                        "\"required\" must contain only strings",
                    ));
                };
                if !properties.contains_key(field) {
                    return Err(ToolError::schema(
                        name,
                        format!("required field \"{field}\" is not a declared property"),
                    ));
                }
            }
            Ok(())
        }
        Some(_) => Err(ToolError::schema(name, "\"required\" must be an array")),
    }
}

/// Decodes the raw argument text of a tool call into a JSON object.
///
/// Accepts an empty string or `null` (no arguments), a JSON object, or a JSON
/// string that itself holds an object, which some local models emit.
///
/// # Errors
///
/// Returns a description of why the text is not an argument object.
pub fn decode_arguments(raw: &str) -> Result<Value, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|e| format!("arguments are not valid JSON: {e}"))?;

    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Map::new())),
        Value::String(inner) => match serde_json::from_str::<Value>(&inner) {
            Ok(decoded @ Value::Object(_)) => Ok(decoded),
            _ => Err("arguments must be a JSON object, got a string".to_string()),
        },
        other => Err(format!(
            "arguments must be a JSON object, got {}",
            json_type(&other)
        )),
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
