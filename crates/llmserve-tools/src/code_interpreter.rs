//! Python snippet execution in a child process.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde_json::{Value, json};
use tokio::process::Command;

use crate::ToolImplementation;
use llmserve_common::{Parameters, Property, Tool};

/// Marks the line on which the harness reports the snippet's result.
const RESULT_MARKER: char = '\u{1e}';

/// Runs the snippet passed as `argv[1]` and prints the value of `result`
/// (or the first other conventional answer variable) on a marked line.
const HARNESS: &str = r#"import datetime, json, math, random, re, sys
ns = {"math": math, "sqrt": math.sqrt, "random": random, "datetime": datetime, "sys": sys, "re": re, "json": json}
exec(compile(sys.argv[1], "<code>", "exec"), ns)
result = ns.get("result")
if result is None:
    for name in ("A", "total", "sum", "output", "answer", "final", "value"):
        if name in ns and not callable(ns[name]):
            result = ns[name]
            break
sys.stdout.flush()
print("\x1e" + json.dumps(result, default=repr))
"#;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Strips markdown fences and rewrites `^` exponentiation to `**`.
fn normalize_code(code: &str) -> String {
    let mut code = code.trim();

    if let Some(rest) = code.strip_prefix("```") {
        code = match rest.find('\n') {
            Some(newline)
                if rest[..newline]
                    .trim()
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric()) =>
            {
                &rest[newline + 1..]
            }
            _ => rest,
        };
    }
    code = code.trim_end();
    if let Some(rest) = code.strip_suffix("```") {
        code = rest;
    }

    code.trim().replace('^', "**")
}

/// Executes Python code with `python3 -c` and reports its output.
///
/// Successful runs return `{result, output, stderr, success: true}`. Python
/// exceptions are not tool failures: they come back as
/// `{error, error_type, traceback, success: false}` so the model can fix its
/// code. The child is killed when the sandbox abandons the call.
#[derive(Debug, Clone)]
pub struct CodeInterpreterTool {
    interpreter: String,
}

impl Default for CodeInterpreterTool {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeInterpreterTool {
    #[must_use]
    pub fn new() -> Self {
        Self::with_interpreter("python3")
    }

    pub fn with_interpreter(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

fn non_empty(text: &str) -> Value {
    if text.is_empty() {
        Value::Null
    } else {
        json!(text)
    }
}

fn parse_output(stdout: &str, stderr: &str, success: bool) -> Value {
    if !success {
        let last_line = stderr.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or("");
        let (error_type, error) = match last_line.split_once(": ") {
            Some((kind, message))
                if !kind.is_empty() && kind.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') =>
            {
                (kind, message)
            }
            _ => ("Error", last_line),
        };
        return json!({
            "error": error,
            "error_type": error_type,
            "traceback": stderr,
            "success": false,
        });
    }

    let (output, result) = match stdout.rfind(RESULT_MARKER) {
        Some(index) => {
            let result = serde_json::from_str(stdout[index + RESULT_MARKER.len_utf8()..].trim())
                .unwrap_or(Value::Null);
            (&stdout[..index], result)
        }
        None => (stdout, Value::Null),
    };

    json!({
        "result": result,
        "output": non_empty(output),
        "stderr": non_empty(stderr),
        "success": true,
    })
}

#[async_trait]
impl ToolImplementation for CodeInterpreterTool {
    fn get_definition(&self) -> Tool {
        Tool::function(
            "code_interpreter",
            "Execute Python code for calculations and data processing. You MUST use this tool to perform any complex calculations or data processing.",
            Parameters::from_fields([("code", Property::string("Python code to execute"), true)]),
        )
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let code = args
            .get("code")
            .and_then(Value::as_str)
            .context("Missing 'code' parameter")?;
        let code = normalize_code(code);
        debug!("Running {} bytes of Python", code.len());

        let output = Command::new(&self.interpreter)
            .arg("-c")
            .arg(HARNESS)
            .arg(&code)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to start '{}'", self.interpreter))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(parse_output(&stdout, &stderr, output.status.success()))
    }

    fn timeout(&self) -> Option<Duration> {
        Some(DEFAULT_TIMEOUT)
    }
}
