//! Display utilities for CLI output formatting
//!
//! Renders streamed chunks either for a terminal (thinking dimmed, tool
//! calls and results coloured) or as one JSON record per line.

use std::io::{self, Write};

use anyhow::Result;
use colored::Colorize;

use llmserve::{StreamChunk, ToolCall, ToolResult};

const RESULT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Thinking,
    Tools,
    Content,
}

/// Writes chunks of an answer as they arrive.
#[derive(Debug)]
pub struct Renderer<W: Write> {
    out: W,
    json: bool,
    section: Section,
}

impl Renderer<io::Stdout> {
    pub fn stdout(json: bool) -> Self {
        Self::new(io::stdout(), json)
    }
}

impl<W: Write> Renderer<W> {
    pub const fn new(out: W, json: bool) -> Self {
        Self {
            out,
            json,
            section: Section::None,
        }
    }

    pub const fn is_json(&self) -> bool {
        self.json
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Renders one chunk. `Done` closes the answer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the output fails.
    pub fn render(&mut self, chunk: &StreamChunk) -> Result<()> {
        if self.json {
            serde_json::to_writer(&mut self.out, &chunk.to_record())?;
            writeln!(self.out)?;
            return Ok(self.out.flush()?);
        }

        match chunk {
            StreamChunk::Thinking(text) => {
                self.enter(Section::Thinking)?;
                write!(self.out, "{}", text.dimmed())?;
            }
            StreamChunk::ToolCall(call) => {
                self.enter(Section::Tools)?;
                self.tool_call_request(call)?;
            }
            StreamChunk::ToolResult(result) => {
                self.enter(Section::Tools)?;
                self.tool_result(result)?;
            }
            StreamChunk::Content(text) => {
                self.enter(Section::Content)?;
                write!(self.out, "{text}")?;
            }
            StreamChunk::Done => {
                if self.section != Section::None {
                    writeln!(self.out)?;
                }
                self.section = Section::None;
            }
        }
        Ok(self.out.flush()?)
    }

    /// Reports a failed answer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the output fails.
    pub fn render_error(&mut self, message: &str) -> Result<()> {
        if self.json {
            let record = serde_json::json!({ "type": "error", "content": message });
            serde_json::to_writer(&mut self.out, &record)?;
            writeln!(self.out)?;
        } else {
            if self.section != Section::None {
                writeln!(self.out)?;
            }
            writeln!(self.out, "{} {message}", "Error:".bright_red())?;
        }
        self.section = Section::None;
        Ok(self.out.flush()?)
    }

    fn enter(&mut self, section: Section) -> io::Result<()> {
        if self.section == section {
            return Ok(());
        }
        if self.section != Section::None {
            writeln!(self.out)?;
        }
        match section {
            Section::Thinking => writeln!(self.out, "{}", "╭─ thinking".bright_black())?,
            Section::Content => writeln!(self.out, "{}", "╭─● Assistant".bright_magenta().bold())?,
            Section::Tools | Section::None => {}
        }
        self.section = section;
        Ok(())
    }

    fn tool_call_request(&mut self, call: &ToolCall) -> io::Result<()> {
        writeln!(
            self.out,
            "{} {}",
            "├─○ Tool Call:".bright_yellow(),
            call.function.name.bright_green()
        )?;

        if let Ok(args) = serde_json::from_str::<serde_json::Value>(call.function.arguments_json())
            && let Some(obj) = args.as_object()
        {
            for (key, value) in obj {
                writeln!(self.out, "│    {}: {value}", key.cyan())?;
            }
        }
        Ok(())
    }

    fn tool_result(&mut self, result: &ToolResult) -> io::Result<()> {
        let label = match result.error() {
            None => format!("├─✓ {}", result.name).bright_green(),
            Some(failure) => format!("├─✗ {} ({})", result.name, failure.kind).bright_red(),
        };
        writeln!(self.out, "{label}")?;
        writeln!(self.out, "│    {}", truncate(&result.content(), RESULT_PREVIEW_CHARS))
    }
}

/// Shortens `text` to `max_chars` characters, noting the full length.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}... ({} chars)", &text[..cut], text.chars().count()),
        None => text.to_string(),
    }
}
