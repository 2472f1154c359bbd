//! REPL mode for interactive conversations.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use colored::Colorize;
use futures::StreamExt;
use log::{debug, warn};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio_util::sync::CancellationToken;

use llmserve::{Agent, ChatOptions, CoreError, ErrorKind, LLMClient, Reply, StreamChunk};

use crate::display::Renderer;

/// Answers one message, rendering chunks as they arrive.
///
/// Ctrl-C while the answer is produced cancels it; the run then fails with
/// [`ErrorKind::Cancelled`].
///
/// # Errors
///
/// Returns the error that ended the run, or a write error.
pub async fn answer<C: LLMClient, W: Write>(
    agent: &mut Agent<C>,
    message: &str,
    options: ChatOptions,
    renderer: &mut Renderer<W>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    agent.set_cancellation(cancel.clone());
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = async {
        match agent.respond(message, options).await? {
            Reply::Text(text) => {
                renderer.render(&StreamChunk::Content(text))?;
                renderer.render(&StreamChunk::Done)?;
            }
            Reply::Stream(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    renderer.render(&chunk?)?;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    interrupt.abort();
    outcome
}

/// True when `error` is a run the user interrupted.
pub fn is_cancelled(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<CoreError>()
        .is_some_and(|e| e.kind() == ErrorKind::Cancelled)
}

/// What a line typed at the prompt asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Empty,
    Message(&'a str),
    Reset,
    Tools,
    Help,
    Quit,
    Unknown(&'a str),
}

impl<'a> Input<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Message(line);
        };
        match command.split_whitespace().next().unwrap_or_default() {
            "reset" | "clear" => Self::Reset,
            "tools" => Self::Tools,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Unknown(line),
        }
    }
}

fn history_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("llmserve").join("history.txt"))
}

fn print_help() {
    println!("{}", "Commands:".bright_cyan().bold());
    println!("  {} - Start a new conversation", "/reset".bright_yellow());
    println!("  {} - List the tools offered to the model", "/tools".bright_yellow());
    println!("  {} - Show this help message", "/help".bright_yellow());
    println!("  {} - Exit (or Ctrl-D)", "/quit".bright_yellow());
    println!();
}

fn print_tools<C: LLMClient>(agent: &Agent<C>) {
    let tools = agent.core().registry.list_definitions();
    if tools.is_empty() {
        println!("{}", "No tools registered.".dimmed());
        return;
    }
    for tool in tools {
        println!(
            "  {} - {}",
            tool.function.name.bright_green(),
            tool.function.description
        );
    }
}

/// Runs the REPL loop.
///
/// # Errors
///
/// Returns an error if the line editor cannot be initialised.
pub async fn run_repl<C: LLMClient>(
    agent: &mut Agent<C>,
    options: ChatOptions,
    renderer: &mut Renderer<std::io::Stdout>,
) -> Result<()> {
    println!("{}", "llmserve".bright_magenta().bold());
    println!(
        "{}",
        format!("model {} · /help for commands · Ctrl-D to exit", agent.core().client.config().model)
            .dimmed()
    );
    println!();

    let mut rl = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history
        && rl.load_history(path).is_err()
    {
        debug!("No previous history at {}", path.display());
    }

    loop {
        let readline = rl.readline(&format!("{} ", ">".bright_green()));

        match readline {
            Ok(line) => match Input::parse(&line) {
                Input::Empty => {}
                Input::Quit => break,
                Input::Help => print_help(),
                Input::Tools => print_tools(agent),
                Input::Reset => {
                    agent.reset_conversation();
                    println!("{}", "Conversation cleared.".dimmed());
                }
                Input::Unknown(command) => {
                    eprintln!(
                        "{} Unknown command: {command}\nType /help for available commands",
                        "Error:".bright_red()
                    );
                }
                Input::Message(message) => {
                    let _ = rl.add_history_entry(message);
                    if let Err(e) = answer(agent, message, options, renderer).await {
                        if is_cancelled(&e) {
                            println!("\n{}", "Interrupted".dimmed());
                        } else {
                            renderer.render_error(&format!("{e:#}"))?;
                        }
                    }
                }
            },
            Err(ReadlineError::Interrupted) => {
                println!("{}", "Ctrl-D to exit".dimmed());
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {err}");
                break;
            }
        }
    }

    if let Some(path) = &history {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = rl.save_history(path) {
            warn!("Failed to save history to {}: {e}", path.display());
        }
    }
    println!("Goodbye!");

    Ok(())
}
