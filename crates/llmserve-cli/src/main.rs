//! llmserve CLI - chat with a local model that can call tools
//!
//! Talks to an OpenAI-compatible server (Ollama by default). Without a
//! subcommand it starts an interactive REPL; `ask` answers one message and
//! exits; `tools` prints the tool schemas sent to the model.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;

use llmserve::{Agent, ChatOptions, OpenAIClient};

mod config;
mod display;
mod repl;

use config::CliConfig;
use display::Renderer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    /// (default: ~/.config/llmserve/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model to use for chat completion
    #[arg(long, global = true)]
    model: Option<String>,

    /// Host of the Ollama server
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port of the Ollama server
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Do not offer tools to the model
    #[arg(long, global = true)]
    no_tools: bool,

    /// Print the final answer only, instead of streaming
    #[arg(long, global = true)]
    no_stream: bool,

    /// Print one JSON record per chunk
    #[arg(long, global = true)]
    json: bool,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start an interactive conversation (default)
    Chat,
    /// Answer a single message and exit
    Ask {
        /// The message to send
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Print the tool definitions offered to the model
    Tools,
}

impl Args {
    fn apply(&self, config: &mut CliConfig) {
        if let Some(model) = &self.model {
            config.model.clone_from(model);
        }
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.to_lowercase();
        }
    }

    const fn options(&self) -> ChatOptions {
        ChatOptions {
            use_tools: !self.no_tools,
            stream: !self.no_stream,
        }
    }
}

fn build_agent(config: &CliConfig) -> Result<Agent<OpenAIClient>> {
    let client =
        OpenAIClient::new(config.client_config()).context("Failed to create backend client")?;
    let registry = Arc::new(config.tools.registry()?);

    let agent = match &config.system_prompt {
        Some(prompt) => Agent::with_system_prompt(client, registry, prompt.clone()),
        None => Agent::new(client, registry),
    };
    Ok(agent.with_config(config.core_config()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = CliConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    env_logger::Builder::from_env(Env::default().default_filter_or(&config.log_level)).init();
    info!(
        "Using model {} at {}:{}",
        config.model, config.host, config.port
    );

    let mut renderer = Renderer::stdout(args.json);
    let options = args.options();

    match &args.command {
        Some(Command::Tools) => {
            let registry = config.tools.registry()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&registry.list_definitions())?
            );
        }
        Some(Command::Ask { message }) => {
            let mut agent = build_agent(&config)?;
            let message = message.join(" ");
            if let Err(e) = repl::answer(&mut agent, &message, options, &mut renderer).await {
                if renderer.is_json() {
                    renderer.render_error(&format!("{e:#}"))?;
                }
                return Err(e);
            }
        }
        Some(Command::Chat) | None => {
            let mut agent = build_agent(&config)?;
            repl::run_repl(&mut agent, options, &mut renderer).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "llmserve",
            "--model",
            "qwen3:8b",
            "--port",
            "9000",
            "--no-tools",
            "ask",
            "hello",
            "there",
        ]);
        let mut config = CliConfig::default();
        args.apply(&mut config);

        assert_eq!(config.model, "qwen3:8b");
        assert_eq!(config.port, 9000);
        assert!(!args.options().use_tools);
        assert!(args.options().stream);
        assert!(matches!(args.command, Some(Command::Ask { ref message }) if message.join(" ") == "hello there"));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from(["llmserve", "chat", "--json", "--no-stream"]);
        assert!(args.json);
        assert!(!args.options().stream);
        assert!(matches!(args.command, Some(Command::Chat)));
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
