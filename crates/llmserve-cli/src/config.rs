//! CLI configuration.
//!
//! Settings are read from `~/.config/llmserve/config.toml` (or `--config`),
//! then overridden by the environment and finally by command-line flags.
//! Every key is optional.
//!
//! ## Example Configuration
//!
//! ```toml
//! model = "qwen3:0.6b"
//! host = "localhost"
//! port = 11434
//! log_level = "info"
//!
//! [orchestration]
//! max_rounds = 10
//! tool_timeout_secs = 5
//!
//! [tools]
//! code_interpreter = false
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use llmserve::{
    CatFileTool, CodeInterpreterTool, Config, CoreConfig, CurrencyConverterTool, CurrentTimeTool,
    DEFAULT_MODEL, DEFAULT_OLLAMA_HOST, DEFAULT_OLLAMA_PORT, ParsePdfTool, RandomNumberTool,
    TemperatureTool, ToolImplementation, ToolRegistry, ollama_base_url,
};

/// Environment variables that override the file.
pub const ENV_MODEL: &str = "MODEL_NAME";
pub const ENV_HOST: &str = "OLLAMA_HOST";
pub const ENV_PORT: &str = "OLLAMA_PORT";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// CLI configuration loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Model served by the backend.
    #[serde(default = "default_model")]
    pub model: String,

    /// Host of the Ollama server.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the Ollama server.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log filter handed to `env_logger` when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Replaces the built-in system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Request timeout in seconds.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    #[serde(default)]
    pub orchestration: OrchestrationSettings,

    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Limits of the tool-calling loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationSettings {
    /// Tool rounds before giving up (default: 10)
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Per-call tool budget in seconds (default: 5)
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Tools running at once (default: 4)
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,

    /// Retries of an unreachable backend (default: 2)
    #[serde(default = "default_max_backend_retries")]
    pub max_backend_retries: usize,

    /// Wall-clock budget for a whole answer, in seconds.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            tool_timeout_secs: default_tool_timeout_secs(),
            max_concurrent_tools: default_max_concurrent_tools(),
            max_backend_retries: default_max_backend_retries(),
            deadline_secs: None,
        }
    }
}

/// Which built-in tools are offered to the model. All are on by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ToolsConfig {
    #[serde(default = "enabled")]
    pub temperature: bool,
    #[serde(default = "enabled")]
    pub current_time: bool,
    #[serde(default = "enabled")]
    pub currency: bool,
    #[serde(default = "enabled")]
    pub code_interpreter: bool,
    #[serde(default = "enabled")]
    pub parse_pdf: bool,
    #[serde(default = "enabled")]
    pub random_number: bool,
    #[serde(default = "enabled")]
    pub cat_file: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            temperature: true,
            current_time: true,
            currency: true,
            code_interpreter: true,
            parse_pdf: true,
            random_number: true,
            cat_file: true,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_host() -> String {
    DEFAULT_OLLAMA_HOST.to_string()
}

const fn default_port() -> u16 {
    DEFAULT_OLLAMA_PORT
}

fn default_log_level() -> String {
    "warn".to_string()
}

const fn default_max_rounds() -> usize {
    10
}

const fn default_tool_timeout_secs() -> u64 {
    5
}

const fn default_max_concurrent_tools() -> usize {
    4
}

const fn default_max_backend_retries() -> usize {
    2
}

const fn enabled() -> bool {
    true
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            system_prompt: None,
            request_timeout_secs: None,
            orchestration: OrchestrationSettings::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl CliConfig {
    /// Loads the configuration and applies environment overrides.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file named explicitly is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// environment override is malformed. Call [`CliConfig::validate`] once
    /// command-line flags have been applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Returns the default configuration file path.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("llmserve").join("config.toml"))
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Applies `MODEL_NAME`, `OLLAMA_HOST`, `OLLAMA_PORT` and `LOG_LEVEL`.
    ///
    /// # Errors
    ///
    /// Returns an error if `OLLAMA_PORT` is not a port number.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(model) = non_empty(ENV_MODEL) {
            self.model = model;
        }
        if let Some(host) = non_empty(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = non_empty(ENV_PORT) {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PORT} is not a valid port: {port}"))?;
        }
        if let Some(level) = non_empty(ENV_LOG_LEVEL) {
            self.log_level = level.to_lowercase();
        }
        Ok(())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The model name or host is empty
    /// - The port is zero
    /// - The log level is not a known level
    /// - An orchestration limit is zero
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            bail!("Model name must not be empty");
        }
        if self.host.trim().is_empty() {
            bail!("Host must not be empty");
        }
        if self.port == 0 {
            bail!("Port must not be zero");
        }
        if LevelFilter::from_str(&self.log_level).is_err() {
            bail!("Unknown log level '{}'", self.log_level);
        }

        let limits = &self.orchestration;
        if limits.max_rounds == 0 {
            bail!("orchestration.max_rounds must be at least 1");
        }
        if limits.tool_timeout_secs == 0 {
            bail!("orchestration.tool_timeout_secs must be at least 1");
        }
        if limits.max_concurrent_tools == 0 {
            bail!("orchestration.max_concurrent_tools must be at least 1");
        }
        Ok(())
    }

    /// Backend settings for the configured Ollama server.
    pub fn client_config(&self) -> Config {
        let config = Config::ollama(&self.model).with_base_url(ollama_base_url(&self.host, self.port));
        match self.request_timeout_secs {
            Some(secs) => config.with_timeout(secs),
            None => config,
        }
    }

    /// Loop limits for the orchestration core.
    pub fn core_config(&self) -> CoreConfig {
        let limits = &self.orchestration;
        let config = CoreConfig::default()
            .with_max_rounds(limits.max_rounds)
            .with_tool_timeout(Duration::from_secs(limits.tool_timeout_secs))
            .with_max_concurrent_tools(limits.max_concurrent_tools)
            .with_max_backend_retries(limits.max_backend_retries);
        match limits.deadline_secs {
            Some(secs) => config.with_deadline(Duration::from_secs(secs)),
            None => config,
        }
    }
}

impl ToolsConfig {
    /// Instances of the enabled built-in tools, in a stable order.
    pub fn enabled_tools(&self) -> Vec<Arc<dyn ToolImplementation>> {
        let mut tools: Vec<Arc<dyn ToolImplementation>> = Vec::new();

        if self.temperature {
            tools.push(Arc::new(TemperatureTool::new()));
        }
        if self.current_time {
            tools.push(Arc::new(CurrentTimeTool));
        }
        if self.currency {
            tools.push(Arc::new(CurrencyConverterTool));
        }
        if self.code_interpreter {
            tools.push(Arc::new(CodeInterpreterTool::new()));
        }
        if self.parse_pdf {
            tools.push(Arc::new(ParsePdfTool::new()));
        }
        if self.random_number {
            tools.push(Arc::new(RandomNumberTool));
        }
        if self.cat_file {
            tools.push(Arc::new(CatFileTool::new()));
        }

        tools
    }

    /// A registry holding the enabled tools.
    ///
    /// # Errors
    ///
    /// Returns an error if a tool definition fails validation.
    pub fn registry(&self) -> Result<ToolRegistry> {
        let registry = ToolRegistry::new();
        for tool in self.enabled_tools() {
            registry.register(tool).context("Failed to register built-in tool")?;
        }
        Ok(registry)
    }
}
