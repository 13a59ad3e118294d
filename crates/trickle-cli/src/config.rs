//! Configuration file support

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use trickle_wire::EndpointConfig;

/// Environment variable consulted when no API key is configured
pub const API_KEY_ENV: &str = "TRICKLE_API_KEY";

/// Configuration for trickle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model identifier sent with every request
    pub model: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Completion token limit
    pub max_tokens: Option<u32>,
    /// System prompt prepended to every request
    pub system_prompt: Option<String>,
    /// Where conversations are stored
    pub data_dir: Option<PathBuf>,
    /// Completion endpoint
    pub endpoint: EndpointConfig,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trickle")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("TRICKLE_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(config) => config.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Ignoring config file: {:#}", e);
                Self::default()
            }
        }
    }

    /// Read a config file; `Ok(None)` when it does not exist
    pub fn load_from(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(config))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Write the example config if no config exists yet
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// Conversation storage directory
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(trickle_chat::JsonlLedger::default_dir)
    }

    /// Endpoint settings with the API key resolved from config, then env
    pub fn endpoint_config(&self) -> EndpointConfig {
        self.endpoint_config_with(std::env::var(API_KEY_ENV).ok())
    }

    fn endpoint_config_with(&self, env_key: Option<String>) -> EndpointConfig {
        let mut endpoint = self.endpoint.clone();
        if endpoint.api_key.as_deref().is_none_or(str::is_empty) {
            endpoint.api_key = env_key.filter(|k| !k.is_empty());
        }
        endpoint
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# trickle configuration file
# Place at ~/.config/trickle/config.toml (Linux/Mac) or %APPDATA%\trickle\config.toml (Windows)

# Model identifier sent with each request (optional)
# model = "llama-3-8b-instruct"

# Sampling parameters (optional)
# temperature = 0.7
# max_tokens = 1024

# System prompt prepended to every request (optional)
# system_prompt = "You are a concise assistant."

# Conversation storage (defaults to the platform data directory)
# data_dir = "/home/me/.local/share/trickle/conversations"

[endpoint]
base_url = "http://localhost:8000"
path = "/v1/chat/completions"

# Append the conversation id as a trailing path segment
conversation_scoped = false

# Sent as the `user` query parameter (optional)
# user = "me"

# Bearer token (optional - TRICKLE_API_KEY is used when unset)
# api_key = "..."

# Whole-request timeout in seconds (optional)
# timeout_secs = 300

# Extra request headers (optional)
# [endpoint.headers]
# x-team = "blue"
"#
}
