use serde::Deserialize;
use std::path::Path;

use super::ConfigError;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here take priority over environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 5050
///
/// openai:
///   api_key: "sk-..."
///   realtime_url: "wss://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview-2024-10-01"
///
/// session:
///   voice: "alloy"
///   instructions: "You are a helpful personal assistant."
///   modalities: ["text", "audio"]
///   temperature: 0.5
///   max_output_tokens: 500      # or "inf"
///   audio_format: "pcm16"
///
/// reconnection:
///   initial_delay_ms: 5000
///   max_attempts: 0             # 0 = unlimited
///   backoff_multiplier: 1.0
///   max_delay_ms: 60000
///
/// relay:
///   routing_mode: "turn_owner"  # or "broadcast"
///   not_connected_policy: "reopen"
///   upstream_queue_capacity: 256
///   client_channel_capacity: 1024
///   eager_connect: true
///   notify_turn_done: true
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub openai: Option<OpenAIYaml>,
    pub session: Option<SessionYaml>,
    pub reconnection: Option<ReconnectionYaml>,
    pub relay: Option<RelayYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Upstream service settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OpenAIYaml {
    pub api_key: Option<String>,
    pub realtime_url: Option<String>,
    pub model: Option<String>,
}

/// Output token limit: a count or the keyword `inf`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenLimitYaml {
    Count(u32),
    Keyword(String),
}

/// Default session configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub modalities: Option<Vec<String>>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<TokenLimitYaml>,
    pub audio_format: Option<String>,
}

/// Reconnection policy from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectionYaml {
    pub initial_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub backoff_multiplier: Option<f32>,
    pub max_delay_ms: Option<u64>,
}

/// Relay behaviour from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RelayYaml {
    pub routing_mode: Option<String>,
    pub not_connected_policy: Option<String>,
    pub upstream_queue_capacity: Option<usize>,
    pub client_channel_capacity: Option<usize>,
    pub eager_connect: Option<bool>,
    pub notify_turn_done: Option<bool>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&contents)
    }

    /// Parse YAML configuration from a string
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }
}
