//! Configuration module for the relay server
//!
//! Configuration comes from `.env` files, environment variables and an
//! optional YAML file. Priority: YAML > ENV vars > .env values > defaults.
//! The `.env` file is loaded in `main.rs` before anything else runs.
//!
//! The upstream API key is the only required value. Its absence is a fatal
//! startup error reported before any listener is bound.
//!
//! # Example
//! ```rust,no_run
//! use waav_relay::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config = ServerConfig::from_file(&PathBuf::from("config.yaml"))?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::core::realtime::openai::{
    OPENAI_REALTIME_URL, OpenAIRealtimeAudioFormat, OpenAIRealtimeModel, OpenAIRealtimeVoice,
    UpstreamConfig,
};
use crate::core::realtime::{
    ApiKey, DEFAULT_INSTRUCTIONS, Modality, ReconnectionConfig, SessionConfig,
};
use crate::core::relay::{NotConnectedPolicy, RelayConfig, RoutingMode};

mod yaml;

pub use yaml::{
    OpenAIYaml, ReconnectionYaml, RelayYaml, ServerYaml, SessionYaml, TokenLimitYaml, YamlConfig,
};

/// Default bind host
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default listen port
pub const DEFAULT_PORT: u16 = 5050;

/// Default capacity of the gateway -> upstream command queue
pub const DEFAULT_UPSTREAM_QUEUE_CAPACITY: usize = 256;

/// Default capacity of each client's outbound channel
pub const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The upstream credential is missing or empty
    #[error("OPENAI_API_KEY is not set; the relay cannot start without an upstream API key")]
    MissingApiKey,

    /// A value could not be parsed or is out of range
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    /// The YAML file could not be read
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The YAML file is malformed
    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn invalid(key: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        message: message.into(),
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // Upstream service
    /// Zeroized on drop
    pub openai_api_key: ApiKey,
    pub realtime_url: String,
    pub realtime_model: String,

    // Default session and reconnection policy
    pub session: SessionConfig,
    pub reconnection: ReconnectionConfig,

    // Relay behaviour
    pub routing_mode: RoutingMode,
    pub not_connected_policy: NotConnectedPolicy,
    pub upstream_queue_capacity: usize,
    pub client_channel_capacity: usize,
    pub eager_connect: bool,
    pub notify_turn_done: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns [`ConfigError::MissingApiKey`] when `OPENAI_API_KEY` is unset or
    /// empty, and [`ConfigError::InvalidValue`] for unparseable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(|key| std::env::var(key).ok(), None)
    }

    /// Load configuration from a YAML file with environment variables as the
    /// base layer.
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path)?;
        Self::load(|key| std::env::var(key).ok(), Some(yaml))
    }

    /// Build a configuration from an arbitrary variable lookup and optional
    /// YAML overrides.
    pub fn load<F>(lookup: F, yaml: Option<YamlConfig>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let yaml = yaml.unwrap_or_default();
        let server = yaml.server.unwrap_or_default();
        let openai = yaml.openai.unwrap_or_default();
        let session = yaml.session.unwrap_or_default();
        let reconnection = yaml.reconnection.unwrap_or_default();
        let relay = yaml.relay.unwrap_or_default();

        // Credential
        let api_key = openai
            .api_key
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env("OPENAI_API_KEY"))
            .map(ApiKey::new)
            .ok_or(ConfigError::MissingApiKey)?;

        // Server
        let host = server
            .host
            .or_else(|| env("HOST"))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = pick(server.port, &env, "PORT")?.unwrap_or(DEFAULT_PORT);

        // Upstream
        let realtime_url = openai
            .realtime_url
            .or_else(|| env("OPENAI_REALTIME_URL"))
            .unwrap_or_else(|| OPENAI_REALTIME_URL.to_string());
        let realtime_model = openai
            .model
            .or_else(|| env("OPENAI_REALTIME_MODEL"))
            .unwrap_or_else(|| OpenAIRealtimeModel::default().as_str().to_string());

        // Session
        let defaults = SessionConfig::default();
        let modalities = match session.modalities {
            Some(names) => parse_modalities(names.iter().map(String::as_str))?,
            None => match env("REALTIME_MODALITIES") {
                Some(raw) => parse_modalities(raw.split(','))?,
                None => defaults.modalities,
            },
        };
        let temperature = pick(session.temperature, &env, "REALTIME_TEMPERATURE")?
            .unwrap_or(defaults.temperature);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(invalid(
                "REALTIME_TEMPERATURE",
                format!("{temperature} is outside 0.0..=2.0"),
            ));
        }
        let max_output_tokens = match session.max_output_tokens {
            Some(TokenLimitYaml::Count(n)) => Some(n),
            Some(TokenLimitYaml::Keyword(word)) => parse_token_limit(&word)?,
            None => match env("REALTIME_MAX_OUTPUT_TOKENS") {
                Some(raw) => parse_token_limit(&raw)?,
                None => defaults.max_output_tokens,
            },
        };
        let voice: OpenAIRealtimeVoice =
            pick_enum(session.voice, &env, "REALTIME_VOICE")?.unwrap_or_default();
        let audio_format: OpenAIRealtimeAudioFormat =
            pick_enum(session.audio_format, &env, "REALTIME_AUDIO_FORMAT")?.unwrap_or_default();
        let session = SessionConfig {
            voice: voice.as_str().to_string(),
            instructions: session
                .instructions
                .or_else(|| env("REALTIME_INSTRUCTIONS"))
                .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string()),
            modalities,
            temperature,
            max_output_tokens,
            audio_format: audio_format.as_str().to_string(),
        };

        // Reconnection
        let base = ReconnectionConfig::default();
        let reconnection = ReconnectionConfig {
            initial_delay_ms: pick(reconnection.initial_delay_ms, &env, "RECONNECT_DELAY_MS")?
                .unwrap_or(base.initial_delay_ms),
            max_attempts: pick(reconnection.max_attempts, &env, "RECONNECT_MAX_ATTEMPTS")?
                .unwrap_or(base.max_attempts),
            backoff_multiplier: pick(
                reconnection.backoff_multiplier,
                &env,
                "RECONNECT_BACKOFF_MULTIPLIER",
            )?
            .unwrap_or(base.backoff_multiplier),
            max_delay_ms: pick(reconnection.max_delay_ms, &env, "RECONNECT_MAX_DELAY_MS")?
                .unwrap_or(base.max_delay_ms),
        };
        if reconnection.backoff_multiplier < 1.0 {
            return Err(invalid(
                "RECONNECT_BACKOFF_MULTIPLIER",
                "must be at least 1.0",
            ));
        }

        // Relay
        let routing_mode = pick_enum(relay.routing_mode, &env, "ROUTING_MODE")?.unwrap_or_default();
        let not_connected_policy =
            pick_enum(relay.not_connected_policy, &env, "NOT_CONNECTED_POLICY")?
                .unwrap_or_default();
        let upstream_queue_capacity =
            pick(relay.upstream_queue_capacity, &env, "UPSTREAM_QUEUE_CAPACITY")?
                .unwrap_or(DEFAULT_UPSTREAM_QUEUE_CAPACITY);
        if upstream_queue_capacity == 0 {
            return Err(invalid("UPSTREAM_QUEUE_CAPACITY", "must be greater than zero"));
        }
        let client_channel_capacity =
            pick(relay.client_channel_capacity, &env, "CLIENT_CHANNEL_CAPACITY")?
                .unwrap_or(DEFAULT_CLIENT_CHANNEL_CAPACITY);
        if client_channel_capacity == 0 {
            return Err(invalid("CLIENT_CHANNEL_CAPACITY", "must be greater than zero"));
        }
        let eager_connect = pick_bool(relay.eager_connect, &env, "EAGER_CONNECT")?.unwrap_or(true);
        let notify_turn_done =
            pick_bool(relay.notify_turn_done, &env, "NOTIFY_TURN_DONE")?.unwrap_or(true);

        Ok(Self {
            host,
            port,
            openai_api_key: api_key,
            realtime_url,
            realtime_model,
            session,
            reconnection,
            routing_mode,
            not_connected_policy,
            upstream_queue_capacity,
            client_channel_capacity,
            eager_connect,
            notify_turn_done,
        })
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Relay settings derived from this configuration.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            upstream: UpstreamConfig {
                api_key: self.openai_api_key.clone(),
                endpoint: self.realtime_url.clone(),
                model: self.realtime_model.clone(),
                reconnection: self.reconnection.clone(),
            },
            session: self.session.clone(),
            routing: self.routing_mode,
            not_connected: self.not_connected_policy,
            command_queue_capacity: self.upstream_queue_capacity,
            event_queue_capacity: self.upstream_queue_capacity,
            client_channel_capacity: self.client_channel_capacity,
            eager_connect: self.eager_connect,
            notify_turn_done: self.notify_turn_done,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// YAML value if present, else the parsed environment variable.
fn pick<T, E>(yaml: Option<T>, env: &E, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    E: Fn(&str) -> Option<String>,
{
    if yaml.is_some() {
        return Ok(yaml);
    }
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| invalid(key, format!("'{raw}': {e}")))
        })
        .transpose()
}

fn pick_enum<T, E>(yaml: Option<String>, env: &E, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr<Err = String>,
    E: Fn(&str) -> Option<String>,
{
    yaml.or_else(|| env(key))
        .map(|raw| raw.parse::<T>().map_err(|e| invalid(key, e)))
        .transpose()
}

fn pick_bool<E>(yaml: Option<bool>, env: &E, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    if yaml.is_some() {
        return Ok(yaml);
    }
    env(key)
        .map(|raw| match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, format!("'{raw}' is not a boolean"))),
        })
        .transpose()
}

fn parse_modalities<'a>(names: impl Iterator<Item = &'a str>) -> Result<Vec<Modality>, ConfigError> {
    let mut modalities = Vec::new();
    for name in names.map(str::trim).filter(|name| !name.is_empty()) {
        let modality = Modality::parse(name)
            .ok_or_else(|| invalid("REALTIME_MODALITIES", format!("unknown modality '{name}'")))?;
        if !modalities.contains(&modality) {
            modalities.push(modality);
        }
    }
    if modalities.is_empty() {
        return Err(invalid("REALTIME_MODALITIES", "at least one modality is required"));
    }
    Ok(modalities)
}

fn parse_token_limit(raw: &str) -> Result<Option<u32>, ConfigError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("inf") {
        return Ok(None);
    }
    raw.parse::<u32>()
        .map(Some)
        .map_err(|e| invalid("REALTIME_MAX_OUTPUT_TOKENS", format!("'{raw}': {e}")))
}
