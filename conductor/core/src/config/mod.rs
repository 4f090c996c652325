//! TOML Configuration File Support
//!
//! Centralized configuration loading for the Conductor and its daemon,
//! supporting a TOML configuration file at `~/.config/conductor/conductor.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`CONDUCTOR_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/conductor/conductor.toml` (typically `~/.config/conductor/conductor.toml`)
//! - messages default to `$XDG_DATA_HOME/conductor`
//!
//! # Example Configuration
//!
//! ```toml
//! [model]
//! model = "ggml-vicuna1.17b-q5_1.bin"
//! temperature = 0.2
//! top_p = 0.95
//! top_k = 40
//! max_output_tokens = 1024
//! label = "Assistant"
//!
//! [context]
//! max_context_tokens = 2048
//! encoding = "heuristic"
//! prompt_prefix = "You are a helpful assistant."
//!
//! [backend]
//! base_url = "http://localhost:8000"
//! timeout_secs = 300
//!
//! [session]
//! snapshot_interval_ms = 500
//! request_timeout_secs = 120
//! generate_titles = true
//!
//! [storage]
//! data_dir = "/var/lib/conductor"
//!
//! [daemon]
//! socket_path = "/run/user/1000/conductor.sock"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendConfig;
use crate::budget::{ContextLimits, DEFAULT_MAX_CONTEXT_TOKENS, DEFAULT_MAX_RESPONSE_TOKENS};
use crate::conductor::{ConductorConfig, ModelOptions};
use crate::tokens::{EncodingRegistry, DEFAULT_ENCODING};

/// Default model identifier
pub const DEFAULT_MODEL: &str = "ggml-vicuna1.17b-q5_1.bin";

/// Default label of user messages
pub const DEFAULT_USER_LABEL: &str = "User";

/// Default label of assistant messages
pub const DEFAULT_MODEL_LABEL: &str = "Assistant";

/// Default endpoint name recorded on conversations
pub const DEFAULT_ENDPOINT: &str = "llama";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Token limits do not fit together
    #[error(
        "Invalid token budget: prompt ({prompt}) + response ({response}) must be positive and fit the context window ({context})"
    )]
    InvalidBudget {
        /// Context window
        context: usize,
        /// Reserved reply tokens
        response: usize,
        /// Prompt budget
        prompt: usize,
    },

    /// No encoding registered under this name
    #[error("Unknown token encoding: {0}")]
    UnknownEncoding(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Model section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelToml {
    /// Model identifier sent to the backend
    pub model: Option<String>,

    /// Sampling temperature
    pub temperature: Option<f32>,

    /// Nucleus sampling
    pub top_p: Option<f32>,

    /// Top-k sampling
    pub top_k: Option<u32>,

    /// Tokens reserved for the reply
    pub max_output_tokens: Option<usize>,

    /// Sender label stored on assistant messages
    pub label: Option<String>,
}

/// Context section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextToml {
    /// Model context window
    pub max_context_tokens: Option<usize>,

    /// Prompt budget (defaults to context minus output)
    pub max_prompt_tokens: Option<usize>,

    /// Token encoding name
    pub encoding: Option<String>,

    /// System prefix sent ahead of every thread
    pub prompt_prefix: Option<String>,
}

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Base URL of the OpenAI-compatible server
    pub base_url: Option<String>,

    /// Bearer token
    pub api_key: Option<String>,

    /// HTTP timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Endpoint name recorded on conversations
    pub endpoint: Option<String>,
}

/// Session section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Minimum interval between streamed snapshot saves
    pub snapshot_interval_ms: Option<u64>,

    /// Cancel requests running longer than this (0 = never)
    pub request_timeout_secs: Option<u64>,

    /// Derive titles for new conversations
    pub generate_titles: Option<bool>,

    /// Maximum question length in characters
    pub max_input_length: Option<usize>,

    /// Sender label stored on user messages
    pub user_label: Option<String>,
}

/// Storage section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageToml {
    /// Directory for message logs and conversation documents
    pub data_dir: Option<PathBuf>,

    /// Keep everything in memory instead
    pub in_memory: Option<bool>,
}

/// Daemon section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonToml {
    /// Unix socket path
    pub socket_path: Option<PathBuf>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorToml {
    /// Model section
    pub model: ModelToml,

    /// Context section
    pub context: ContextToml,

    /// Backend section
    pub backend: BackendToml,

    /// Session section
    pub session: SessionToml,

    /// Storage section
    pub storage: StorageToml,

    /// Daemon section
    pub daemon: DaemonToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration
///
/// Consolidates all sources and tracks where values came from. Use
/// [`load_config`] to load with priority handling, then
/// [`ConfigFile::conductor_config`] to validate the Conductor's part.
#[derive(Clone, Debug)]
pub struct ConfigFile {
    /// Model identifier
    pub model: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Nucleus sampling
    pub top_p: f32,

    /// Top-k sampling
    pub top_k: Option<u32>,

    /// Tokens reserved for the reply
    pub max_output_tokens: usize,

    /// Model context window
    pub max_context_tokens: usize,

    /// Explicit prompt budget
    pub max_prompt_tokens: Option<usize>,

    /// Token encoding name
    pub encoding: String,

    /// System prefix
    pub prompt_prefix: Option<String>,

    /// Label of user messages
    pub user_label: String,

    /// Label of assistant messages
    pub model_label: String,

    /// Endpoint name recorded on conversations
    pub endpoint: String,

    /// Backend connection
    pub backend: BackendConfig,

    /// Snapshot save interval
    pub snapshot_interval: Duration,

    /// Request timeout
    pub request_timeout: Option<Duration>,

    /// Derive conversation titles
    pub generate_titles: bool,

    /// Maximum question length in characters
    pub max_input_length: usize,

    /// Storage directory
    pub data_dir: PathBuf,

    /// Use in-memory storage
    pub in_memory: bool,

    /// Daemon socket path
    pub socket_path: PathBuf,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            top_p: 0.95,
            top_k: Some(40),
            max_output_tokens: DEFAULT_MAX_RESPONSE_TOKENS,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            max_prompt_tokens: None,
            encoding: DEFAULT_ENCODING.to_string(),
            prompt_prefix: None,
            user_label: DEFAULT_USER_LABEL.to_string(),
            model_label: DEFAULT_MODEL_LABEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            backend: BackendConfig::default(),
            snapshot_interval: Duration::from_millis(500),
            request_timeout: None,
            generate_titles: true,
            max_input_length: 32768,
            data_dir: default_data_dir(),
            in_memory: false,
            socket_path: default_socket_path(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Validate and build the Conductor's configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the token budget does not fit, the encoding
    /// is unknown, or a sampling parameter is out of range.
    pub fn conductor_config(&self) -> Result<ConductorConfig, ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ConfigError::ValidationError(format!(
                "top_p must be within 0.0..=1.0, got {}",
                self.top_p
            )));
        }
        if self.max_input_length == 0 {
            return Err(ConfigError::ValidationError(
                "max_input_length must be positive".to_string(),
            ));
        }
        if !EncodingRegistry::global().contains(&self.encoding) {
            return Err(ConfigError::UnknownEncoding(self.encoding.clone()));
        }

        let limits = ContextLimits::new(
            self.max_context_tokens,
            self.max_output_tokens,
            self.max_prompt_tokens,
        )?;

        Ok(ConductorConfig {
            model: ModelOptions {
                model: self.model.clone(),
                temperature: self.temperature,
                top_p: self.top_p,
                top_k: self.top_k,
            },
            limits,
            encoding: self.encoding.clone(),
            prompt_prefix: self.prompt_prefix.clone(),
            user_label: self.user_label.clone(),
            model_label: self.model_label.clone(),
            endpoint: self.endpoint.clone(),
            snapshot_interval: self.snapshot_interval,
            request_timeout: self.request_timeout,
            generate_titles: self.generate_titles,
            max_input_length: self.max_input_length,
        })
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/conductor/conductor.toml` or
/// `~/.config/conductor/conductor.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("conductor").join("conductor.toml"))
}

/// Default storage directory
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("conductor"))
        .unwrap_or_else(|| std::env::temp_dir().join("conductor"))
}

/// Default daemon socket path
#[must_use]
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("conductor.sock")
}

/// Load configuration from all sources with proper priority
///
/// CLI overrides are not handled here; apply [`ConfigOverrides`] after.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ConfigFile, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<ConfigFile, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConductorToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ConfigFile, toml: &ConductorToml) {
    // Model
    if let Some(ref model) = toml.model.model {
        config.model = model.clone();
    }
    if let Some(temperature) = toml.model.temperature {
        config.temperature = temperature;
    }
    if let Some(top_p) = toml.model.top_p {
        config.top_p = top_p;
    }
    if toml.model.top_k.is_some() {
        config.top_k = toml.model.top_k;
    }
    if let Some(tokens) = toml.model.max_output_tokens {
        config.max_output_tokens = tokens;
    }
    if let Some(ref label) = toml.model.label {
        config.model_label = label.clone();
    }

    // Context
    if let Some(tokens) = toml.context.max_context_tokens {
        config.max_context_tokens = tokens;
    }
    if toml.context.max_prompt_tokens.is_some() {
        config.max_prompt_tokens = toml.context.max_prompt_tokens;
    }
    if let Some(ref encoding) = toml.context.encoding {
        config.encoding = encoding.clone();
    }
    if toml.context.prompt_prefix.is_some() {
        config.prompt_prefix = toml.context.prompt_prefix.clone();
    }

    // Backend
    if let Some(ref url) = toml.backend.base_url {
        config.backend.base_url = url.clone();
    }
    if toml.backend.api_key.is_some() {
        config.backend.api_key = toml.backend.api_key.clone();
    }
    if let Some(secs) = toml.backend.timeout_secs {
        config.backend.timeout_secs = secs;
    }
    if let Some(ref endpoint) = toml.backend.endpoint {
        config.endpoint = endpoint.clone();
    }

    // Session
    if let Some(ms) = toml.session.snapshot_interval_ms {
        config.snapshot_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.session.request_timeout_secs {
        config.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(enabled) = toml.session.generate_titles {
        config.generate_titles = enabled;
    }
    if let Some(length) = toml.session.max_input_length {
        config.max_input_length = length;
    }
    if let Some(ref label) = toml.session.user_label {
        config.user_label = label.clone();
    }

    // Storage
    if let Some(ref dir) = toml.storage.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(in_memory) = toml.storage.in_memory {
        config.in_memory = in_memory;
    }

    // Daemon
    if let Some(ref path) = toml.daemon.socket_path {
        config.socket_path = path.clone();
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut ConfigFile, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut touched = false;
    let mut lookup = |key: &str| -> Option<String> {
        let value = env(key)?;
        touched = true;
        Some(value)
    };

    if let Some(model) = lookup("CONDUCTOR_MODEL") {
        config.model = model;
    }
    if let Some(t) = lookup("CONDUCTOR_TEMPERATURE").and_then(|v| v.parse().ok()) {
        config.temperature = t;
    }
    if let Some(p) = lookup("CONDUCTOR_TOP_P").and_then(|v| v.parse().ok()) {
        config.top_p = p;
    }
    if let Some(k) = lookup("CONDUCTOR_TOP_K").and_then(|v| v.parse().ok()) {
        config.top_k = Some(k);
    }
    if let Some(n) = lookup("CONDUCTOR_MAX_OUTPUT_TOKENS").and_then(|v| v.parse().ok()) {
        config.max_output_tokens = n;
    }
    if let Some(n) = lookup("CONDUCTOR_MAX_CONTEXT_TOKENS").and_then(|v| v.parse().ok()) {
        config.max_context_tokens = n;
    }
    if let Some(n) = lookup("CONDUCTOR_MAX_PROMPT_TOKENS").and_then(|v| v.parse().ok()) {
        config.max_prompt_tokens = Some(n);
    }
    if let Some(encoding) = lookup("CONDUCTOR_ENCODING") {
        config.encoding = encoding;
    }
    if let Some(prefix) = lookup("CONDUCTOR_PROMPT_PREFIX") {
        config.prompt_prefix = Some(prefix);
    }
    if let Some(url) = lookup("CONDUCTOR_BACKEND_URL") {
        config.backend.base_url = url;
    }
    if let Some(key) = lookup("CONDUCTOR_API_KEY") {
        config.backend.api_key = (!key.is_empty()).then_some(key);
    }
    if let Some(secs) = lookup("CONDUCTOR_REQUEST_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
        config.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(dir) = lookup("CONDUCTOR_DATA_DIR") {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(path) = lookup("CONDUCTOR_SOCKET") {
        config.socket_path = PathBuf::from(path);
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,

    /// Model override
    pub model: Option<String>,

    /// Backend URL override
    pub backend_url: Option<String>,

    /// Storage directory override
    pub data_dir: Option<PathBuf>,

    /// In-memory storage override
    pub in_memory: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Set backend URL override
    #[must_use]
    pub fn with_backend_url(mut self, url: String) -> Self {
        self.backend_url = Some(url);
        self
    }

    /// Set storage directory override
    #[must_use]
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    /// Set in-memory storage override
    #[must_use]
    pub fn with_in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = Some(in_memory);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ConfigFile) {
        if self.socket_path.is_some()
            || self.model.is_some()
            || self.backend_url.is_some()
            || self.data_dir.is_some()
            || self.in_memory.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.socket_path {
            config.socket_path = path.clone();
        }
        if let Some(ref model) = self.model {
            config.model = model.clone();
        }
        if let Some(ref url) = self.backend_url {
            config.backend.base_url = url.clone();
        }
        if let Some(ref dir) = self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(in_memory) = self.in_memory {
            config.in_memory = in_memory;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
