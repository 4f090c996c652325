//! Chat Backend Traits
//!
//! Trait definitions for chat-completion backends. The Conductor only needs
//! the request/response shape required to drive streaming; each
//! implementation owns its wire format, auth and transport details.
//!
//! # Cancellation
//!
//! `send_streaming` receives a [`CancellationToken`]. Implementations must
//! stop reading from the network once it fires and close the channel. The
//! remote server may keep generating; only the client side stops.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Role of a chat message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions that frame the conversation
    System,
    /// The human side
    User,
    /// The model side
    Assistant,
}

impl Role {
    /// Wire label of this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message of a chat thread
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who is speaking
    pub role: Role,
    /// Optional participant name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Create a message without a name
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            name: None,
            content: content.into(),
        }
    }

    /// Attach a participant name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Token stream events from chat backends
#[derive(Clone, Debug, PartialEq)]
pub enum StreamingToken {
    /// A text increment
    Token(String),
    /// Response completed
    Complete {
        /// The complete message (may differ from concatenated tokens)
        message: String,
        /// Set when the provider withheld the reply for safety reasons
        safety: Option<SafetyBlock>,
    },
    /// Error occurred during streaming
    Error(String),
}

/// Provider report that a reply was blocked
#[derive(Clone, Debug, PartialEq)]
pub struct SafetyBlock {
    /// Raw block attributes as reported by the provider
    pub details: serde_json::Value,
}

/// A chat-completion request
#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    /// Model to use (backend-specific identifier)
    pub model: String,
    /// Thread to complete, oldest first
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens in the reply
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling
    pub top_p: f32,
    /// Top-k sampling (not every provider accepts it)
    pub top_k: Option<u32>,
    /// Whether to stream the response
    pub stream: bool,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            max_tokens: 1024,
            temperature: 0.2,
            top_p: 0.95,
            top_k: None,
            stream: true,
        }
    }
}

impl ChatRequest {
    /// Create a request for a model and thread
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set nucleus sampling
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p.clamp(0.0, 1.0);
        self
    }

    /// Set top-k sampling
    #[must_use]
    pub fn with_top_k(mut self, top_k: Option<u32>) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Response from a non-streaming request
#[derive(Clone, Debug, PartialEq)]
pub struct ChatResponse {
    /// The reply text
    pub content: String,
    /// Model that generated the reply
    pub model: String,
    /// Set when the provider withheld the reply
    pub safety: Option<SafetyBlock>,
    /// Tokens used (if reported)
    pub tokens_used: Option<u32>,
    /// Request duration in milliseconds
    pub duration_ms: Option<u64>,
}

/// Backend failures
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Transport-level failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// The response could not be interpreted
    #[error("malformed backend response: {0}")]
    Malformed(String),

    /// The client could not be set up
    #[error("backend client error: {0}")]
    Client(String),
}

/// Chat backend trait
///
/// Implement this trait to add support for different providers.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Get the backend name (e.g., "openai-compatible")
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Send a request and get a streaming response
    ///
    /// Returns a channel receiver that yields tokens as they arrive. The
    /// channel closes after `Complete` or `Error`, or once `cancel` fires.
    async fn send_streaming(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError>;

    /// Send a request and wait for the complete response
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, BackendError>;
}

/// Default backend base URL
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Backend connection configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the OpenAI-compatible server
    pub base_url: String,
    /// Bearer token, if the server wants one
    pub api_key: Option<String>,
    /// Per-request HTTP timeout in seconds
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout_secs: 300,
        }
    }
}

impl BackendConfig {
    /// Create a configuration for a base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("CONDUCTOR_BACKEND_URL") {
            config.base_url = url;
        }
        if let Ok(key) = std::env::var("CONDUCTOR_API_KEY") {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }
        config
    }

    /// HTTP timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
