//! Chat Backend Integration
//!
//! Abstracted access to chat-completion servers through a common trait.
//!
//! # Available Backends
//!
//! - **OpenAI-compatible**: any server exposing `/v1/chat/completions`
//!
//! # Usage
//!
//! ```ignore
//! use conductor_core::backend::{BackendConfig, ChatBackend, ChatMessage, ChatRequest, OpenAiCompatBackend, Role};
//! use tokio_util::sync::CancellationToken;
//!
//! let backend = OpenAiCompatBackend::new(BackendConfig::from_env())?;
//! let request = ChatRequest::new("vicuna", vec![ChatMessage::new(Role::User, "Hello!")]);
//! let rx = backend.send_streaming(&request, CancellationToken::new()).await?;
//! ```

mod openai;
mod traits;

pub use openai::OpenAiCompatBackend;
pub use traits::{
    BackendConfig, BackendError, ChatBackend, ChatMessage, ChatRequest, ChatResponse, Role,
    SafetyBlock, StreamingToken, DEFAULT_BASE_URL,
};
