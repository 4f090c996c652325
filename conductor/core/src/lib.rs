//! Conductor Core - Conversation Orchestration for Chat Completions
//!
//! This crate answers chat questions against an OpenAI-compatible completion
//! server while keeping a persisted, branching conversation history. It has
//! no UI and no process-level concerns: a daemon, a test harness or any
//! other host drives it through [`Conductor::handle`] and
//! [`Conductor::abort`].
//!
//! # Architecture
//!
//! ```text
//!   AskRequest ─────────────────────────────────────────────┐
//!                                                           ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Conductor                                 │
//! │                                                                      │
//! │  ┌──────────────┐   ┌───────────────┐   ┌──────────────────────────┐ │
//! │  │   history    │──►│    budget     │──►│        session           │ │
//! │  │ parent chain │   │ newest suffix │   │ stream, cancel, outcome  │ │
//! │  └──────┬───────┘   └───────┬───────┘   └────────────┬─────────────┘ │
//! │         │                   │                        │               │
//! │  ┌──────┴───────┐   ┌───────┴───────┐   ┌────────────┴─────────────┐ │
//! │  │   storage    │   │    tokens     │   │         backend          │ │
//! │  │ Memory/File  │   │   encodings   │   │  OpenAI-compatible HTTP  │ │
//! │  └──────────────┘   └───────────────┘   └──────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                                           │
//!   ConductorMessage (Created, Progress, Final | Error) ◄───┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use conductor_core::{
//!     AskRequest, Conductor, ConductorConfig, MemoryStore, OpenAiCompatBackend, BackendConfig,
//! };
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(OpenAiCompatBackend::new(BackendConfig::from_env())?);
//!     let store = Arc::new(MemoryStore::new());
//!     let conductor = Conductor::new(backend, store, ConductorConfig::default())?;
//!
//!     let (tx, mut rx) = mpsc::channel(64);
//!     tokio::spawn(async move {
//!         while let Some(msg) = rx.recv().await {
//!             println!("{msg:?}");
//!         }
//!     });
//!
//!     let response = conductor.handle(AskRequest::new("me", "Hello"), tx).await?;
//!     println!("{}", response.response_message.text);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Chat completion backends (OpenAI-compatible HTTP)
//! - [`budget`]: Context window split and history trimming
//! - [`conductor`]: Main Conductor struct and abort registry
//! - [`config`]: TOML, environment and CLI configuration
//! - [`events`]: Requests sent to the Conductor
//! - [`history`]: Thread resolution through parent links
//! - [`messages`]: Persisted entities and messages sent by the Conductor
//! - [`session`]: One cancellable streamed completion
//! - [`storage`]: Conversation persistence
//! - [`title`]: Conversation title derivation
//! - [`tokens`]: Token counting and the encoding registry
//! - [`transport`]: Checksummed frames for the daemon socket

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod budget;
pub mod conductor;
pub mod config;
pub mod events;
pub mod history;
pub mod messages;
pub mod session;
pub mod storage;
pub mod title;
pub mod tokens;
pub mod transport;

// Re-exports for convenience
pub use backend::{
    BackendConfig, BackendError, ChatBackend, ChatMessage, ChatRequest, ChatResponse,
    OpenAiCompatBackend, Role, SafetyBlock, StreamingToken,
};
pub use budget::{Budget, BudgetOverflow, ContextBudgeter, ContextLimits};
pub use conductor::{Conductor, ConductorConfig, ConductorError, ModelOptions};
pub use events::{AskRequest, ClientEvent, RequestOptions};
pub use history::{HistoryEntry, Resolution, ResolutionAnomaly};
pub use messages::{
    ConductorMessage, Conversation, ConversationId, ConversationUpdate, FinalResponse, Message,
    MessageId, Sender,
};
pub use session::{
    CancelReason, CompletionSession, RequestSettings, SessionError, SessionHandle, SessionOutcome,
    SessionState,
};
pub use storage::{ConversationStore, FileStore, MemoryStore, StorageError};
pub use title::TitleGenerator;
pub use tokens::{Encoding, EncodingRegistry, TokenCounter};
pub use transport::TransportError;

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConductorToml, ConfigError,
    ConfigFile, ConfigOverrides, ConfigSource,
};

#[cfg(test)]
mod testing;
