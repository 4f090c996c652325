//! Conversation Storage
//!
//! Persistence of messages and conversation metadata. The Conductor talks to
//! storage only through [`ConversationStore`]; two implementations ship with
//! the crate:
//!
//! - [`MemoryStore`]: process-local maps, for tests and ephemeral daemons
//! - [`FileStore`]: JSON Lines message logs plus one JSON document per
//!   conversation
//!
//! # Semantics
//!
//! `save_message` is an upsert keyed by message ID: the streaming protocol
//! saves the same assistant message several times (snapshots, then the final
//! version) and the last write wins. `save_conversation` merges a partial
//! update, creating the conversation on first use.

mod file;
mod memory;

use async_trait::async_trait;

use crate::messages::{Conversation, ConversationId, ConversationUpdate, Message};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Storage failures
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem failure
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence interface used by the Conductor
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// All stored messages of a conversation, in insertion order
    async fn load_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StorageError>;

    /// Insert or replace a message by ID
    async fn save_message(&self, message: &Message) -> Result<(), StorageError>;

    /// Merge `update` into the user's conversation, creating it if missing
    async fn save_conversation(
        &self,
        user_id: &str,
        update: &ConversationUpdate,
    ) -> Result<Conversation, StorageError>;

    /// Conversation metadata, if it exists
    async fn load_conversation(
        &self,
        user_id: &str,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, StorageError>;

    /// Conversation title, if the conversation exists and has one
    async fn load_conversation_title(
        &self,
        user_id: &str,
        conversation_id: ConversationId,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .load_conversation(user_id, conversation_id)
            .await?
            .and_then(|c| c.title))
    }
}
