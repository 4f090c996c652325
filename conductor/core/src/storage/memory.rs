//! In-memory store

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ConversationStore, StorageError};
use crate::messages::{Conversation, ConversationId, ConversationUpdate, Message, MessageId};

/// Process-local store backed by maps
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<ConversationId, Vec<Message>>>,
    conversations: RwLock<HashMap<(String, ConversationId), Conversation>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a conversation's messages
    pub fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.messages
            .read()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up one message by ID
    pub fn message(&self, message_id: MessageId) -> Option<Message> {
        self.messages
            .read()
            .values()
            .flatten()
            .find(|m| m.message_id == message_id)
            .cloned()
    }

    /// Number of successful writes (messages and conversations)
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Insert messages directly, bypassing the write counter
    pub fn seed(&self, messages: impl IntoIterator<Item = Message>) {
        let mut map = self.messages.write();
        for message in messages {
            upsert(map.entry(message.conversation_id).or_default(), message);
        }
    }
}

fn upsert(messages: &mut Vec<Message>, message: Message) {
    match messages
        .iter_mut()
        .find(|m| m.message_id == message.message_id)
    {
        Some(existing) => *existing = message,
        None => messages.push(message),
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StorageError> {
        Ok(self.messages(conversation_id))
    }

    async fn save_message(&self, message: &Message) -> Result<(), StorageError> {
        upsert(
            self.messages
                .write()
                .entry(message.conversation_id)
                .or_default(),
            message.clone(),
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_conversation(
        &self,
        user_id: &str,
        update: &ConversationUpdate,
    ) -> Result<Conversation, StorageError> {
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .entry((user_id.to_string(), update.conversation_id))
            .or_insert_with(|| Conversation::new(update.conversation_id, user_id));
        conversation.apply(update);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(conversation.clone())
    }

    async fn load_conversation(
        &self,
        user_id: &str,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, StorageError> {
        Ok(self
            .conversations
            .read()
            .get(&(user_id.to_string(), conversation_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_message_upserts() {
        let store = MemoryStore::new();
        let conv = ConversationId::new();
        let mut reply = Message::assistant_draft(MessageId::new(), conv, MessageId::root(), "Assistant");

        store.save_message(&reply).await.unwrap();
        reply.complete("done");
        store.save_message(&reply).await.unwrap();

        let messages = store.load_messages(conv).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "done");
        assert!(!messages[0].unfinished);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_conversations_are_scoped_by_user() {
        let store = MemoryStore::new();
        let conv = ConversationId::new();
        store
            .save_conversation("alice", &ConversationUpdate::new(conv).with_title("Hi"))
            .await
            .unwrap();

        assert_eq!(
            store.load_conversation_title("alice", conv).await.unwrap().as_deref(),
            Some("Hi")
        );
        assert!(store.load_conversation("bob", conv).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_seed_does_not_count_writes() {
        let store = MemoryStore::new();
        let conv = ConversationId::new();
        store.seed([Message::user(conv, MessageId::root(), "User", "Hello")]);
        assert_eq!(store.messages(conv).len(), 1);
        assert_eq!(store.write_count(), 0);
    }
}
