//! File-backed store
//!
//! Layout under the base directory:
//!
//! ```text
//!   messages/<conversation_id>.jsonl            one record per save, append-only
//!   conversations/<user>/<conversation_id>.json  current metadata document
//! ```
//!
//! `<user>` is the hex encoding of the user ID, so distinct users never
//! share a directory.
//!
//! Message saves append; on load the last record for each message ID wins,
//! in the order IDs first appeared.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::{ConversationStore, StorageError};
use crate::messages::{Conversation, ConversationId, ConversationUpdate, Message, MessageId};

/// Store writing JSON files under a base directory
#[derive(Debug)]
pub struct FileStore {
    base_path: PathBuf,
    // Serializes writers; conversation saves are read-modify-write
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a store rooted at `base_path`
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Create the directory layout
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the directories cannot be created.
    pub async fn init(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.base_path.join("messages")).await?;
        fs::create_dir_all(self.base_path.join("conversations")).await?;
        Ok(())
    }

    /// Base directory
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn messages_path(&self, conversation_id: ConversationId) -> PathBuf {
        self.base_path
            .join("messages")
            .join(format!("{conversation_id}.jsonl"))
    }

    fn conversation_path(&self, user_id: &str, conversation_id: ConversationId) -> PathBuf {
        self.base_path
            .join("conversations")
            .join(user_dir(user_id))
            .join(format!("{conversation_id}.json"))
    }

    async fn read_conversation(&self, path: &Path) -> Result<Option<Conversation>, StorageError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Directory name of a user: the hex encoding of the ID
fn user_dir(user_id: &str) -> String {
    if user_id.is_empty() {
        // Not a hex string, so no real ID maps here
        "_".to_string()
    } else {
        hex::encode(user_id.as_bytes())
    }
}

/// Whether a loaded document belongs to `user_id`
fn owned_by(conversation: &Conversation, user_id: &str) -> bool {
    if conversation.user_id == user_id {
        return true;
    }
    tracing::warn!(
        conversation_id = %conversation.conversation_id,
        owner = %conversation.user_id,
        requested_by = %user_id,
        "Conversation document belongs to another user"
    );
    false
}

#[async_trait]
impl ConversationStore for FileStore {
    async fn load_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StorageError> {
        let file = match fs::File::open(self.messages_path(conversation_id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut order: Vec<MessageId> = Vec::new();
        let mut latest: HashMap<MessageId, Message> = HashMap::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => {
                    if !latest.contains_key(&message.message_id) {
                        order.push(message.message_id);
                    }
                    latest.insert(message.message_id, message);
                }
                Err(e) => {
                    // Torn final line after a crash
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %e,
                        "Skipping unreadable message record"
                    );
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }

    async fn save_message(&self, message: &Message) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let path = self.messages_path(message.conversation_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn save_conversation(
        &self,
        user_id: &str,
        update: &ConversationUpdate,
    ) -> Result<Conversation, StorageError> {
        let _guard = self.write_lock.lock().await;
        let path = self.conversation_path(user_id, update.conversation_id);

        let mut conversation = match self.read_conversation(&path).await? {
            Some(existing) if !owned_by(&existing, user_id) => {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("conversation {} belongs to another user", update.conversation_id),
                )));
            }
            Some(existing) => existing,
            None => Conversation::new(update.conversation_id, user_id),
        };
        conversation.apply(update);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Atomic replace
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&conversation)?).await?;
        fs::rename(&tmp, &path).await?;

        Ok(conversation)
    }

    async fn load_conversation(
        &self,
        user_id: &str,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, StorageError> {
        let conversation = self
            .read_conversation(&self.conversation_path(user_id, conversation_id))
            .await?;
        Ok(conversation.filter(|c| owned_by(c, user_id)))
    }
}
