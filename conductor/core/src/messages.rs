//! Conversation Data Model and Outbound Messages
//!
//! Persisted entities (messages and conversations) plus the messages the
//! Conductor sends back to whoever asked a question.
//!
//! # Message Tree
//!
//! Messages of one conversation form a tree through `parent_message_id`.
//! The first message of a conversation points at the root sentinel
//! ([`MessageId::root`], the nil UUID). Branches appear when a user edits or
//! regenerates; the Conductor only ever follows one branch, from a declared
//! parent back to the root.
//!
//! ```text
//!   root (nil) ─┬─ user "Hello" ── assistant "Hi!" ── user "Weather?"
//!               └─ user "Hola"  ── assistant "¡Hola!"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique message identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random message ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The root sentinel that marks "no parent"
    #[must_use]
    pub const fn root() -> Self {
        Self(Uuid::nil())
    }

    /// Whether this is the root sentinel
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique conversation identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    /// Create a new random conversation ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The human user
    User,
    /// The language model
    Assistant,
}

/// A persisted conversation message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message ID
    pub message_id: MessageId,
    /// Parent in the conversation tree (root sentinel for the first message)
    pub parent_message_id: MessageId,
    /// Conversation this message belongs to
    pub conversation_id: ConversationId,
    /// Who sent this message
    pub sender: Sender,
    /// Display label of the sender ("User", or the model label)
    pub sender_label: String,
    /// Message text
    pub text: String,
    /// Whether a human wrote this message
    pub is_created_by_user: bool,
    /// Still being streamed
    #[serde(default)]
    pub unfinished: bool,
    /// Stopped by an abort; `text` holds whatever had streamed
    #[serde(default)]
    pub cancelled: bool,
    /// The request failed; `text` holds the failure description
    #[serde(default)]
    pub error: bool,
    /// Creation time (Unix timestamp ms)
    pub created_at_ms: u64,
    /// Last modification time (Unix timestamp ms)
    pub updated_at_ms: u64,
}

impl Message {
    /// Create a user message
    pub fn user(
        conversation_id: ConversationId,
        parent_message_id: MessageId,
        label: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            message_id: MessageId::new(),
            parent_message_id,
            conversation_id,
            sender: Sender::User,
            sender_label: label.into(),
            text: text.into(),
            is_created_by_user: true,
            unfinished: false,
            cancelled: false,
            error: false,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Create an empty, unfinished assistant reply with a preassigned ID
    pub fn assistant_draft(
        message_id: MessageId,
        conversation_id: ConversationId,
        parent_message_id: MessageId,
        label: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            message_id,
            parent_message_id,
            conversation_id,
            sender: Sender::Assistant,
            sender_label: label.into(),
            text: String::new(),
            is_created_by_user: false,
            unfinished: true,
            cancelled: false,
            error: false,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Replace the streamed text (snapshot while unfinished)
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.updated_at_ms = now_ms();
    }

    /// Finalize as a completed reply
    pub fn complete(&mut self, text: impl Into<String>) {
        self.set_text(text);
        self.unfinished = false;
    }

    /// Finalize as cancelled, keeping the partial text
    pub fn cancel(&mut self, partial: impl Into<String>) {
        self.set_text(partial);
        self.unfinished = false;
        self.cancelled = true;
    }

    /// Finalize as failed, carrying the failure description
    pub fn fail(&mut self, description: impl Into<String>) {
        self.set_text(description);
        self.unfinished = false;
        self.error = true;
    }

    /// Whether this message is the first of its conversation
    #[must_use]
    pub fn is_first(&self) -> bool {
        self.parent_message_id.is_root()
    }
}

// ============================================================================
// Conversations
// ============================================================================

/// A conversation owned by a user
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation ID
    pub conversation_id: ConversationId,
    /// Owning user
    pub user_id: String,
    /// Title, assigned after the first successful exchange
    pub title: Option<String>,
    /// Backend endpoint name that serves this conversation
    pub endpoint: String,
    /// Model options in effect (model, temperature, ...)
    #[serde(default)]
    pub model_options: BTreeMap<String, serde_json::Value>,
    /// Creation time (Unix timestamp ms)
    pub created_at_ms: u64,
    /// Last modification time (Unix timestamp ms)
    pub updated_at_ms: u64,
}

impl Conversation {
    /// Create an untitled conversation
    pub fn new(conversation_id: ConversationId, user_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            conversation_id,
            user_id: user_id.into(),
            title: None,
            endpoint: String::new(),
            model_options: BTreeMap::new(),
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Merge a partial update into this conversation
    pub fn apply(&mut self, update: &ConversationUpdate) {
        if let Some(ref title) = update.title {
            self.title = Some(title.clone());
        }
        if let Some(ref endpoint) = update.endpoint {
            self.endpoint = endpoint.clone();
        }
        if let Some(ref options) = update.model_options {
            self.model_options.extend(options.clone());
        }
        self.updated_at_ms = now_ms();
    }
}

/// Partial conversation update; `None` fields are left untouched
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    /// Conversation to update (created if missing)
    pub conversation_id: ConversationId,
    /// New title
    pub title: Option<String>,
    /// New endpoint name
    pub endpoint: Option<String>,
    /// Model options to merge
    pub model_options: Option<BTreeMap<String, serde_json::Value>>,
}

impl ConversationUpdate {
    /// An update touching nothing but the conversation's timestamp
    #[must_use]
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            ..Default::default()
        }
    }

    /// Set the title
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set model options
    #[must_use]
    pub fn with_model_options(mut self, options: BTreeMap<String, serde_json::Value>) -> Self {
        self.model_options = Some(options);
        self
    }
}

// ============================================================================
// Outbound Messages
// ============================================================================

/// Result of one request, delivered as the terminal event and returned by
/// `Conductor::handle` / `Conductor::abort`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResponse {
    /// Conversation title at the time the request ended
    pub title: Option<String>,
    /// Conversation metadata
    pub conversation: Option<Conversation>,
    /// The persisted user message
    pub request_message: Message,
    /// The persisted, finalized assistant message
    pub response_message: Message,
}

/// Messages from the Conductor to the caller
///
/// A request produces `Created`, zero or more `Progress`, and exactly one
/// terminal `Final` or `Error`. `Aborted` and `Rejected` answer daemon
/// requests that never get a stream of their own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConductorMessage {
    /// The user message was persisted
    Created {
        /// The persisted user message
        message: Message,
        /// ID the assistant reply will use
        response_message_id: MessageId,
    },

    /// A streamed increment
    Progress {
        /// Assistant message being streamed
        message_id: MessageId,
        /// Accumulated text so far
        text: String,
        /// Text added by this increment
        delta: String,
    },

    /// The request ended (completed or cancelled)
    Final(Box<FinalResponse>),

    /// The request failed; the error message was persisted
    Error(Box<FinalResponse>),

    /// Answer to an abort request
    Aborted(Box<FinalResponse>),

    /// A request was refused before any work started
    Rejected {
        /// Abort key of the refused request, if known
        abort_key: Option<String>,
        /// Why it was refused
        reason: String,
    },
}

impl ConductorMessage {
    /// Whether this message ends a request's stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Final(_) | Self::Error(_) | Self::Aborted(_) | Self::Rejected { .. }
        )
    }
}

/// Get current timestamp in milliseconds
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_sentinel() {
        let root = MessageId::root();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "00000000-0000-0000-0000-000000000000");
        assert!(!MessageId::new().is_root());
    }

    #[test]
    fn test_assistant_lifecycle_flags() {
        let conv = ConversationId::new();
        let mut msg = Message::assistant_draft(MessageId::new(), conv, MessageId::new(), "Assistant");
        assert!(msg.unfinished);
        assert!(!msg.is_created_by_user);

        msg.cancel("partial");
        assert!(!msg.unfinished);
        assert!(msg.cancelled);
        assert!(!msg.error);
        assert_eq!(msg.text, "partial");
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let msg = Message::user(ConversationId::new(), MessageId::root(), "User", "Hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["isCreatedByUser"], true);
        assert_eq!(
            json["parentMessageId"],
            "00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(json["sender"], "user");
    }

    #[test]
    fn test_conversation_apply_update() {
        let id = ConversationId::new();
        let mut conv = Conversation::new(id, "u1");
        let mut options = BTreeMap::new();
        options.insert("model".to_string(), serde_json::json!("llama"));

        conv.apply(&ConversationUpdate::new(id).with_endpoint("llama").with_model_options(options));
        assert_eq!(conv.endpoint, "llama");
        assert_eq!(conv.model_options["model"], "llama");
        assert!(conv.title.is_none());

        conv.apply(&ConversationUpdate::new(id).with_title("Greetings"));
        assert_eq!(conv.title.as_deref(), Some("Greetings"));
        assert_eq!(conv.endpoint, "llama");
    }

    #[test]
    fn test_terminal_messages() {
        let msg = ConductorMessage::Progress {
            message_id: MessageId::new(),
            text: "a".into(),
            delta: "a".into(),
        };
        assert!(!msg.is_terminal());
        let rejected = ConductorMessage::Rejected {
            abort_key: None,
            reason: "busy".into(),
        };
        assert!(rejected.is_terminal());
    }
}
