//! Inbound Requests
//!
//! Events sent from callers to the Conductor: ask a question, or abort a
//! question that is still streaming. The daemon decodes these straight off
//! the wire; embedded callers construct them directly.

use serde::{Deserialize, Serialize};

use crate::messages::{ConversationId, MessageId};

/// Per-request overrides merged over the configured model options
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestOptions {
    /// Model to use instead of the configured one
    pub model: Option<String>,
    /// System-level prefix prepended to the prompt
    pub prompt_prefix: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Nucleus sampling
    pub top_p: Option<f32>,
    /// Label stored as the assistant message's sender
    pub sender_label: Option<String>,
}

/// A user question
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    /// User on whose behalf the conversation is stored
    pub user_id: String,
    /// The question text
    pub text: String,
    /// Existing conversation; a new one is created when absent
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    /// Message this question replies to; root when absent
    #[serde(default)]
    pub parent_message_id: Option<MessageId>,
    /// Key for aborting this request; defaults to the conversation ID
    #[serde(default)]
    pub abort_key: Option<String>,
    /// Option overrides for this request
    #[serde(default)]
    pub options: RequestOptions,
}

impl AskRequest {
    /// Ask a question in a new conversation
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            conversation_id: None,
            parent_message_id: None,
            abort_key: None,
            options: RequestOptions::default(),
        }
    }

    /// Continue an existing conversation below `parent`
    #[must_use]
    pub fn in_conversation(mut self, conversation_id: ConversationId, parent: MessageId) -> Self {
        self.conversation_id = Some(conversation_id);
        self.parent_message_id = Some(parent);
        self
    }

    /// Use an explicit abort key
    #[must_use]
    pub fn with_abort_key(mut self, key: impl Into<String>) -> Self {
        self.abort_key = Some(key.into());
        self
    }

    /// Override options for this request
    #[must_use]
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Declared parent, defaulting to the root sentinel
    #[must_use]
    pub fn parent(&self) -> MessageId {
        self.parent_message_id.unwrap_or_else(MessageId::root)
    }
}

/// Events from a client connection to the Conductor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Ask a question and stream the answer back
    Ask(AskRequest),
    /// Abort the request registered under `abort_key`
    Abort {
        /// Key used when the request started
        abort_key: String,
    },
}
