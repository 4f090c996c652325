//! History Resolution
//!
//! Reconstructs the linear thread a new message replies to. Stored messages
//! form a tree through parent pointers; starting from the declared parent,
//! the resolver follows links back to the root sentinel and returns the
//! ancestors oldest first.
//!
//! The walk never trusts the stored links: a missing parent ends the chain
//! (the collected suffix is kept) and a revisited ID ends it too, so corrupt
//! data yields a finite, possibly short, history plus an anomaly report.

use std::collections::{HashMap, HashSet};

use crate::backend::{ChatMessage, Role};
use crate::messages::{Message, MessageId};

/// One resolved turn of the thread
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Whether a human wrote this turn
    pub is_created_by_user: bool,
    /// Turn text
    pub content: String,
}

impl HistoryEntry {
    /// Map to a chat message; the role follows who wrote the turn
    pub fn to_chat_message(&self) -> ChatMessage {
        let role = if self.is_created_by_user {
            Role::User
        } else {
            Role::Assistant
        };
        ChatMessage::new(role, self.content.clone())
    }
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            is_created_by_user: message.is_created_by_user,
            content: message.text.clone(),
        }
    }
}

/// Data problems found while walking the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionAnomaly {
    /// The walk reached an ID it had already visited
    #[error("parent chain revisits message {at}")]
    Cycle {
        /// First repeated ID
        at: MessageId,
    },

    /// A non-root parent is not in the stored set
    #[error("parent chain references missing message {missing}")]
    Dangling {
        /// The ID that could not be found
        missing: MessageId,
    },
}

/// Result of a resolution
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Ancestors, root-to-leaf
    pub entries: Vec<HistoryEntry>,
    /// Set when the walk ended on corrupt data
    pub anomaly: Option<ResolutionAnomaly>,
}

impl Resolution {
    /// Number of resolved turns
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no turns were resolved
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolve the thread ending at `start`, oldest first
///
/// `start` is the parent the new message declares; it is included in the
/// result. The root sentinel yields an empty thread.
pub fn resolve(messages: &[Message], start: MessageId) -> Resolution {
    if start.is_root() {
        return Resolution::default();
    }

    let index: HashMap<MessageId, &Message> =
        messages.iter().map(|m| (m.message_id, m)).collect();

    let mut visited = HashSet::new();
    let mut chain = Vec::new();
    let mut anomaly = None;
    let mut current = start;

    while !current.is_root() {
        if !visited.insert(current) {
            anomaly = Some(ResolutionAnomaly::Cycle { at: current });
            break;
        }
        let Some(message) = index.get(&current) else {
            anomaly = Some(ResolutionAnomaly::Dangling { missing: current });
            break;
        };
        chain.push(HistoryEntry::from(*message));
        current = message.parent_message_id;
    }

    chain.reverse();
    Resolution {
        entries: chain,
        anomaly,
    }
}
