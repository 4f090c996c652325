//! Token Counting
//!
//! Counts tokens for text spans and chat messages with a pluggable
//! [`Encoding`]. Encodings are looked up by name in a process-wide
//! [`EncodingRegistry`]; building one can be expensive (BPE tables), so each
//! is built at most once and shared afterwards.
//!
//! # Chat Accounting
//!
//! Message accounting follows the convention used by chat-style completion
//! APIs:
//!
//! - each field of a message (role, content, name) is counted separately
//! - a `name` field costs one token less than its text
//! - every message carries [`PER_MESSAGE_OVERHEAD`] tokens of framing
//! - the reply primer adds [`REPLY_PRIMER_TOKENS`] once per request

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::backend::ChatMessage;
use crate::config::ConfigError;

/// Framing tokens added for every message in a thread
pub const PER_MESSAGE_OVERHEAD: usize = 4;

/// Tokens that prime the assistant's reply, added once per thread
pub const REPLY_PRIMER_TOKENS: usize = 2;

/// Name of the encoding used when none is configured
pub const DEFAULT_ENCODING: &str = "heuristic";

/// A text encoding that can count tokens
pub trait Encoding: Send + Sync {
    /// Encoding name (registry key)
    fn name(&self) -> &str;

    /// Number of tokens `text` encodes to
    fn count(&self, text: &str) -> usize;
}

/// Character-based estimate: one token per four characters, rounded up
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicEncoding;

impl Encoding for HeuristicEncoding {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// One token per whitespace-separated word
#[derive(Clone, Copy, Debug, Default)]
pub struct WhitespaceEncoding;

impl Encoding for WhitespaceEncoding {
    fn name(&self) -> &str {
        "whitespace"
    }

    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

type EncodingFactory = fn() -> Arc<dyn Encoding>;

/// Registry of known encodings, memoizing each one on first use
pub struct EncodingRegistry {
    factories: RwLock<HashMap<String, EncodingFactory>>,
    built: RwLock<HashMap<String, Arc<dyn Encoding>>>,
}

impl EncodingRegistry {
    /// Registry with the built-in encodings
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
            built: RwLock::new(HashMap::new()),
        };
        registry.register("heuristic", || Arc::new(HeuristicEncoding));
        registry.register("whitespace", || Arc::new(WhitespaceEncoding));
        registry
    }

    /// The process-wide registry
    pub fn global() -> &'static EncodingRegistry {
        static GLOBAL: OnceLock<EncodingRegistry> = OnceLock::new();
        GLOBAL.get_or_init(EncodingRegistry::new)
    }

    /// Register an encoding factory under `name`
    ///
    /// Replaces any factory with the same name; an encoding already built
    /// under that name stays cached.
    pub fn register(&self, name: impl Into<String>, factory: EncodingFactory) {
        self.factories.write().insert(name.into(), factory);
    }

    /// Whether `name` is a known encoding
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Names of all known encodings, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up an encoding, building and caching it on first use
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownEncoding` for names with no factory.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Encoding>, ConfigError> {
        if let Some(encoding) = self.built.read().get(name) {
            return Ok(Arc::clone(encoding));
        }

        let factory = self
            .factories
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownEncoding(name.to_string()))?;

        // Another thread may have built it in the meantime; keep the first
        let mut built = self.built.write();
        let encoding = built.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(encoding = name, "Building token encoding");
            factory()
        });
        Ok(Arc::clone(encoding))
    }
}

impl Default for EncodingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts tokens for text and chat messages
#[derive(Clone)]
pub struct TokenCounter {
    encoding: Arc<dyn Encoding>,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("encoding", &self.encoding.name())
            .finish()
    }
}

impl TokenCounter {
    /// Create a counter for a named encoding from the global registry
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownEncoding` if the name is not registered.
    pub fn new(encoding: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            encoding: EncodingRegistry::global().get(encoding)?,
        })
    }

    /// Create a counter around an explicit encoding
    pub fn with_encoding(encoding: Arc<dyn Encoding>) -> Self {
        Self { encoding }
    }

    /// Name of the encoding in use
    pub fn encoding_name(&self) -> &str {
        self.encoding.name()
    }

    /// Count tokens in a text span
    pub fn count(&self, text: &str) -> usize {
        self.encoding.count(text)
    }

    /// Count tokens in one chat message, without framing overhead
    pub fn count_message(&self, message: &ChatMessage) -> usize {
        let mut total = self.count(message.role.as_str()) + self.count(&message.content);
        if let Some(ref name) = message.name {
            total = (total + self.count(name)).saturating_sub(1);
        }
        total
    }

    /// Cost of one message inside a thread (framing included)
    pub fn message_cost(&self, message: &ChatMessage) -> usize {
        self.count_message(message) + PER_MESSAGE_OVERHEAD
    }

    /// Count a full thread as sent: per-message framing plus reply primer
    pub fn count_thread(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| self.message_cost(m)).sum::<usize>() + REPLY_PRIMER_TOKENS
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::with_encoding(Arc::new(HeuristicEncoding))
    }
}
