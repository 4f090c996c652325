//! Context Budgeting
//!
//! Bounds a thread to the model's prompt budget. The budgeter keeps the
//! longest run of most-recent messages whose framed token cost fits, so the
//! model always sees the latest turns and older history is dropped first.
//!
//! ```text
//!   thread:   [m0] [m1] [m2] [m3] [m4]      (m4 = new user turn)
//!   walk:                  ←──── ←──── ←──
//!   result:             [m2] [m3] [m4]      (m1 did not fit, stop)
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::ChatMessage;
use crate::config::ConfigError;
use crate::tokens::{TokenCounter, REPLY_PRIMER_TOKENS};

/// Default model context window (tokens)
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 2048;

/// Default tokens reserved for the reply
pub const DEFAULT_MAX_RESPONSE_TOKENS: usize = 1024;

/// Token limits for one model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLimits {
    max_context_tokens: usize,
    max_response_tokens: usize,
    max_prompt_tokens: usize,
}

impl ContextLimits {
    /// Validate a set of limits
    ///
    /// The prompt budget defaults to `context - response`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidBudget` when prompt and response together
    /// exceed the context window, or when no tokens are left for the prompt.
    pub fn new(
        max_context_tokens: usize,
        max_response_tokens: usize,
        max_prompt_tokens: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let max_prompt_tokens =
            max_prompt_tokens.unwrap_or(max_context_tokens.saturating_sub(max_response_tokens));

        let fits = max_prompt_tokens
            .checked_add(max_response_tokens)
            .is_some_and(|total| total <= max_context_tokens);
        if !fits || max_prompt_tokens == 0 {
            return Err(ConfigError::InvalidBudget {
                context: max_context_tokens,
                response: max_response_tokens,
                prompt: max_prompt_tokens,
            });
        }

        Ok(Self {
            max_context_tokens,
            max_response_tokens,
            max_prompt_tokens,
        })
    }

    /// Context window size
    pub fn max_context_tokens(&self) -> usize {
        self.max_context_tokens
    }

    /// Tokens reserved for the reply
    pub fn max_response_tokens(&self) -> usize {
        self.max_response_tokens
    }

    /// Tokens available to the prompt
    pub fn max_prompt_tokens(&self) -> usize {
        self.max_prompt_tokens
    }
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            max_response_tokens: DEFAULT_MAX_RESPONSE_TOKENS,
            max_prompt_tokens: DEFAULT_MAX_CONTEXT_TOKENS - DEFAULT_MAX_RESPONSE_TOKENS,
        }
    }
}

/// A thread trimmed to budget
#[derive(Clone, Debug, PartialEq)]
pub struct Budget {
    /// Kept messages, a contiguous suffix in original order
    pub messages: Vec<ChatMessage>,
    /// Framed cost of `messages`, reply primer included
    pub prompt_tokens: usize,
    /// Number of older messages left out
    pub dropped: usize,
    /// The newest message alone exceeds the budget
    pub overflow: bool,
}

/// The newest turn cannot fit the prompt budget
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("BudgetOverflow: the message needs {prompt_tokens} prompt tokens but only {max_prompt_tokens} are available")]
pub struct BudgetOverflow {
    /// Framed cost of the newest message alone
    pub prompt_tokens: usize,
    /// Budget it was checked against
    pub max_prompt_tokens: usize,
}

impl Budget {
    /// Overflow description, if the budget overflowed
    pub fn overflow_error(&self, max_prompt_tokens: usize) -> Option<BudgetOverflow> {
        self.overflow.then_some(BudgetOverflow {
            prompt_tokens: self.prompt_tokens,
            max_prompt_tokens,
        })
    }
}

/// Selects the most recent messages that fit a prompt budget
#[derive(Clone, Debug)]
pub struct ContextBudgeter {
    counter: Arc<TokenCounter>,
}

impl ContextBudgeter {
    /// Create a budgeter around a token counter
    pub fn new(counter: Arc<TokenCounter>) -> Self {
        Self { counter }
    }

    /// Token counter in use
    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// Trim `thread` to `max_prompt_tokens`
    ///
    /// Walks newest to oldest and stops at the first message that does not
    /// fit; older messages are never considered after that, so the result
    /// has no gaps. If the newest message alone does not fit, it is returned
    /// by itself with `overflow` set so the caller can fail the request.
    pub fn budget(&self, thread: &[ChatMessage], max_prompt_tokens: usize) -> Budget {
        let mut used = REPLY_PRIMER_TOKENS;
        let mut keep = 0;

        for message in thread.iter().rev() {
            let cost = self.counter.message_cost(message);
            if used + cost > max_prompt_tokens {
                break;
            }
            used += cost;
            keep += 1;
        }

        if keep == 0 {
            if let Some(newest) = thread.last() {
                let prompt_tokens = self.counter.message_cost(newest) + REPLY_PRIMER_TOKENS;
                tracing::warn!(
                    prompt_tokens,
                    max_prompt_tokens,
                    "Newest message alone exceeds the prompt budget"
                );
                return Budget {
                    messages: vec![newest.clone()],
                    prompt_tokens,
                    dropped: thread.len() - 1,
                    overflow: true,
                };
            }
        }

        let start = thread.len() - keep;
        if start > 0 {
            tracing::debug!(
                kept = keep,
                dropped = start,
                prompt_tokens = used,
                "Trimmed history to prompt budget"
            );
        }

        Budget {
            messages: thread[start..].to_vec(),
            prompt_tokens: used,
            dropped: start,
            overflow: false,
        }
    }
}
