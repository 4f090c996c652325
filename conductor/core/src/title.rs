//! Conversation Titles
//!
//! After the first successful exchange of a new conversation the Conductor
//! asks the model for a short title. Derivation is best effort: any failure
//! yields `None` and the caller stores [`FALLBACK_TITLE`].

use std::sync::Arc;

use crate::backend::{ChatBackend, ChatMessage, ChatRequest, Role};

/// Title stored when derivation fails
pub const FALLBACK_TITLE: &str = "New Chat";

/// Longest title kept, in characters
pub const MAX_TITLE_CHARS: usize = 60;

const TITLE_INSTRUCTION: &str = "Write a concise title of at most five words for the \
conversation below. Reply with the title only, without quotes or punctuation at the end.";

/// Reply cap of the title request
const TITLE_MAX_TOKENS: u32 = 32;

/// Derives conversation titles through a non-streaming backend call
pub struct TitleGenerator<B: ChatBackend + ?Sized> {
    backend: Arc<B>,
    model: String,
}

impl<B: ChatBackend + ?Sized> TitleGenerator<B> {
    /// Create a generator using `model`
    pub fn new(backend: Arc<B>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
        }
    }

    /// Ask the model for a title of the exchange
    ///
    /// Sends exactly one request. Returns `None` if the request fails or
    /// the reply is blank after cleanup.
    pub async fn derive(&self, user_text: &str, response_text: &str) -> Option<String> {
        let request = ChatRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::new(Role::System, TITLE_INSTRUCTION),
                ChatMessage::new(
                    Role::User,
                    format!("User: {user_text}\nAssistant: {response_text}"),
                ),
            ],
        )
        .with_stream(false)
        .with_max_tokens(TITLE_MAX_TOKENS);

        match self.backend.send(&request).await {
            Ok(response) => {
                let title = clean_title(&response.content);
                if title.is_none() {
                    tracing::debug!("Title request returned no usable text");
                }
                title
            }
            Err(e) => {
                tracing::warn!(error = %e, backend = self.backend.name(), "Title derivation failed");
                None
            }
        }
    }
}

/// Normalize a raw model reply into a title
///
/// Keeps the first non-blank line, strips surrounding quotes and a
/// `Title:` label, and caps the length.
pub fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = strip_label(line);
    let line = line
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '\u{201c}' | '\u{201d}'))
        .trim();

    let capped: String = line.chars().take(MAX_TITLE_CHARS).collect();
    let capped = capped.trim_end();
    (!capped.is_empty()).then(|| capped.to_string())
}

fn strip_label(line: &str) -> &str {
    match line.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("title:") => line[6..].trim_start(),
        _ => line,
    }
}
