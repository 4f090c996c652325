//! Completion Sessions
//!
//! A session owns exactly one outstanding backend request: it builds the
//! payload, dispatches it, hands out text increments as they stream in and
//! reports how the request ended.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle ──start──► Building ──► InFlight ──┬──► Completed
//!                                           ├──► Cancelled (partial kept)
//!                                           └──► Failed
//! ```
//!
//! The [`SessionHandle`] exists before any network activity, so a request
//! can be cancelled while it is still being dispatched. Cancellation is
//! cooperative: the backend reader stops, the session stops yielding, and
//! the text accumulated up to that instant is preserved.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChatBackend, ChatMessage, ChatRequest, Role, SafetyBlock, StreamingToken};
use crate::history::HistoryEntry;

/// Session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, not started
    Idle,
    /// Assembling the payload
    Building,
    /// Request dispatched, streaming
    InFlight,
    /// Backend finished
    Completed,
    /// Stopped by a cancel
    Cancelled,
    /// Transport or protocol failure
    Failed,
}

impl SessionState {
    /// Whether the session has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Why a session was cancelled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// A caller asked for the abort
    Aborted,
    /// The request timeout fired
    TimedOut,
}

/// Shared control surface of one session
///
/// Cloning is cheap; all clones observe the same cancel state and partial
/// text.
#[derive(Clone, Debug, Default)]
pub struct SessionHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
    partial: Arc<RwLock<String>>,
}

impl SessionHandle {
    /// Create a fresh, uncancelled handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the first reason recorded wins
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut current = self.reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason of the cancellation, if any
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.reason.lock()
    }

    /// Text streamed so far
    pub fn partial_text(&self) -> String {
        self.partial.read().clone()
    }

    /// Token observed by the backend reader
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn append(&self, text: &str) {
        self.partial.write().push_str(text);
    }
}

/// Model parameters for one request
#[derive(Clone, Debug, PartialEq)]
pub struct RequestSettings {
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling
    pub top_p: f32,
    /// Top-k sampling
    pub top_k: Option<u32>,
    /// Reply token cap
    pub max_tokens: u32,
    /// System-level prefix sent ahead of the history
    pub prompt_prefix: Option<String>,
}

/// How a session ended
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    /// Backend finished; `text` is the final reply (or the block notice)
    Completed {
        /// Final text
        text: String,
        /// Set when the provider withheld the reply
        safety: Option<SafetyBlock>,
    },
    /// Cancel observed; `partial` is everything streamed before it
    Cancelled {
        /// Text streamed before the cancel
        partial: String,
        /// Who cancelled
        reason: CancelReason,
    },
    /// The request failed
    Failed {
        /// Failure description
        error: String,
        /// Text streamed before the failure
        partial: String,
    },
}

/// Session misuse
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `start` was called on a session that already ran
    #[error("session already started")]
    AlreadyStarted,
}

/// Build the outbound thread: prefix, history, then the new user turn
pub fn build_thread(
    prompt_prefix: Option<&str>,
    history: &[HistoryEntry],
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if let Some(prefix) = prompt_prefix.filter(|p| !p.trim().is_empty()) {
        messages.push(ChatMessage::new(Role::System, prefix));
    }
    messages.extend(history.iter().map(HistoryEntry::to_chat_message));
    messages.push(ChatMessage::new(Role::User, user_text));
    messages
}

/// Text shown when the provider blocked the reply
pub fn safety_notice(block: &SafetyBlock, partial: &str) -> String {
    let mut notice = format!(
        "The model blocked a proper response to your message:\n{}",
        block.details
    );
    if !partial.is_empty() {
        notice.push_str("\nAI Response:\n");
        notice.push_str(partial);
    }
    notice
}

/// One cancellable, streamed completion request
pub struct CompletionSession<B: ChatBackend + ?Sized> {
    backend: Arc<B>,
    handle: SessionHandle,
    state: SessionState,
    rx: Option<mpsc::Receiver<StreamingToken>>,
    outcome: Option<SessionOutcome>,
}

impl<B: ChatBackend + ?Sized> CompletionSession<B> {
    /// Create an idle session controlled by `handle`
    pub fn new(backend: Arc<B>, handle: SessionHandle) -> Self {
        Self {
            backend,
            handle,
            state: SessionState::Idle,
            rx: None,
            outcome: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Control handle
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Build the payload and dispatch it
    ///
    /// Dispatch is raced against the cancel token. Dispatch failures and
    /// early cancels do not return an error; they move the session to its
    /// terminal state, observable through [`Self::into_outcome`].
    ///
    /// # Errors
    ///
    /// Returns `SessionError::AlreadyStarted` if the session left `Idle`.
    pub async fn start(
        &mut self,
        user_text: &str,
        history: &[HistoryEntry],
        settings: &RequestSettings,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyStarted);
        }

        self.state = SessionState::Building;
        let messages = build_thread(settings.prompt_prefix.as_deref(), history, user_text);
        let request = ChatRequest::new(settings.model.clone(), messages)
            .with_temperature(settings.temperature)
            .with_top_p(settings.top_p)
            .with_top_k(settings.top_k)
            .with_max_tokens(settings.max_tokens)
            .with_stream(true);

        if self.handle.is_cancelled() {
            self.finish_cancelled();
            return Ok(());
        }

        self.state = SessionState::InFlight;
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            backend = self.backend.name(),
            "Dispatching completion"
        );

        let token = self.handle.token();
        let backend = Arc::clone(&self.backend);
        tokio::select! {
            biased;
            () = token.cancelled() => self.finish_cancelled(),
            dispatched = backend.send_streaming(&request, token.clone()) => match dispatched {
                Ok(rx) => self.rx = Some(rx),
                Err(e) => {
                    tracing::warn!(error = %e, "Completion dispatch failed");
                    self.finish(SessionOutcome::Failed {
                        error: e.to_string(),
                        partial: String::new(),
                    });
                }
            },
        }
        Ok(())
    }

    /// Next text increment, or `None` once the session is terminal
    ///
    /// The increment is already part of [`SessionHandle::partial_text`]
    /// when it is returned.
    pub async fn next_increment(&mut self) -> Option<String> {
        if self.state != SessionState::InFlight {
            return None;
        }
        let token = self.handle.token();

        loop {
            let rx = self.rx.as_mut()?;
            let received = tokio::select! {
                biased;
                () = token.cancelled() => {
                    self.finish_cancelled();
                    return None;
                }
                received = rx.recv() => received,
            };

            match received {
                Some(StreamingToken::Token(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.handle.append(&text);
                    return Some(text);
                }
                Some(StreamingToken::Complete { message, safety }) => {
                    let partial = self.handle.partial_text();
                    let text = match safety {
                        Some(ref block) => {
                            let reply = if message.is_empty() { &partial } else { &message };
                            safety_notice(block, reply)
                        }
                        None if message.is_empty() => partial,
                        None => message,
                    };
                    self.finish(SessionOutcome::Completed { text, safety });
                    return None;
                }
                Some(StreamingToken::Error(error)) => {
                    tracing::warn!(error = %error, "Completion stream failed");
                    self.finish(SessionOutcome::Failed {
                        error,
                        partial: self.handle.partial_text(),
                    });
                    return None;
                }
                None => {
                    // The reader may have stopped because of a cancel that
                    // raced the channel close
                    if self.handle.is_cancelled() {
                        self.finish_cancelled();
                        return None;
                    }
                    let partial = self.handle.partial_text();
                    let error = if partial.is_empty() {
                        "stream closed without any output"
                    } else {
                        "stream ended before completion"
                    };
                    tracing::warn!(error, received = partial.len(), "Completion stream cut off");
                    self.finish(SessionOutcome::Failed {
                        error: error.to_string(),
                        partial,
                    });
                    return None;
                }
            }
        }
    }

    /// Drain the stream and report how the session ended
    pub async fn into_outcome(mut self) -> SessionOutcome {
        while self.next_increment().await.is_some() {}
        match self.outcome.take() {
            Some(outcome) => outcome,
            // Never started
            None => SessionOutcome::Failed {
                error: "session was never started".to_string(),
                partial: self.handle.partial_text(),
            },
        }
    }

    fn finish_cancelled(&mut self) {
        let reason = self.handle.cancel_reason().unwrap_or(CancelReason::Aborted);
        self.finish(SessionOutcome::Cancelled {
            partial: self.handle.partial_text(),
            reason,
        });
    }

    fn finish(&mut self, outcome: SessionOutcome) {
        self.state = match outcome {
            SessionOutcome::Completed { .. } => SessionState::Completed,
            SessionOutcome::Cancelled { .. } => SessionState::Cancelled,
            SessionOutcome::Failed { .. } => SessionState::Failed,
        };
        self.rx = None;
        self.outcome = Some(outcome);
    }
}
