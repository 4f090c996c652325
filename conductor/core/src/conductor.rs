//! Conductor - Conversation Orchestration
//!
//! The Conductor turns one inbound question into one persisted, streamed
//! answer. For every [`AskRequest`] it:
//! - validates the question and registers the request under its abort key
//! - resolves the conversation thread from storage
//! - persists the user message before anything leaves the process
//! - trims the thread to the prompt budget and starts a completion session
//! - forwards increments as [`ConductorMessage::Progress`] and saves
//!   throttled snapshots
//! - finalizes the assistant message exactly once and titles new
//!   conversations
//!
//! # Abort Registry
//!
//! Active requests live in a registry keyed by abort key (an explicit key,
//! or the conversation ID). At most one request runs per key; a second one
//! is rejected with [`ConductorError::Conflict`]. Entries are removed by a
//! drop guard, so a cancelled `handle` future never leaves a stale entry;
//! the guard also saves the streamed text as a cancelled reply.
//!
//! ```text
//!   handle ──register──► [key → ActiveRequest] ◄──remove── abort
//!      │                          │                          │
//!      └── stream ... finalize ───┴── publish FinalResponse ─┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{ChatBackend, ChatMessage, Role};
use crate::budget::{ContextBudgeter, ContextLimits};
use crate::config::{
    ConfigError, DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_MODEL_LABEL, DEFAULT_USER_LABEL,
};
use crate::events::{AskRequest, RequestOptions};
use crate::history::{self, HistoryEntry};
use crate::messages::{
    ConductorMessage, ConversationId, ConversationUpdate, FinalResponse, Message, MessageId,
};
use crate::session::{
    CancelReason, CompletionSession, RequestSettings, SessionHandle, SessionOutcome,
};
use crate::storage::{ConversationStore, StorageError};
use crate::title::{TitleGenerator, FALLBACK_TITLE};
use crate::tokens::{TokenCounter, DEFAULT_ENCODING};

// ============================================================================
// Configuration
// ============================================================================

/// Model parameters applied when a request does not override them
#[derive(Clone, Debug, PartialEq)]
pub struct ModelOptions {
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling
    pub top_p: f32,
    /// Top-k sampling
    pub top_k: Option<u32>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            top_p: 0.95,
            top_k: Some(40),
        }
    }
}

impl ModelOptions {
    /// Apply per-request overrides
    #[must_use]
    pub fn merged(&self, options: &RequestOptions) -> Self {
        Self {
            model: options.model.clone().unwrap_or_else(|| self.model.clone()),
            temperature: options.temperature.unwrap_or(self.temperature),
            top_p: options.top_p.unwrap_or(self.top_p),
            top_k: self.top_k,
        }
    }

    fn to_map(&self) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        map.insert("model".to_string(), serde_json::json!(self.model));
        map.insert("temperature".to_string(), serde_json::json!(self.temperature));
        map.insert("top_p".to_string(), serde_json::json!(self.top_p));
        if let Some(top_k) = self.top_k {
            map.insert("top_k".to_string(), serde_json::json!(top_k));
        }
        map
    }
}

/// Validated Conductor configuration
///
/// Usually produced by [`ConfigFile::conductor_config`](crate::config::ConfigFile::conductor_config).
#[derive(Clone, Debug)]
pub struct ConductorConfig {
    /// Default model parameters
    pub model: ModelOptions,
    /// Context window split
    pub limits: ContextLimits,
    /// Token encoding name
    pub encoding: String,
    /// Default system prefix
    pub prompt_prefix: Option<String>,
    /// Label of user messages
    pub user_label: String,
    /// Default label of assistant messages
    pub model_label: String,
    /// Endpoint name recorded on conversations
    pub endpoint: String,
    /// Minimum interval between snapshot saves
    pub snapshot_interval: Duration,
    /// Cancel requests that run longer than this
    pub request_timeout: Option<Duration>,
    /// Derive titles for new conversations
    pub generate_titles: bool,
    /// Maximum question length in characters
    pub max_input_length: usize,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            model: ModelOptions::default(),
            limits: ContextLimits::default(),
            encoding: DEFAULT_ENCODING.to_string(),
            prompt_prefix: None,
            user_label: DEFAULT_USER_LABEL.to_string(),
            model_label: DEFAULT_MODEL_LABEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            snapshot_interval: Duration::from_millis(500),
            request_timeout: None,
            generate_titles: true,
            max_input_length: 32_768,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Request-level failures
///
/// Backend failures are not errors here: they end the request normally with
/// an assistant message flagged `error`.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// The question is empty or whitespace
    #[error("question is empty")]
    EmptyPrompt,

    /// The question exceeds the configured length
    #[error("question of {len} characters exceeds the maximum of {max}")]
    InputTooLong {
        /// Question length in characters
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Another request is active under the same abort key
    #[error("a request is already active under key {key}")]
    Conflict {
        /// Abort key in use
        key: String,
    },

    /// No active request under the abort key
    #[error("no active request under key {key}")]
    NotFound {
        /// Requested abort key
        key: String,
    },

    /// Persisting or loading failed
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

// ============================================================================
// Abort Registry
// ============================================================================

/// Registry entry of one running request
struct ActiveRequest {
    request_id: Uuid,
    user_id: String,
    handle: SessionHandle,
    done: watch::Receiver<Option<FinalResponse>>,
    request_message: Message,
    response_message: Message,
}

/// Removes the registry entry when the handling future ends or is dropped
///
/// While a draft is armed, dropping the guard with the entry still in place
/// saves the draft as a cancelled reply holding the streamed text.
struct Registration<'a, S: ConversationStore + ?Sized + 'static> {
    registry: &'a DashMap<String, ActiveRequest>,
    key: String,
    request_id: Uuid,
    store: Arc<S>,
    handle: SessionHandle,
    draft: Option<Message>,
}

impl<S: ConversationStore + ?Sized + 'static> Registration<'_, S> {
    /// From now on a dropped handler leaves a cancelled reply behind
    fn arm(&mut self, draft: &Message) {
        self.draft = Some(draft.clone());
    }

    /// The final reply is persisted
    fn disarm(&mut self) {
        self.draft = None;
    }
}

impl<S: ConversationStore + ?Sized + 'static> Drop for Registration<'_, S> {
    fn drop(&mut self) {
        // abort may already have taken the entry, and a newer request may
        // have registered under the same key since
        let removed = self
            .registry
            .remove_if(&self.key, |_, active| active.request_id == self.request_id);

        // With the entry gone, abort owns the final save
        let Some(mut draft) = self.draft.take() else {
            return;
        };
        if removed.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(abort_key = %self.key, "No runtime left to save the dropped reply");
            return;
        };

        draft.cancel(self.handle.partial_text());
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        tracing::warn!(abort_key = %key, "Request handler dropped; saving partial reply");
        runtime.spawn(async move {
            if let Err(e) = store.save_message(&draft).await {
                tracing::error!(abort_key = %key, error = %e, "Failed to save dropped reply");
            }
        });
    }
}

// ============================================================================
// Conductor
// ============================================================================

/// The orchestration core
pub struct Conductor<B: ChatBackend + ?Sized, S: ConversationStore + ?Sized> {
    backend: Arc<B>,
    store: Arc<S>,
    config: ConductorConfig,
    budgeter: ContextBudgeter,
    active: DashMap<String, ActiveRequest>,
}

impl<B, S> Conductor<B, S>
where
    B: ChatBackend + ?Sized,
    S: ConversationStore + ?Sized + 'static,
{
    /// Create a Conductor
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownEncoding` if the configured encoding is
    /// not registered.
    pub fn new(backend: Arc<B>, store: Arc<S>, config: ConductorConfig) -> Result<Self, ConfigError> {
        let counter = Arc::new(TokenCounter::new(&config.encoding)?);
        tracing::info!(
            backend = backend.name(),
            model = %config.model.model,
            encoding = %config.encoding,
            max_prompt_tokens = config.limits.max_prompt_tokens(),
            "Conductor created"
        );
        Ok(Self {
            backend,
            store,
            config,
            budgeter: ContextBudgeter::new(counter),
            active: DashMap::new(),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// Storage in use
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Whether a request is running under `key`
    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains_key(key)
    }

    /// Number of running requests
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Abort keys of the running requests
    pub fn active_keys(&self) -> Vec<String> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Answer one question
    ///
    /// Streams `Created`, `Progress` and one terminal `Final` or `Error`
    /// into `events`. A closed `events` receiver does not stop the request.
    ///
    /// # Errors
    ///
    /// Validation and conflict errors are returned before anything is
    /// persisted. `ConductorError::Storage` is returned if persisting
    /// fails.
    pub async fn handle(
        &self,
        request: AskRequest,
        events: mpsc::Sender<ConductorMessage>,
    ) -> Result<FinalResponse, ConductorError> {
        if request.text.trim().is_empty() {
            return Err(ConductorError::EmptyPrompt);
        }
        let len = request.text.chars().count();
        if len > self.config.max_input_length {
            return Err(ConductorError::InputTooLong {
                len,
                max: self.config.max_input_length,
            });
        }

        let conversation_id = request.conversation_id.unwrap_or_else(ConversationId::new);
        let parent = request.parent();
        let options = &request.options;
        let model = self.config.model.merged(options);
        let prompt_prefix = options
            .prompt_prefix
            .clone()
            .or_else(|| self.config.prompt_prefix.clone());
        let model_label = options
            .sender_label
            .clone()
            .unwrap_or_else(|| self.config.model_label.clone());

        let request_message =
            Message::user(conversation_id, parent, &self.config.user_label, &request.text);
        let mut response_message = Message::assistant_draft(
            MessageId::new(),
            conversation_id,
            request_message.message_id,
            model_label,
        );

        let key = request
            .abort_key
            .clone()
            .unwrap_or_else(|| conversation_id.to_string());
        let handle = SessionHandle::new();
        let (done_tx, done_rx) = watch::channel(None);
        let request_id = Uuid::new_v4();

        match self.active.entry(key.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!(abort_key = %key, "Rejected request: key already active");
                return Err(ConductorError::Conflict { key });
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveRequest {
                    request_id,
                    user_id: request.user_id.clone(),
                    handle: handle.clone(),
                    done: done_rx,
                    request_message: request_message.clone(),
                    response_message: response_message.clone(),
                });
            }
        }
        let mut registration = Registration {
            registry: &self.active,
            key: key.clone(),
            request_id,
            store: Arc::clone(&self.store),
            handle: handle.clone(),
            draft: None,
        };

        tracing::info!(
            abort_key = %key,
            conversation_id = %conversation_id,
            user_id = %request.user_id,
            "Handling request"
        );

        // Thread
        let stored = self.store.load_messages(conversation_id).await?;
        let resolution = history::resolve(&stored, parent);
        if let Some(anomaly) = resolution.anomaly {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %anomaly,
                kept = resolution.len(),
                "History resolution stopped early"
            );
        }

        // Persist the question first
        self.store.save_message(&request_message).await?;
        registration.arm(&response_message);
        let mut conversation = self
            .store
            .save_conversation(
                &request.user_id,
                &ConversationUpdate::new(conversation_id)
                    .with_endpoint(&self.config.endpoint)
                    .with_model_options(model.to_map()),
            )
            .await?;
        send_event(
            &events,
            ConductorMessage::Created {
                message: request_message.clone(),
                response_message_id: response_message.message_id,
            },
        )
        .await;

        let outcome = match self.fit_history(
            prompt_prefix.as_deref(),
            &resolution.entries,
            &request.text,
        ) {
            Ok(history) => {
                let settings = RequestSettings {
                    model: model.model.clone(),
                    temperature: model.temperature,
                    top_p: model.top_p,
                    top_k: model.top_k,
                    max_tokens: u32::try_from(self.config.limits.max_response_tokens())
                        .unwrap_or(u32::MAX),
                    prompt_prefix: prompt_prefix.clone(),
                };
                self.stream(
                    &handle,
                    &request.text,
                    history,
                    &settings,
                    &mut response_message,
                    &events,
                )
                .await
            }
            Err(overflow) => SessionOutcome::Failed {
                error: overflow,
                partial: String::new(),
            },
        };

        // Finalize
        let (completed, failed) = match outcome {
            SessionOutcome::Completed { text, .. } => {
                response_message.complete(text);
                (true, false)
            }
            SessionOutcome::Cancelled {
                partial,
                reason: CancelReason::Aborted,
            } => {
                tracing::info!(abort_key = %key, chars = partial.len(), "Request aborted");
                response_message.cancel(partial);
                (false, false)
            }
            SessionOutcome::Cancelled {
                reason: CancelReason::TimedOut,
                ..
            } => {
                let timeout = self.config.request_timeout.unwrap_or_default();
                tracing::warn!(abort_key = %key, ?timeout, "Request timed out");
                response_message.fail(format!("The request timed out after {timeout:?}"));
                (false, true)
            }
            SessionOutcome::Failed { error, .. } => {
                tracing::warn!(abort_key = %key, error = %error, "Request failed");
                response_message.fail(error);
                (false, true)
            }
        };
        self.store.save_message(&response_message).await?;
        registration.disarm();

        if completed && parent.is_root() && self.config.generate_titles {
            let title = TitleGenerator::new(Arc::clone(&self.backend), &model.model)
                .derive(&request.text, &response_message.text)
                .await
                .unwrap_or_else(|| FALLBACK_TITLE.to_string());
            match self
                .store
                .save_conversation(
                    &request.user_id,
                    &ConversationUpdate::new(conversation_id).with_title(title),
                )
                .await
            {
                Ok(updated) => conversation = updated,
                Err(e) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to save title");
                }
            }
        }

        let response = FinalResponse {
            title: conversation.title.clone(),
            conversation: Some(conversation),
            request_message,
            response_message,
        };

        let terminal = if failed {
            ConductorMessage::Error(Box::new(response.clone()))
        } else {
            ConductorMessage::Final(Box::new(response.clone()))
        };
        send_event(&events, terminal).await;
        done_tx.send_replace(Some(response.clone()));
        drop(registration);

        tracing::debug!(abort_key = %key, "Request finished");
        Ok(response)
    }

    /// Abort the request running under `key`
    ///
    /// Returns the request's final result once its handler has persisted
    /// it. If the handler vanished without finishing, the partial text is
    /// persisted here as the cancelled reply.
    ///
    /// # Errors
    ///
    /// Returns `ConductorError::NotFound` if nothing runs under `key`.
    pub async fn abort(&self, key: &str) -> Result<FinalResponse, ConductorError> {
        let Some((_, mut active)) = self.active.remove(key) else {
            tracing::debug!(abort_key = key, "Abort for unknown key");
            return Err(ConductorError::NotFound {
                key: key.to_string(),
            });
        };

        tracing::info!(abort_key = key, "Aborting request");
        active.handle.cancel(CancelReason::Aborted);

        let published = match active.done.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        if let Some(response) = published {
            return Ok(response);
        }

        tracing::warn!(abort_key = key, "Request handler vanished; saving partial reply");
        let mut response_message = active.response_message;
        response_message.cancel(active.handle.partial_text());
        self.store.save_message(&response_message).await?;

        let conversation = self
            .store
            .load_conversation(&active.user_id, response_message.conversation_id)
            .await?;
        Ok(FinalResponse {
            title: conversation.as_ref().and_then(|c| c.title.clone()),
            conversation,
            request_message: active.request_message,
            response_message,
        })
    }

    /// Trim history so prefix, history and the new turn fit the prompt budget
    ///
    /// Returns the history suffix to send, or the overflow description.
    fn fit_history<'h>(
        &self,
        prompt_prefix: Option<&str>,
        history: &'h [HistoryEntry],
        user_text: &str,
    ) -> Result<&'h [HistoryEntry], String> {
        let counter = self.budgeter.counter();
        let reserved = prompt_prefix
            .filter(|p| !p.trim().is_empty())
            .map(|p| counter.message_cost(&ChatMessage::new(Role::System, p)))
            .unwrap_or(0);
        let available = self.config.limits.max_prompt_tokens().saturating_sub(reserved);

        let mut thread: Vec<ChatMessage> =
            history.iter().map(HistoryEntry::to_chat_message).collect();
        thread.push(ChatMessage::new(Role::User, user_text));

        let budget = self.budgeter.budget(&thread, available);
        if let Some(overflow) = budget.overflow_error(available) {
            tracing::warn!(reserved, error = %overflow, "Question does not fit the context window");
            return Err(overflow.to_string());
        }

        // The new turn is always the last kept message
        let kept_history = budget.messages.len() - 1;
        Ok(&history[history.len() - kept_history..])
    }

    /// Run the completion session, forwarding progress and snapshots
    async fn stream(
        &self,
        handle: &SessionHandle,
        user_text: &str,
        history: &[HistoryEntry],
        settings: &RequestSettings,
        response_message: &mut Message,
        events: &mpsc::Sender<ConductorMessage>,
    ) -> SessionOutcome {
        let timer_stop = CancellationToken::new();
        let _timer_guard = timer_stop.clone().drop_guard();
        if let Some(timeout) = self.config.request_timeout {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = timer_stop.cancelled() => {}
                    () = tokio::time::sleep(timeout) => handle.cancel(CancelReason::TimedOut),
                }
            });
        }

        let mut session = CompletionSession::new(Arc::clone(&self.backend), handle.clone());
        if let Err(e) = session.start(user_text, history, settings).await {
            tracing::error!(error = %e, "Completion session did not start");
        }

        let mut last_snapshot = Instant::now();
        while let Some(delta) = session.next_increment().await {
            let text = handle.partial_text();
            if last_snapshot.elapsed() >= self.config.snapshot_interval {
                response_message.set_text(text.clone());
                if let Err(e) = self.store.save_message(response_message).await {
                    tracing::warn!(message_id = %response_message.message_id, error = %e, "Snapshot save failed");
                }
                last_snapshot = Instant::now();
            }
            send_event(
                events,
                ConductorMessage::Progress {
                    message_id: response_message.message_id,
                    text,
                    delta,
                },
            )
            .await;
        }

        session.into_outcome().await
    }
}

async fn send_event(events: &mpsc::Sender<ConductorMessage>, message: ConductorMessage) {
    if events.send(message).await.is_err() {
        tracing::trace!("Event receiver closed");
    }
}
