//! Scripted backend for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendError, ChatBackend, ChatRequest, ChatResponse, SafetyBlock, StreamingToken,
};

/// How a scripted stream ends after its tokens
#[derive(Clone, Debug)]
pub(crate) enum Finish {
    /// Send `Complete` with the concatenated tokens
    Complete,
    /// Send `Complete` with a safety block
    Blocked(serde_json::Value),
    /// Send `Error`
    Error(String),
    /// Close the channel without a terminal token
    Close,
    /// Keep the channel open until cancelled
    Hang,
}

pub(crate) struct ScriptedBackend {
    tokens: Vec<String>,
    delay: Duration,
    dispatch_delay: Duration,
    finish: Finish,
    dispatch_error: Option<String>,
    title: Result<String, String>,
    streaming_calls: AtomicUsize,
    send_calls: AtomicUsize,
    last_request: Mutex<Option<ChatRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            dispatch_delay: Duration::ZERO,
            finish: Finish::Complete,
            dispatch_error: None,
            title: Ok("Greetings".to_string()),
            streaming_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }

    pub(crate) fn finishing(mut self, finish: Finish) -> Self {
        self.finish = finish;
        self
    }

    pub(crate) fn failing_dispatch(mut self, error: &str) -> Self {
        self.dispatch_error = Some(error.to_string());
        self
    }

    pub(crate) fn with_title(mut self, title: Result<&str, &str>) -> Self {
        self.title = title.map(str::to_string).map_err(str::to_string);
        self
    }

    pub(crate) fn streaming_calls(&self) -> usize {
        self.streaming_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn send_streaming(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError> {
        self.streaming_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());

        if !self.dispatch_delay.is_zero() {
            tokio::time::sleep(self.dispatch_delay).await;
        }
        if let Some(ref error) = self.dispatch_error {
            return Err(BackendError::Client(error.clone()));
        }

        let (tx, rx) = mpsc::channel(16);
        let tokens = self.tokens.clone();
        let delay = self.delay;
        let finish = self.finish.clone();

        tokio::spawn(async move {
            let mut full = String::new();
            for token in tokens {
                if !delay.is_zero() {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                full.push_str(&token);
                if tx.send(StreamingToken::Token(token)).await.is_err() {
                    return;
                }
            }
            let terminal = match finish {
                Finish::Complete => StreamingToken::Complete {
                    message: full,
                    safety: None,
                },
                Finish::Blocked(details) => StreamingToken::Complete {
                    message: full,
                    safety: Some(SafetyBlock { details }),
                },
                Finish::Error(error) => StreamingToken::Error(error),
                Finish::Close => return,
                Finish::Hang => {
                    cancel.cancelled().await;
                    return;
                }
            };
            let _ = tx.send(terminal).await;
        });

        Ok(rx)
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, BackendError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        match self.title {
            Ok(ref title) => Ok(ChatResponse {
                content: title.clone(),
                model: request.model.clone(),
                safety: None,
                tokens_used: None,
                duration_ms: None,
            }),
            Err(ref error) => Err(BackendError::Status {
                status: 500,
                body: error.clone(),
            }),
        }
    }
}
