//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use conductor_core::{
    BackendError, ChatBackend, ChatRequest, ChatResponse, ConductorMessage, StreamingToken,
};

/// Backend streaming a fixed reply, token by token
pub struct MockBackend {
    tokens: Vec<String>,
    hold_open: bool,
    title: String,
    streaming_calls: AtomicUsize,
    title_calls: AtomicUsize,
    requests: parking_lot::Mutex<Vec<ChatRequest>>,
}

impl MockBackend {
    /// Stream `tokens`, then complete
    pub fn replying<const N: usize>(tokens: [&str; N]) -> Self {
        Self {
            tokens: tokens.iter().map(ToString::to_string).collect(),
            hold_open: false,
            title: "Greetings".to_string(),
            streaming_calls: AtomicUsize::new(0),
            title_calls: AtomicUsize::new(0),
            requests: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Keep the stream open after the tokens until cancelled
    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn streaming_calls(&self) -> usize {
        self.streaming_calls.load(Ordering::SeqCst)
    }

    pub fn title_calls(&self) -> usize {
        self.title_calls.load(Ordering::SeqCst)
    }

    /// Contents of the messages of every streamed request
    pub fn sent_threads(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.messages.iter().map(|m| m.content.clone()).collect())
            .collect()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
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
        self.requests.lock().push(request.clone());

        let (tx, rx) = mpsc::channel(16);
        let tokens = self.tokens.clone();
        let hold_open = self.hold_open;
        tokio::spawn(async move {
            for token in &tokens {
                if tx.send(StreamingToken::Token(token.clone())).await.is_err() {
                    return;
                }
            }
            if hold_open {
                cancel.cancelled().await;
                return;
            }
            let _ = tx
                .send(StreamingToken::Complete {
                    message: tokens.concat(),
                    safety: None,
                })
                .await;
        });
        Ok(rx)
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, BackendError> {
        self.title_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChatResponse {
            content: self.title.clone(),
            model: request.model.clone(),
            safety: None,
            tokens_used: None,
            duration_ms: None,
        })
    }
}

/// Wait until `count` progress messages arrived
pub async fn wait_for_progress(rx: &mut mpsc::Receiver<ConductorMessage>, count: usize) {
    let mut seen = 0;
    while seen < count {
        match rx.recv().await {
            Some(ConductorMessage::Progress { .. }) => seen += 1,
            Some(_) => {}
            None => panic!("event stream ended after {seen} progress messages"),
        }
    }
}
