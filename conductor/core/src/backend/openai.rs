//! OpenAI-Compatible Backend
//!
//! Chat backend for servers that speak the OpenAI chat-completions API
//! (llama.cpp server, gpt-llama, vLLM, the hosted API itself).
//!
//! # API
//!
//! - `POST /v1/chat/completions` - completions, streamed as Server-Sent
//!   Events when `stream: true`
//! - `GET /v1/models` - used as the health check
//!
//! Streaming replies arrive as `data: {json}` lines carrying
//! `choices[0].delta.content`, terminated by `data: [DONE]`. Some local
//! servers ignore `stream` and answer with one JSON body; that is accepted
//! as a single increment.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::traits::{
    BackendConfig, BackendError, ChatBackend, ChatRequest, ChatResponse, SafetyBlock,
    StreamingToken,
};

/// Channel capacity between the reader task and the session
const STREAM_BUFFER: usize = 100;

/// Longest error body kept in `BackendError::Status`
const MAX_ERROR_BODY: usize = 2048;

/// OpenAI-compatible backend client
#[derive(Clone)]
pub struct OpenAiCompatBackend {
    config: BackendConfig,
    http_client: reqwest::Client,
}

impl OpenAiCompatBackend {
    /// Create a backend from configuration
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Client` if the HTTP client cannot be built.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    /// Create from environment variables
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Client` if the HTTP client cannot be built.
    pub fn from_env() -> Result<Self, BackendError> {
        Self::new(BackendConfig::from_env())
    }

    /// Configuration in use
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url())
    }

    fn models_url(&self) -> String {
        format!("{}/v1/models", self.base_url())
    }

    /// Build the JSON payload for a request
    fn payload(request: &ChatRequest, stream: bool) -> Value {
        let mut payload = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
            "stream": stream,
        });
        if let Some(top_k) = request.top_k {
            payload["top_k"] = serde_json::json!(top_k);
        }
        payload
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, BackendError> {
        let mut builder = self.http_client.post(self.completions_url()).json(payload);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

impl std::fmt::Debug for OpenAiCompatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatBackend")
            .field("base_url", &self.config.base_url)
            .field("api_key", &self.config.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatBackend {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn health_check(&self) -> bool {
        let mut builder = self
            .http_client
            .get(self.models_url())
            .timeout(Duration::from_secs(5));
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn send_streaming(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let response = self.post(&Self::payload(request, true)).await?;

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));

        tracing::debug!(model = %request.model, is_json, "Completion stream opened");

        if is_json {
            tokio::spawn(async move {
                let body = tokio::select! {
                    () = cancel.cancelled() => return,
                    body = response.bytes() => body,
                };
                let token = match body {
                    Ok(bytes) => match serde_json::from_slice::<Value>(&bytes)
                        .map_err(|e| BackendError::Malformed(e.to_string()))
                        .and_then(|data| extract_reply(&data))
                    {
                        Ok((message, safety)) => {
                            if !message.is_empty()
                                && tx.send(StreamingToken::Token(message.clone())).await.is_err()
                            {
                                return;
                            }
                            StreamingToken::Complete { message, safety }
                        }
                        Err(e) => StreamingToken::Error(e.to_string()),
                    },
                    Err(e) => StreamingToken::Error(e.to_string()),
                };
                let _ = tx.send(token).await;
            });
        } else {
            tokio::spawn(pump_sse(response.bytes_stream(), tx, cancel));
        }

        Ok(rx)
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, BackendError> {
        let start = Instant::now();
        let response = self.post(&Self::payload(request, false)).await?;
        let data: Value = response.json().await?;
        let (content, safety) = extract_reply(&data)?;

        let tokens_used = data
            .pointer("/usage/total_tokens")
            .and_then(Value::as_u64)
            .map(|c| c as u32);
        let model = data
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(request.model.as_str())
            .to_string();

        Ok(ChatResponse {
            content,
            model,
            safety,
            tokens_used,
            duration_ms: Some(start.elapsed().as_millis() as u64),
        })
    }
}

/// One interpreted SSE line
#[derive(Debug, PartialEq)]
enum SseLine {
    /// A content increment, possibly empty
    Delta {
        content: String,
        safety: Option<SafetyBlock>,
    },
    /// End-of-stream marker
    Done,
    /// Comments, blank lines and non-data fields
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, BackendError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let value: Value =
        serde_json::from_str(data).map_err(|e| BackendError::Malformed(e.to_string()))?;
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string);
        return Err(BackendError::Malformed(format!("server error: {message}")));
    }

    let content = value
        .pointer("/choices/0/delta/content")
        .or_else(|| value.pointer("/choices/0/message/content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(SseLine::Delta {
        content,
        safety: safety_block(&value),
    })
}

/// Read an SSE byte stream into streaming tokens
///
/// Lines are split on raw bytes so multi-byte characters split across
/// chunks are decoded intact. Stops when `cancel` fires or the receiver
/// goes away. A stream that ends before `[DONE]` reports an error.
async fn pump_sse<S, B, E>(stream: S, tx: mpsc::Sender<StreamingToken>, cancel: CancellationToken)
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let mut stream = std::pin::pin!(stream);
    let mut buffer: Vec<u8> = Vec::new();
    let mut reply = SseReply::default();

    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(received = reply.text.len(), "Stream reader cancelled");
                return;
            }
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else { break };
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                return;
            }
        };
        buffer.extend_from_slice(bytes.as_ref());

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if reply.feed(&line, &tx).await.is_break() {
                return;
            }
        }
    }

    // Last line without a trailing newline
    if !buffer.is_empty() && reply.feed(&buffer, &tx).await.is_break() {
        return;
    }

    tracing::warn!(received = reply.text.len(), "Stream ended without [DONE]");
    let _ = tx
        .send(StreamingToken::Error("stream ended before completion".to_string()))
        .await;
}

/// Reply accumulated from SSE lines
#[derive(Default)]
struct SseReply {
    text: String,
    safety: Option<SafetyBlock>,
}

impl SseReply {
    /// Forward one raw line; `Break` once the stream is finished or unwanted
    async fn feed(&mut self, line: &[u8], tx: &mpsc::Sender<StreamingToken>) -> ControlFlow<()> {
        let line = String::from_utf8_lossy(line);
        match parse_sse_line(&line) {
            Ok(SseLine::Delta { content, safety }) => {
                if safety.is_some() {
                    self.safety = safety;
                }
                if content.is_empty() {
                    return ControlFlow::Continue(());
                }
                self.text.push_str(&content);
                if tx.send(StreamingToken::Token(content)).await.is_err() {
                    // Receiver dropped
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
            Ok(SseLine::Done) => {
                let _ = tx
                    .send(StreamingToken::Complete {
                        message: std::mem::take(&mut self.text),
                        safety: self.safety.take(),
                    })
                    .await;
                ControlFlow::Break(())
            }
            Ok(SseLine::Skip) => ControlFlow::Continue(()),
            Err(e) => {
                let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                ControlFlow::Break(())
            }
        }
    }
}

/// Provider safety report, if the reply was blocked
fn safety_block(data: &Value) -> Option<SafetyBlock> {
    let attributes = data.pointer("/predictions/0/safetyAttributes")?;
    let blocked = attributes
        .get("blocked")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    blocked.then(|| SafetyBlock {
        details: attributes.clone(),
    })
}

/// Reply text and safety report of a whole (non-streamed) response
fn extract_reply(data: &Value) -> Result<(String, Option<SafetyBlock>), BackendError> {
    let safety = safety_block(data);
    let content = data
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string);

    match (content, safety) {
        (Some(content), safety) => Ok((content, safety)),
        (None, Some(safety)) => Ok((String::new(), Some(safety))),
        (None, None) => Err(BackendError::Malformed(
            "response has no choices[0].message.content".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatMessage, Role};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest::new("vicuna", vec![ChatMessage::new(Role::User, "Hello")])
    }

    fn backend(server: &MockServer) -> OpenAiCompatBackend {
        OpenAiCompatBackend::new(BackendConfig::new(server.uri())).unwrap()
    }

    async fn drain(mut rx: mpsc::Receiver<StreamingToken>) -> Vec<StreamingToken> {
        let mut tokens = Vec::new();
        while let Some(token) = rx.recv().await {
            tokens.push(token);
        }
        tokens
    }

    #[test]
    fn test_payload_shape() {
        let payload = OpenAiCompatBackend::payload(&request().with_top_k(Some(40)), true);
        assert_eq!(payload["model"], "vicuna");
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["top_k"], 40);

        let payload = OpenAiCompatBackend::payload(&request(), false);
        assert!(payload.get("top_k").is_none());
        assert_eq!(payload["stream"], false);
    }

    #[test]
    fn test_parse_sse_lines() {
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap(),
            SseLine::Delta {
                content: "Hi".to_string(),
                safety: None
            }
        );
        assert!(matches!(
            parse_sse_line("data: {not json"),
            Err(BackendError::Malformed(_))
        ));
        assert!(matches!(
            parse_sse_line(r#"data: {"error":{"message":"overloaded"}}"#),
            Err(BackendError::Malformed(ref m)) if m.contains("overloaded")
        ));
    }

    #[test]
    fn test_extract_reply() {
        let data = serde_json::json!({"choices": [{"message": {"content": "Hi there"}}]});
        let (content, safety) = extract_reply(&data).unwrap();
        assert_eq!(content, "Hi there");
        assert!(safety.is_none());

        let blocked = serde_json::json!({
            "choices": [{"message": {"content": "partial"}}],
            "predictions": [{"safetyAttributes": {"blocked": true, "categories": ["x"]}}]
        });
        let (content, safety) = extract_reply(&blocked).unwrap();
        assert_eq!(content, "partial");
        assert_eq!(safety.unwrap().details["categories"][0], "x");

        let not_blocked = serde_json::json!({
            "choices": [{"message": {"content": "ok"}}],
            "predictions": [{"safetyAttributes": {"blocked": false}}]
        });
        assert!(extract_reply(&not_blocked).unwrap().1.is_none());

        assert!(extract_reply(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn test_pump_handles_split_utf8() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"¡Hola!\"}}]}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC2).unwrap() + 1;
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(line[..split].to_vec()),
            Ok(line[split..].to_vec()),
            Ok(b"data: [DONE]\n".to_vec()),
        ];

        let (tx, rx) = mpsc::channel(8);
        pump_sse(futures::stream::iter(chunks), tx, CancellationToken::new()).await;
        let tokens = drain(rx).await;
        assert_eq!(
            tokens,
            vec![
                StreamingToken::Token("¡Hola!".to_string()),
                StreamingToken::Complete {
                    message: "¡Hola!".to_string(),
                    safety: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_pump_stops_on_cancel() {
        let first: Vec<Result<Vec<u8>, std::io::Error>> =
            vec![Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n".to_vec())];
        let stream = futures::stream::iter(first).chain(futures::stream::pending());

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(pump_sse(stream, tx, cancel.clone()));

        assert_eq!(rx.recv().await, Some(StreamingToken::Token("Hi".to_string())));
        cancel.cancel();
        reader.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_pump_without_done_is_an_error() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n".to_vec(),
        )];
        let (tx, rx) = mpsc::channel(8);
        pump_sse(futures::stream::iter(chunks), tx, CancellationToken::new()).await;
        let tokens = drain(rx).await;
        assert_eq!(tokens.len(), 2);
        assert!(matches!(tokens[0], StreamingToken::Token(ref t) if t == "Hi"));
        assert!(matches!(tokens[1], StreamingToken::Error(ref e) if e == "stream ended before completion"));
    }

    #[tokio::test]
    async fn test_pump_reads_last_line_without_newline() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\" all\"}}]}\n\ndata: [DONE]".to_vec()),
        ];
        let (tx, rx) = mpsc::channel(8);
        pump_sse(futures::stream::iter(chunks), tx, CancellationToken::new()).await;
        let tokens = drain(rx).await;
        assert_eq!(tokens.len(), 3);
        assert!(matches!(tokens[2], StreamingToken::Complete { ref message, .. } if message == "Hi all"));
    }

    #[tokio::test]
    async fn test_streaming_over_http() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"stream": true, "model": "vicuna"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let rx = backend(&server)
            .send_streaming(&request(), CancellationToken::new())
            .await
            .unwrap();
        let tokens = drain(rx).await;
        assert_eq!(
            tokens,
            vec![
                StreamingToken::Token("Hi".to_string()),
                StreamingToken::Token(" there".to_string()),
                StreamingToken::Complete {
                    message: "Hi there".to_string(),
                    safety: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_json_body_accepted_as_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Hi there"}}]
            })))
            .mount(&server)
            .await;

        let rx = backend(&server)
            .send_streaming(&request(), CancellationToken::new())
            .await
            .unwrap();
        let tokens = drain(rx).await;
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0], StreamingToken::Token("Hi there".to_string()));
    }

    #[tokio::test]
    async fn test_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("model loading"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .send_streaming(&request(), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            BackendError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "model loading");
            }
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_with_bearer_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "vicuna-13b",
                "choices": [{"message": {"content": "Greetings"}}],
                "usage": {"total_tokens": 12}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = BackendConfig::new(server.uri());
        config.api_key = Some("secret".to_string());
        let backend = OpenAiCompatBackend::new(config).unwrap();

        let response = backend.send(&request().with_stream(false)).await.unwrap();
        assert_eq!(response.content, "Greetings");
        assert_eq!(response.model, "vicuna-13b");
        assert_eq!(response.tokens_used, Some(12));
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;
        assert!(backend(&server).health_check().await);

        let unreachable =
            OpenAiCompatBackend::new(BackendConfig::new("http://127.0.0.1:9")).unwrap();
        assert!(!unreachable.health_check().await);
    }
}
