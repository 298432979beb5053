//! LLM provider access: chat completions (full and token-streamed) and
//! embeddings behind one client value, so any OpenAI-compatible endpoint
//! can be plugged in. A scripted variant replays canned streams for tests
//! and offline runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Errors surfaced by provider calls.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider request timed out")]
    Timeout,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("prompt exceeds the model context window")]
    ContextTooLarge,

    #[error("network error: {0}")]
    Network(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// An async token stream; chunks arrive in model order.
pub struct TokenStream {
    rx: mpsc::Receiver<ProviderResult<String>>,
}

impl TokenStream {
    pub async fn next(&mut self) -> Option<ProviderResult<String>> {
        self.rx.recv().await
    }

    /// Build a stream from pre-split chunks (scripted replay).
    pub fn from_chunks(chunks: Vec<String>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Self { rx }
    }
}

/// Provider client: a small closed set of variants selected at startup.
pub enum LlmClient {
    OpenAi(OpenAiClient),
    Scripted(ScriptedClient),
}

impl LlmClient {
    /// Full chat completion (selector and agent calls).
    pub async fn chat(&self, messages: &[ChatMessage]) -> ProviderResult<String> {
        match self {
            LlmClient::OpenAi(c) => c.chat(messages).await,
            LlmClient::Scripted(c) => c.chat(messages),
        }
    }

    /// Streaming chat completion for the main edit loop.
    pub async fn chat_stream(&self, messages: &[ChatMessage]) -> ProviderResult<TokenStream> {
        match self {
            LlmClient::OpenAi(c) => c.chat_stream(messages).await,
            LlmClient::Scripted(c) => c.chat_stream(messages),
        }
    }

    /// Embedding vectors for similarity ranking.
    pub async fn embed(&self, texts: &[String]) -> ProviderResult<Vec<Vec<f32>>> {
        match self {
            LlmClient::OpenAi(c) => c.embed(texts).await,
            LlmClient::Scripted(c) => Ok(c.embed(texts)),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireContent,
}

#[derive(Deserialize)]
struct WireContent {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkResponse {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: WireContent,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// OpenAI-compatible HTTP client.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    embedding_model: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        embedding_model: &str,
        temperature: f32,
    ) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            embedding_model: embedding_model.to_string(),
            temperature,
        })
    }

    fn wire_messages<'a>(messages: &'a [ChatMessage]) -> Vec<WireMessage<'a>> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect()
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(url).header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        builder
    }

    fn classify_failure(status: reqwest::StatusCode, body: String) -> ProviderError {
        if status.as_u16() == 429 {
            return ProviderError::RateLimited;
        }
        if body.contains("context_length") || body.contains("maximum context") {
            return ProviderError::ContextTooLarge;
        }
        ProviderError::BadRequest(format!("{status}: {}", &body[..body.len().min(500)]))
    }

    fn transport_error(e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(e.to_string())
        }
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> ProviderResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: Self::wire_messages(messages),
            temperature: self.temperature,
            stream: false,
        };

        let response = self
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::classify_failure(status, body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::BadRequest(format!("unparseable response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::BadRequest("no content in response".to_string()))
    }

    pub async fn chat_stream(&self, messages: &[ChatMessage]) -> ProviderResult<TokenStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: Self::wire_messages(messages),
            temperature: self.temperature,
            stream: true,
        };

        let response = self
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.map_err(Self::transport_error)?;
            return Err(Self::classify_failure(status, body));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut pending = String::new();

            while let Some(item) = stream.next().await {
                let chunk = match item {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(Self::transport_error(e))).await;
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are newline-delimited `data: {json}` lines
                while let Some(pos) = pending.find('\n') {
                    let line = pending[..pos].trim().to_string();
                    pending.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Ok(parsed) = serde_json::from_str::<ChunkResponse>(payload) {
                        if let Some(content) = parsed
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content)
                        {
                            if !content.is_empty() && tx.send(Ok(content)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(TokenStream { rx })
    }

    pub async fn embed(&self, texts: &[String]) -> ProviderResult<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = serde_json::json!({
            "model": self.embedding_model,
            "input": texts,
        });

        let response = self
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::classify_failure(status, body));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::BadRequest(format!("unparseable embeddings: {e}")))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Replays canned responses in order; embeddings are deterministic hashes
/// of the input text. Backs tests and offline dry-runs.
#[derive(Default)]
pub struct ScriptedClient {
    responses: Mutex<VecDeque<Vec<String>>>,

    /// Chat requests seen, for assertions
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response, already split into stream chunks.
    pub fn push_chunks(&self, chunks: Vec<&str>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(chunks.into_iter().map(str::to_string).collect());
    }

    /// Queue one response delivered as a single chunk.
    pub fn push_response(&self, response: &str) {
        self.push_chunks(vec![response]);
    }

    pub fn seen_requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self, messages: &[ChatMessage]) -> ProviderResult<Vec<String>> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::BadRequest("scripted client exhausted".to_string()))
    }

    pub fn chat(&self, messages: &[ChatMessage]) -> ProviderResult<String> {
        Ok(self.next_response(messages)?.concat())
    }

    pub fn chat_stream(&self, messages: &[ChatMessage]) -> ProviderResult<TokenStream> {
        Ok(TokenStream::from_chunks(self.next_response(messages)?))
    }

    pub fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| Self::pseudo_embedding(t)).collect()
    }

    /// Deterministic 8-dim vector derived from the text hash.
    fn pseudo_embedding(text: &str) -> Vec<f32> {
        let h = xxhash_rust::xxh64::xxh64(text.as_bytes(), 0);
        (0..8)
            .map(|i| {
                let byte = ((h >> (i * 8)) & 0xFF) as f32;
                byte / 255.0
            })
            .collect()
    }
}
