//! External collaborator seams
//!
//! The engine treats managed inference, web search, speech synthesis, and
//! title generation as black boxes behind traits. Callers apply a uniform
//! absorb-and-degrade policy: a collaborator failure is logged and the turn
//! proceeds without that collaborator's contribution. Only dispatch
//! failures are surfaced to the user, and that happens in-band through the
//! assistant message.

use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use std::error::Error as StdError;
use std::fmt;
use tokio::sync::mpsc;

use crate::api::ChatMessage;
use crate::utils::url::construct_api_url;

#[derive(Debug)]
pub enum CollabError {
    /// The collaborator is not configured; degrade silently.
    Disabled(&'static str),
    Transport(String),
    Upstream { status: u16, body: String },
    Malformed(String),
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollabError::Disabled(name) => write!(f, "{name} collaborator is disabled"),
            CollabError::Transport(detail) => write!(f, "collaborator transport error: {detail}"),
            CollabError::Upstream { status, body } => {
                write!(f, "collaborator returned status {status}: {body}")
            }
            CollabError::Malformed(detail) => {
                write!(f, "collaborator response was malformed: {detail}")
            }
        }
    }
}

impl StdError for CollabError {}

/// One managed (cloud) chat turn, already split the way the managed wire
/// format wants it: system text, trailing history, final user message.
#[derive(Debug, Clone)]
pub struct ManagedChatRequest {
    pub model: String,
    pub system: String,
    pub history: Vec<ChatMessage>,
    pub user: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

/// Cloud chat completion as a stream of text fragments. The channel closes
/// when generation completes; an `Err` item ends the stream.
#[async_trait]
pub trait ManagedInference: Send + Sync {
    async fn stream_chat(
        &self,
        request: ManagedChatRequest,
    ) -> Result<mpsc::UnboundedReceiver<Result<String, CollabError>>, CollabError>;
}

/// Grounding text lookup for a user query.
#[async_trait]
pub trait WebSearcher: Send + Sync {
    async fn search(&self, query: &str) -> Result<String, CollabError>;
}

/// Speaks a finished assistant reply. Playback is fire-and-forget.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn speak(&self, text: &str) -> Result<(), CollabError>;
}

/// Derives a short session title from the first user message.
#[async_trait]
pub trait TitleGenerator: Send + Sync {
    async fn derive_title(&self, first_message: &str) -> Result<String, CollabError>;
}

/// Reqwest-backed client for a managed generative-AI provider speaking the
/// `streamGenerateContent?alt=sse` wire shape.
pub struct GenerativeClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GenerativeClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}?alt=sse",
            construct_api_url(
                &self.base_url,
                &format!("v1beta/models/{model}:streamGenerateContent")
            )
        )
    }

    fn request_body(request: &ManagedChatRequest) -> serde_json::Value {
        let mut contents: Vec<serde_json::Value> = request
            .history
            .iter()
            .map(|message| {
                let role = if message.role == "assistant" { "model" } else { "user" };
                serde_json::json!({ "role": role, "parts": [{ "text": message.content }] })
            })
            .collect();
        contents.push(serde_json::json!({ "role": "user", "parts": [{ "text": request.user }] }));

        serde_json::json!({
            "system_instruction": { "parts": [{ "text": request.system }] },
            "contents": contents,
            "generationConfig": {
                "temperature": request.temperature,
                "topP": request.top_p,
                "maxOutputTokens": request.max_tokens,
            }
        })
    }
}

/// Text fragment carried by one managed SSE payload, if any.
fn extract_candidate_text(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(|text| text.as_str())
        .map(str::to_owned)
}

#[async_trait]
impl ManagedInference for GenerativeClient {
    async fn stream_chat(
        &self,
        request: ManagedChatRequest,
    ) -> Result<mpsc::UnboundedReceiver<Result<String, CollabError>>, CollabError> {
        let url = self.stream_url(&request.model);
        let body = Self::request_body(&request);

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CollabError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(CollabError::Upstream { status, body });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = stream.next().await {
                let chunk_bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(CollabError::Transport(e.to_string())));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk_bytes);

                while let Some(newline_pos) = memchr(b'\n', &buffer) {
                    if let Ok(line) = std::str::from_utf8(&buffer[..newline_pos]) {
                        if let Some(payload) = line.trim().strip_prefix("data:") {
                            if let Some(text) = extract_candidate_text(payload.trim_start()) {
                                if tx.send(Ok(text)).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    buffer.drain(..=newline_pos);
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl TitleGenerator for GenerativeClient {
    async fn derive_title(&self, first_message: &str) -> Result<String, CollabError> {
        let url = construct_api_url(
            &self.base_url,
            "v1beta/models/gemini-2.0-flash:generateContent",
        );
        let prompt = format!(
            "Reply with a chat title of at most six words, no quotes, for a conversation that starts: {first_message}"
        );
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }]
        });

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CollabError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(CollabError::Upstream { status, body });
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CollabError::Malformed(e.to_string()))?;
        value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|text| text.as_str())
            .map(|title| title.trim().trim_matches('"').to_string())
            .filter(|title| !title.is_empty())
            .ok_or_else(|| CollabError::Malformed("no title candidate in response".into()))
    }
}

/// Stand-ins for unconfigured collaborators. Every call degrades.
pub struct Disabled;

#[async_trait]
impl ManagedInference for Disabled {
    async fn stream_chat(
        &self,
        _request: ManagedChatRequest,
    ) -> Result<mpsc::UnboundedReceiver<Result<String, CollabError>>, CollabError> {
        Err(CollabError::Disabled("managed inference"))
    }
}

#[async_trait]
impl WebSearcher for Disabled {
    async fn search(&self, _query: &str) -> Result<String, CollabError> {
        Err(CollabError::Disabled("web search"))
    }
}

#[async_trait]
impl SpeechSynthesizer for Disabled {
    async fn speak(&self, _text: &str) -> Result<(), CollabError> {
        Err(CollabError::Disabled("speech synthesis"))
    }
}

/// Title derivation that never leaves the process: truncate the first user
/// message. Used as the fallback when no managed provider is configured,
/// and by the turn coordinator when the configured one fails.
pub struct TruncatingTitler;

#[async_trait]
impl TitleGenerator for TruncatingTitler {
    async fn derive_title(&self, first_message: &str) -> Result<String, CollabError> {
        Ok(crate::core::store::derived_title(first_message))
    }
}
