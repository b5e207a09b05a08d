//! Dispatch router and unified chat stream
//!
//! Accepts a normalized chat request and produces one stream of
//! [`StreamMessage`] values regardless of backend. Cloud connections go
//! through the managed-inference collaborator; self-hosted connections get
//! an OpenAI-style `chat/completions` POST with a sequential
//! localhost→127.0.0.1 candidate fallback. Turn-specific prompt
//! augmentation (time marker, best-effort grounding) happens here, at
//! dispatch time, never in the composer.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use chrono::Local;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;

use crate::api::{ChatMessage, ChatRequest, ChatResponse, GenerationSettings};
use crate::collab::{ManagedChatRequest, ManagedInference, WebSearcher};
use crate::core::prompt::augment_system_prompt;
use crate::core::store::ProviderKind;
use crate::utils::url::{candidate_urls, chat_completions_url};

#[derive(Clone, Debug)]
pub enum StreamMessage {
    Chunk(String),
    Error(String),
    End,
}

#[derive(Debug)]
pub enum DispatchError {
    MissingBaseUrl,
    Upstream { status: u16, body: String },
    Transport(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::MissingBaseUrl => {
                write!(f, "No base URL configured for the target connection")
            }
            DispatchError::Upstream { status, body } => {
                write!(f, "Upstream returned status {status}: {body}")
            }
            DispatchError::Transport(detail) => write!(f, "{detail}"),
        }
    }
}

impl StdError for DispatchError {}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn handle_data_payload(
    payload: &str,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    stream_id: u64,
) -> bool {
    if payload == "[DONE]" {
        let _ = tx.send((StreamMessage::End, stream_id));
        return true;
    }

    // Malformed fragments are skipped; a well-formed error payload in the
    // stream ends the turn with an in-band error.
    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            if let Some(choice) = response.choices.first() {
                if let Some(content) = &choice.delta.content {
                    let _ = tx.send((StreamMessage::Chunk(content.clone()), stream_id));
                }
            }
            false
        }
        Err(_) => {
            if serde_json::from_str::<serde_json::Value>(payload)
                .ok()
                .as_ref()
                .and_then(extract_error_summary)
                .is_some()
            {
                let _ = tx.send((StreamMessage::Error(format_api_error(payload)), stream_id));
                let _ = tx.send((StreamMessage::End, stream_id));
                return true;
            }
            false
        }
    }
}

fn process_sse_line(
    line: &str,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    stream_id: u64,
) -> bool {
    extract_data_payload(line)
        .map(|payload| handle_data_payload(payload, tx, stream_id))
        .unwrap_or(false)
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Format an upstream error body for in-band display in the assistant
/// message bubble.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error: <empty response>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value) {
            if !summary.is_empty() {
                return format!("API Error: {summary}");
            }
        }
        return format!("API Error: {trimmed}");
    }

    format!("API Error: {trimmed}")
}

/// Apply dispatch-time augmentation: prefix the system message with the
/// current-time marker and, when grounding is requested, append web-search
/// results keyed on the most recent user message. The search is
/// best-effort; failure degrades to no grounding text.
pub async fn augment_messages(
    messages: &mut Vec<ChatMessage>,
    searcher: &dyn WebSearcher,
    web_search: bool,
) {
    let grounding = if web_search {
        let query = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if query.is_empty() {
            None
        } else {
            match searcher.search(&query).await {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(error = %e, "grounding search failed, continuing without it");
                    None
                }
            }
        }
    } else {
        None
    };

    let base = messages
        .iter()
        .find(|m| m.role == "system")
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let augmented = augment_system_prompt(&base, Local::now(), grounding.as_deref());

    match messages.iter_mut().find(|m| m.role == "system") {
        Some(system) => system.content = augmented,
        None => messages.insert(0, ChatMessage::new("system", augmented)),
    }
}

/// Try each candidate URL in order, sequentially, returning the first
/// attempt that does not fail at the transport level. A candidate is only
/// retried with the next URL when the request itself throws; an HTTP
/// response of any status stops the loop. Sequential attempts bound
/// resource usage on flaky local networks.
pub(crate) async fn first_transport_success<T>(
    candidates: Vec<String>,
    mut attempt: impl FnMut(String) -> BoxFuture<'static, Result<T, String>>,
) -> Result<T, DispatchError> {
    let mut last_error: Option<DispatchError> = None;
    for candidate in candidates {
        match attempt(candidate.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(candidate = %candidate, error = %e, "candidate URL failed");
                last_error = Some(DispatchError::Transport(e));
            }
        }
    }
    Err(last_error.unwrap_or(DispatchError::MissingBaseUrl))
}

/// POST the streaming chat request, falling back through candidate URLs,
/// and check the response status. Non-2xx upstream responses become a
/// [`DispatchError::Upstream`] carrying the upstream error text.
pub async fn open_chat_completions(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
    request: &ChatRequest,
) -> Result<reqwest::Response, DispatchError> {
    if base_url.trim().is_empty() {
        return Err(DispatchError::MissingBaseUrl);
    }

    let url = chat_completions_url(base_url);
    let body = serde_json::to_value(request)
        .map_err(|e| DispatchError::Transport(e.to_string()))?;
    let api_key = api_key.filter(|key| !key.is_empty()).map(str::to_owned);

    let response = first_transport_success(candidate_urls(&url), move |candidate| {
        let client = client.clone();
        let body = body.clone();
        let api_key = api_key.clone();
        Box::pin(async move {
            let mut http_request = client
                .post(&candidate)
                .header("Content-Type", "application/json");
            if let Some(key) = api_key {
                http_request = http_request.header("Authorization", format!("Bearer {key}"));
            }
            http_request
                .json(&body)
                .send()
                .await
                .map_err(|e| e.to_string())
        })
    })
    .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        return Err(DispatchError::Upstream { status, body });
    }

    Ok(response)
}

/// Split an ordered message list the way the managed wire format wants it:
/// system text, trailing history, final user message.
pub fn split_for_managed(messages: &[ChatMessage]) -> (String, Vec<ChatMessage>, String) {
    let system = messages
        .iter()
        .find(|m| m.role == "system")
        .map(|m| m.content.clone())
        .unwrap_or_default();

    let conversational: Vec<&ChatMessage> = messages
        .iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .collect();

    let (user, history) = match conversational.split_last() {
        Some((last, rest)) if last.role == "user" => {
            (last.content.clone(), rest.iter().map(|m| (*m).clone()).collect())
        }
        _ => (
            String::new(),
            conversational.into_iter().cloned().collect(),
        ),
    };

    (system, history, user)
}

pub struct StreamParams {
    pub provider: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub api_messages: Vec<ChatMessage>,
    pub settings: GenerationSettings,
    pub cancel_token: tokio_util::sync::CancellationToken,
    pub stream_id: u64,
}

#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamMessage, u64)>,
    client: reqwest::Client,
    managed: Arc<dyn ManagedInference>,
    searcher: Arc<dyn WebSearcher>,
}

impl ChatStreamService {
    pub fn new(
        client: reqwest::Client,
        managed: Arc<dyn ManagedInference>,
        searcher: Arc<dyn WebSearcher>,
    ) -> (Self, mpsc::UnboundedReceiver<(StreamMessage, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                client,
                managed,
                searcher,
            },
            rx,
        )
    }

    pub fn spawn_stream(&self, params: StreamParams) {
        let tx = self.tx.clone();
        let client = self.client.clone();
        let managed = Arc::clone(&self.managed);
        let searcher = Arc::clone(&self.searcher);

        tokio::spawn(async move {
            let StreamParams {
                provider,
                base_url,
                api_key,
                model,
                mut api_messages,
                settings,
                cancel_token,
                stream_id,
            } = params;

            let cancelled = cancel_token.clone();
            tokio::select! {
                _ = async {
                    augment_messages(&mut api_messages, searcher.as_ref(), settings.web_search_enabled)
                        .await;

                    if provider.is_cloud() {
                        run_managed_stream(
                            managed.as_ref(),
                            model,
                            api_messages,
                            settings,
                            &tx,
                            &cancel_token,
                            stream_id,
                        )
                        .await;
                    } else {
                        run_local_stream(
                            &client,
                            base_url,
                            api_key,
                            model,
                            api_messages,
                            settings,
                            &tx,
                            &cancel_token,
                            stream_id,
                        )
                        .await;
                    }
                } => {}
                _ = cancelled.cancelled() => {
                    // The consumer blocks on this channel; an abandoned turn
                    // still has to reach Done.
                    let _ = tx.send((StreamMessage::End, stream_id));
                }
            }
        });
    }
}

async fn run_managed_stream(
    managed: &dyn ManagedInference,
    model: String,
    api_messages: Vec<ChatMessage>,
    settings: GenerationSettings,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    cancel_token: &tokio_util::sync::CancellationToken,
    stream_id: u64,
) {
    let (system, history, user) = split_for_managed(&api_messages);
    let request = ManagedChatRequest {
        model,
        system,
        history,
        user,
        temperature: settings.temperature,
        top_p: settings.top_p,
        max_tokens: settings.max_tokens,
    };

    let mut fragments = match managed.stream_chat(request).await {
        Ok(fragments) => fragments,
        Err(e) => {
            let _ = tx.send((StreamMessage::Error(format_api_error(&e.to_string())), stream_id));
            let _ = tx.send((StreamMessage::End, stream_id));
            return;
        }
    };

    while let Some(fragment) = fragments.recv().await {
        if cancel_token.is_cancelled() {
            let _ = tx.send((StreamMessage::End, stream_id));
            return;
        }
        match fragment {
            Ok(text) => {
                let _ = tx.send((StreamMessage::Chunk(text), stream_id));
            }
            Err(e) => {
                let _ = tx.send((StreamMessage::Error(format_api_error(&e.to_string())), stream_id));
                let _ = tx.send((StreamMessage::End, stream_id));
                return;
            }
        }
    }

    let _ = tx.send((StreamMessage::End, stream_id));
}

#[allow(clippy::too_many_arguments)]
async fn run_local_stream(
    client: &reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    api_messages: Vec<ChatMessage>,
    settings: GenerationSettings,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    cancel_token: &tokio_util::sync::CancellationToken,
    stream_id: u64,
) {
    let request = ChatRequest {
        model,
        messages: api_messages,
        stream: true,
        temperature: Some(settings.temperature),
        top_p: Some(settings.top_p),
        max_tokens: Some(settings.max_tokens),
    };

    let response =
        match open_chat_completions(client, &base_url, api_key.as_deref(), &request).await {
            Ok(response) => response,
            Err(e) => {
                let _ = tx.send((StreamMessage::Error(format_api_error(&e.to_string())), stream_id));
                let _ = tx.send((StreamMessage::End, stream_id));
                return;
            }
        };

    forward_sse_body(response, tx, cancel_token, stream_id).await;
}

/// Read an upstream SSE body to completion, decoding incrementally and
/// forwarding each `data:` line as a [`StreamMessage`]. The cancellation
/// token is checked at every chunk-read boundary.
pub(crate) async fn forward_sse_body(
    response: reqwest::Response,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    cancel_token: &tokio_util::sync::CancellationToken,
    stream_id: u64,
) {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        if cancel_token.is_cancelled() {
            let _ = tx.send((StreamMessage::End, stream_id));
            return;
        }

        match chunk {
            Ok(chunk_bytes) => buffer.extend_from_slice(&chunk_bytes),
            Err(e) => {
                // A dropped upstream connection is a failed turn, not a
                // completed one.
                let _ = tx.send((StreamMessage::Error(format_api_error(&e.to_string())), stream_id));
                let _ = tx.send((StreamMessage::End, stream_id));
                return;
            }
        }

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let line = match std::str::from_utf8(&buffer[..newline_pos]) {
                Ok(s) => s.trim().to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "invalid UTF-8 in stream, skipping line");
                    buffer.drain(..=newline_pos);
                    continue;
                }
            };

            let should_end = process_sse_line(&line, tx, stream_id);
            buffer.drain(..=newline_pos);
            if should_end {
                return;
            }
        }
    }

    let _ = tx.send((StreamMessage::End, stream_id));
}
