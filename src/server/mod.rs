//! HTTP surface
//!
//! `POST /api/chat/stream` accepts a normalized chat request and answers
//! with a `text/event-stream` body of OpenAI-style delta frames terminated
//! by `data: [DONE]`, regardless of what the upstream produced. Failures
//! detected before streaming begins come back as JSON `{"error": ...}`
//! with a 400 (missing base URL) or 500 (upstream/transport) status.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{delta_frame, ChatRequest, ChatStreamBody};
use crate::collab::WebSearcher;
use crate::core::chat_stream::{
    augment_messages, forward_sse_body, open_chat_completions, DispatchError, StreamMessage,
};

#[derive(Clone)]
pub struct ServerState {
    pub client: reqwest::Client,
    pub searcher: Arc<dyn WebSearcher>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/health", get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn error_response(status: StatusCode, error: &DispatchError) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": error.to_string() })),
    )
        .into_response()
}

fn event_for(message: StreamMessage) -> Event {
    match message {
        StreamMessage::Chunk(content) => Event::default().data(delta_frame(&content).to_string()),
        StreamMessage::Error(text) => {
            Event::default().data(serde_json::json!({ "error": text }).to_string())
        }
        StreamMessage::End => Event::default().data("[DONE]"),
    }
}

async fn chat_stream(
    State(state): State<ServerState>,
    Json(body): Json<ChatStreamBody>,
) -> Response {
    if body.base_url.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, &DispatchError::MissingBaseUrl);
    }

    let mut messages = body.messages;
    augment_messages(
        &mut messages,
        state.searcher.as_ref(),
        body.settings.web_search_enabled,
    )
    .await;

    let request = ChatRequest {
        model: body.model_id,
        messages,
        stream: true,
        temperature: Some(body.settings.temperature),
        top_p: Some(body.settings.top_p),
        max_tokens: Some(body.settings.max_tokens),
    };

    let upstream = match open_chat_completions(
        &state.client,
        &body.base_url,
        body.api_key.as_deref(),
        &request,
    )
    .await
    {
        Ok(upstream) => upstream,
        Err(e @ DispatchError::MissingBaseUrl) => {
            return error_response(StatusCode::BAD_REQUEST, &e)
        }
        Err(e) => {
            tracing::warn!(error = %e, "chat dispatch failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e);
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        // Stream abandonment (client gone) closes the channel; nothing
        // cancels the token here beyond process shutdown.
        let cancel_token = CancellationToken::new();
        forward_sse_body(upstream, &tx, &cancel_token, 0).await;
    });

    // The pump drops its sender after [DONE], which ends this stream.
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|(message, _)| (Ok::<Event, std::convert::Infallible>(event_for(message)), rx))
    });

    let mut response = Sse::new(stream).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    response
}
