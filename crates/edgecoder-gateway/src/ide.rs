// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! OpenAI-compatible IDE provider (default :4304).
//!
//! Editors speak the chat-completions wire format; this shim translates it
//! onto the local model so any OpenAI-capable IDE plugin can use the mesh
//! node directly.
//!
//! Streaming responses are a lazy sequence of `data:` chunks terminated by
//! the explicit `data: [DONE]` sentinel; dropping the connection cancels the
//! stream.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use edgecoder_crypto::now_ms;
use edgecoder_model::GenerateRequest;
use edgecoder_node::ApiError;

use crate::http::GatewayState;
use crate::metrics::Metrics;

/// Characters per streamed content chunk.
const STREAM_CHUNK_CHARS: usize = 64;

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    #[serde(default)]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
}

pub fn ide_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

/// Serve the IDE provider until shutdown.
pub async fn run_ide_provider(state: GatewayState, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid IDE provider bind address {bind:?}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "IDE provider listening");
    axum::serve(listener, ide_router(state)).await?;
    Ok(())
}

async fn list_models(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.model.model_name(),
            "object": "model",
            "created": now_ms() / 1000,
            "owned_by": "edgecoder",
        }],
    }))
}

/// Flatten a chat transcript into one prompt for the generate-text backend.
fn transcript_prompt(messages: &[ChatMessage]) -> (Option<String>, String) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();
    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n"))
    };

    let mut prompt = String::new();
    for message in messages.iter().filter(|m| m.role != "system") {
        match message.role.as_str() {
            "assistant" => {
                prompt.push_str("Assistant: ");
                prompt.push_str(&message.content);
                prompt.push('\n');
            }
            _ => {
                prompt.push_str("User: ");
                prompt.push_str(&message.content);
                prompt.push('\n');
            }
        }
    }
    prompt.push_str("Assistant:");
    (system, prompt)
}

async fn chat_completions(
    State(state): State<GatewayState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let req: ChatCompletionRequest =
        serde_json::from_value(body).map_err(|e| ApiError::Validation(e.to_string()))?;
    if req.messages.is_empty() {
        return Err(ApiError::Validation("messages must not be empty".into()));
    }
    Metrics::incr(&state.metrics.requests_total);
    Metrics::incr(&state.metrics.chat_completions_total);

    let (system, prompt) = transcript_prompt(&req.messages);
    let mut generate = GenerateRequest::prompt(prompt);
    generate.system = system;
    generate.max_tokens = req.max_tokens;
    generate.temperature = req.temperature;

    let response = state
        .model
        .generate(generate)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;

    let model_name = req.model.unwrap_or_else(|| response.model.clone());
    let completion_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = now_ms() / 1000;

    if req.stream {
        let stream = chunk_stream(completion_id, model_name, created, response.text);
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    Ok(Json(json!({
        "id": completion_id,
        "object": "chat.completion",
        "created": created,
        "model": model_name,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": response.text },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": 0,
            "total_tokens": 0,
        },
    }))
    .into_response())
}

/// Lazily emit the completion as OpenAI stream chunks.
fn chunk_stream(
    id: String,
    model: String,
    created: i64,
    text: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let chunk = |delta: serde_json::Value, finish: Option<&str>| {
            json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{
                    "index": 0,
                    "delta": delta,
                    "finish_reason": finish,
                }],
            })
        };

        // Role announcement first, as the OpenAI stream protocol does.
        yield Ok(Event::default().data(chunk(json!({"role": "assistant"}), None).to_string()));

        let chars: Vec<char> = text.chars().collect();
        for piece in chars.chunks(STREAM_CHUNK_CHARS) {
            let content: String = piece.iter().collect();
            yield Ok(Event::default().data(chunk(json!({"content": content}), None).to_string()));
        }

        yield Ok(Event::default().data(chunk(json!({}), Some("stop")).to_string()));
        yield Ok(Event::default().data("[DONE]"));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
