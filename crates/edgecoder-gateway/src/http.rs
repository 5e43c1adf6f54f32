// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The inference gateway (default :4302) — the authenticated front door to
//! the local model.
//!
//! # Authentication
//!
//! Two independent layers, both optional and both off by default for
//! single-machine development:
//!
//! - `INFERENCE_AUTH_TOKEN`: static bearer token, compared in constant time.
//! - `INFERENCE_REQUIRE_SIGNED_COORDINATOR_REQUESTS`: full signed-header
//!   verification (signature, skew, nonce replay) against the trusted
//!   roster, for meshes where the gateway is reachable beyond localhost.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use edgecoder_config::Config;
use edgecoder_crypto::{
    verify_request, NodeIdentity, NonceStore, RequestContext, TrustedKeys, HDR_AGENT_ID,
    HDR_BODY_SHA256, HDR_COORDINATOR_PEER_ID, HDR_NONCE, HDR_SIGNATURE, HDR_TIMESTAMP_MS,
};
use edgecoder_model::ModelProvider;
use edgecoder_node::ApiError;

use crate::decompose;
use crate::escalate::{escalate, GatewayEscalationRequest};
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct GatewayState {
    pub model: Arc<dyn ModelProvider>,
    pub identity: Arc<NodeIdentity>,
    pub trusted: Arc<RwLock<TrustedKeys>>,
    pub nonces: Arc<NonceStore>,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
}

impl GatewayState {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        identity: Arc<NodeIdentity>,
        trusted: Arc<RwLock<TrustedKeys>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            nonces: Arc::new(NonceStore::new(
                config.inference.nonce_ttl_ms,
                config.inference.max_signature_skew_ms,
            )),
            model,
            identity,
            trusted,
            config,
            metrics: Arc::new(Metrics::new()),
        }
    }
}

/// Assemble the gateway router.
pub fn router(state: GatewayState) -> Router {
    let guarded = Router::new()
        .route("/decompose", post(decompose_handler))
        .route("/escalate", post(escalate_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), gateway_auth_mw));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/model/status", get(model_status))
        .route("/model/list", get(model_list))
        .route("/model/swap", post(model_swap))
        .merge(guarded)
        .with_state(state)
}

/// Serve the gateway until shutdown.
pub async fn run_gateway(state: GatewayState, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid gateway bind address {bind:?}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "inference gateway listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ── Auth middleware ───────────────────────────────────────────────────────────

async fn gateway_auth_mw(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    match check_gateway_auth(&state, req).await {
        Ok(req) => next.run(req).await,
        Err(err) => {
            Metrics::incr(&state.metrics.failures_total);
            warn!(kind = err.kind(), "gateway request rejected");
            err.into_response()
        }
    }
}

async fn check_gateway_auth(state: &GatewayState, req: Request) -> Result<Request, ApiError> {
    if let Some(expected) = &state.config.inference.auth_token {
        let provided = req
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let ok: bool = match provided {
            Some(token) => expected.as_bytes().ct_eq(token.as_bytes()).into(),
            None => false,
        };
        if !ok {
            return Err(ApiError::Unauthorized);
        }
    }

    if !state.config.inference.require_signed_coordinator_requests {
        return Ok(req);
    }

    let (parts, body) = req.into_parts();
    let get = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let peer_id = get(HDR_COORDINATOR_PEER_ID)
        .or_else(|| get(HDR_AGENT_ID))
        .ok_or(ApiError::Unauthorized)?;
    let timestamp_ms: i64 = get(HDR_TIMESTAMP_MS)
        .and_then(|v| v.parse().ok())
        .ok_or(ApiError::Unauthorized)?;
    let nonce = get(HDR_NONCE).ok_or(ApiError::Unauthorized)?;
    let body_sha256 = get(HDR_BODY_SHA256).ok_or(ApiError::Unauthorized)?;
    let signature = get(HDR_SIGNATURE).ok_or(ApiError::Unauthorized)?;

    let bytes = axum::body::to_bytes(body, 1024 * 1024)
        .await
        .map_err(|e| ApiError::Validation(format!("unreadable body: {e}")))?;

    let ctx = RequestContext {
        peer_id: peer_id.clone(),
        method: parts.method.as_str().to_ascii_uppercase(),
        path: parts.uri.path().to_string(),
        timestamp_ms,
        nonce: nonce.clone(),
        body_sha256,
    };
    {
        let trusted = state.trusted.read().unwrap();
        verify_request(&trusted, &ctx, &bytes, &signature)?;
    }
    state.nonces.verify_nonce(&nonce, &peer_id, timestamp_ms)?;

    Ok(Request::from_parts(parts, Body::from(bytes)))
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn health(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "model": state.model.model_name(),
        "provider": state.model.name(),
    }))
}

async fn metrics_handler(State(state): State<GatewayState>) -> String {
    state.metrics.render()
}

async fn model_status(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "active_model": state.model.model_name(),
        "provider": state.model.name(),
    }))
}

async fn model_list(
    State(state): State<GatewayState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let models = state
        .model
        .list_models()
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    Ok(Json(json!({ "models": models })))
}

async fn model_swap(
    State(state): State<GatewayState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    #[derive(serde::Deserialize)]
    struct SwapRequest {
        model: String,
    }
    let req: SwapRequest =
        serde_json::from_value(body).map_err(|e| ApiError::Validation(e.to_string()))?;
    let progress = state
        .model
        .pull_model(&req.model)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    Ok(Json(serde_json::to_value(progress).unwrap_or_default()))
}

async fn decompose_handler(
    State(state): State<GatewayState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    #[derive(serde::Deserialize)]
    struct DecomposeRequest {
        prompt: String,
        #[serde(default = "default_language")]
        language: String,
    }
    fn default_language() -> String {
        "python".into()
    }

    let req: DecomposeRequest =
        serde_json::from_value(body).map_err(|e| ApiError::Validation(e.to_string()))?;
    Metrics::incr(&state.metrics.requests_total);
    Metrics::incr(&state.metrics.decompose_total);

    let subtasks = decompose::decompose(state.model.as_ref(), &req.prompt, &req.language).await;
    Ok(Json(json!({ "subtasks": subtasks })))
}

async fn escalate_handler(
    State(state): State<GatewayState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: GatewayEscalationRequest =
        serde_json::from_value(body).map_err(|e| ApiError::Validation(e.to_string()))?;
    Metrics::incr(&state.metrics.requests_total);
    Metrics::incr(&state.metrics.escalate_total);

    let response = escalate(state.model.as_ref(), &req)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    Ok(Json(serde_json::to_value(response).unwrap_or_default()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
