// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Coordinator HTTP API (default :4301).
//!
//! Route groups:
//! - open reads: `/status`, `/health/runtime`, `/mesh/peers`,
//!   `/mesh/capabilities`, credit snapshots, model status, handshake reads
//! - static-token writes: `/tasks` (portal/browser submissions)
//! - signed inter-node writes: `/pull`, `/result`, `/escalate`
//! - enrollment: `/mesh/register` (registration token), `/mesh/gossip`
//!   (envelope-signed, so no transport signature required)

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use edgecoder_credits::{pricing, ContributionReport, LoadSnapshot};
use edgecoder_crypto::now_ms;
use edgecoder_mesh::{GossipError, GossipMessage, PeerRecord};
use edgecoder_model::GenerateRequest;

use crate::auth::{mesh_token_mw, signed_auth_mw, VerifiedPeer};
use crate::error::ApiError;
use crate::escalate::EscalationRequest;
use crate::handshake::{HandshakePhase, HandshakeTask};
use crate::state::AppState;
use crate::types::{
    PullRequest, RegisterRequest, StatusResponse, SubmitTaskRequest, SubmitTaskResponse, Subtask,
    SubtaskResultReport, SubtaskResultResponse, Task, TaskStatus,
};

/// Assemble the coordinator router.
pub fn router(state: AppState) -> Router {
    let signed = Router::new()
        .route("/pull", post(pull))
        .route("/result", post(subtask_result))
        .route("/escalate", post(escalate))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            signed_auth_mw,
        ));

    let token_gated = Router::new()
        .route("/tasks", post(submit_task))
        .route("/model/swap", post(model_swap))
        .route("/review", post(handshake_review))
        .route("/negotiate", post(handshake_negotiate))
        .route_layer(middleware::from_fn_with_state(state.clone(), mesh_token_mw));

    let open = Router::new()
        .route("/status", get(status))
        .route("/health/runtime", get(health_runtime))
        .route("/mesh/peers", get(mesh_peers))
        .route("/mesh/capabilities", get(mesh_capabilities))
        .route("/mesh/register", post(mesh_register))
        .route("/mesh/gossip", post(mesh_gossip))
        .route("/escalate/:task_id", get(escalation_status))
        .route("/credits/ledger/verify", get(credits_verify))
        .route("/credits/balance/:account", get(credits_balance))
        .route("/credits/history/:account", get(credits_history))
        .route("/model/status", get(model_status))
        .route("/model/list", get(model_list))
        .route("/model/pull/progress", get(model_pull_progress))
        .route("/result/:session_id", get(handshake_result))
        .route("/session/:session_id", get(handshake_session));

    Router::new()
        .merge(open)
        .merge(token_gated)
        .merge(signed)
        .with_state(state)
}

fn parse_body<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Validation(e.to_string()))
}

// ── Status & health ───────────────────────────────────────────────────────────

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        peer_id: state.identity.peer_id().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        runtime_mode: format!("{:?}", state.config.node.runtime_mode),
        uptime_ms: now_ms() - state.started_at_ms,
        queued_subtasks: state.queue.queued_len(),
        active_leases: state.queue.lease_len(),
        peers: state.roster.len(),
    })
}

async fn health_runtime(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "components": {
            "queue": { "queued": state.queue.queued_len(), "leases": state.queue.lease_len() },
            "handshakes": state.handshakes.len(),
            "nonce_cache": state.nonces.len(),
            "model": {
                "active": state.models.active_model(),
                "swap_in_progress": state.models.swap_in_progress(),
            },
        },
    }))
}

// ── Mesh ──────────────────────────────────────────────────────────────────────

async fn mesh_peers(State(state): State<AppState>) -> Json<Vec<PeerRecord>> {
    Json(state.roster.list())
}

#[derive(Deserialize)]
struct CapabilityQuery {
    model: Option<String>,
}

async fn mesh_capabilities(
    State(state): State<AppState>,
    Query(query): Query<CapabilityQuery>,
) -> Json<serde_json::Value> {
    match query.model {
        Some(model) => {
            let rows: Vec<serde_json::Value> = state
                .capabilities
                .query_model(&model)
                .into_iter()
                .map(|(coordinator, cap)| json!({ "coordinator_id": coordinator, "capability": cap }))
                .collect();
            Json(json!({ "model": model, "coordinators": rows }))
        }
        None => Json(json!({ "summaries": state.capabilities.all() })),
    }
}

async fn mesh_register(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: RegisterRequest = parse_body(body)?;

    match &state.config.node.registration_token {
        Some(expected) => {
            let ok: bool = expected
                .as_bytes()
                .ct_eq(req.registration_token.as_bytes())
                .into();
            if !ok {
                return Err(ApiError::Unauthorized);
            }
        }
        None => {
            // Open enrollment is for single-machine development only.
            warn!("enrollment without a registration token configured");
        }
    }

    state
        .trusted
        .write()
        .unwrap()
        .insert_hex(&req.peer_id, &req.public_key)
        .map_err(|e| ApiError::Validation(format!("bad public key: {e}")))?;
    state.roster.upsert(PeerRecord {
        peer_id: req.peer_id.clone(),
        public_key: req.public_key,
        coordinator_url: req.coordinator_url,
        network_mode: Default::default(),
        last_seen_ms: now_ms(),
        reputation: 0.5,
    });
    if let Some(capability) = req.capability {
        state.agent_caps.insert(req.peer_id.clone(), capability);
    }
    info!(peer = %req.peer_id, "peer enrolled");
    Ok(Json(json!({ "enrolled": true, "peer_id": req.peer_id })))
}

async fn mesh_gossip(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let msg: GossipMessage = parse_body(body)?;
    let trusted = state.trusted.read().unwrap().clone();
    let applied = state
        .gossip
        .ingest(&msg, &trusted, &state.roster, &state.capabilities)
        .map_err(|e| match e {
            GossipError::Expired => ApiError::SignatureExpired,
            GossipError::SignatureInvalid => ApiError::SignatureInvalid,
            GossipError::UntrustedPeer => ApiError::SignatureUntrustedPeer,
        })?;
    if applied {
        state.roster.touch(&msg.from_peer_id);
    }
    Ok(Json(json!({ "applied": applied })))
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn submit_task(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    let req: SubmitTaskRequest = parse_body(body)?;
    if req.prompt.trim().is_empty() {
        return Err(ApiError::Validation("prompt must not be empty".into()));
    }

    let task = Task {
        task_id: Uuid::new_v4().to_string(),
        requester_account_id: req.requester_account_id.clone(),
        prompt: req.prompt.clone(),
        language: req.language,
        snapshot_ref: req.snapshot_ref.clone(),
        priority: req.priority,
        resource_class: req.resource_class,
        requires_sandbox: req.requires_sandbox,
        tenant_id: req.tenant_id.clone(),
        created_at_ms: now_ms(),
    };

    // Escrow: hold the estimated model cost up front so settlement cannot
    // discover an empty account after the work is done.
    let estimate = pricing::model_cost_credits(state.config.model.param_size_b);
    let hold_tx_id = state
        .credits
        .hold(
            &req.requester_account_id,
            estimate,
            "task_escrow",
            Some(&task.task_id),
        )
        .await?;

    let subtasks: Vec<Subtask> = if req.subtasks.is_empty() {
        vec![Subtask::single_step(&task, &req.prompt, 30_000)]
    } else {
        req.subtasks
            .iter()
            .map(|spec| {
                let mut sub = Subtask::single_step(&task, &spec.input, spec.timeout_ms);
                if let Some(kind) = spec.kind {
                    sub.kind = kind;
                }
                sub
            })
            .collect()
    };

    let response = SubmitTaskResponse {
        task_id: task.task_id.clone(),
        status: TaskStatus::Queued,
        subtask_count: subtasks.len(),
        hold_tx_id: hold_tx_id.clone(),
    };
    state.queue.submit(task, subtasks, Some(hold_tx_id));
    Ok((StatusCode::CREATED, Json(response)))
}

async fn pull(
    State(state): State<AppState>,
    Extension(peer): Extension<VerifiedPeer>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let req: PullRequest = parse_body(body)?;
    if req.agent_id != peer.peer_id {
        return Err(ApiError::Unauthorized);
    }
    state.roster.touch(&req.agent_id);
    if let Some(capability) = &req.capability {
        state.agent_caps.insert(req.agent_id.clone(), capability.clone());
    }

    let capability = state.agent_caps.get(&req.agent_id).map(|e| e.clone());
    match state.queue.claim(&req, capability.as_ref()) {
        Some(response) => Ok(Json(response).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn subtask_result(
    State(state): State<AppState>,
    Extension(peer): Extension<VerifiedPeer>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<SubtaskResultResponse>, ApiError> {
    let report: SubtaskResultReport = parse_body(body)?;
    if report.agent_id != peer.peer_id {
        return Err(ApiError::Unauthorized);
    }

    let outcome = state.queue.complete(&report)?;

    // A run that gave up locally enters the waterfall right here; the
    // requester polls `GET /escalate/:task_id` for the resolution.
    if report.execution.escalated {
        let last = report.execution.history.last();
        let request = EscalationRequest {
            task_id: outcome.task.task_id.clone(),
            agent_id: report.agent_id.clone(),
            language: outcome.task.language.as_str().to_string(),
            prompt: outcome.task.prompt.clone(),
            code: last.map(|it| it.code.clone()),
            error: last.map(|it| it.run_result.stderr.clone()),
            queue_reason: report
                .execution
                .escalation_reason
                .clone()
                .unwrap_or_else(|| "manual".into()),
            iterations: report.execution.iterations,
        };
        let resolver = state.resolver.clone();
        let results = state.escalations.clone();
        let task_id = outcome.task.task_id.clone();
        tokio::spawn(async move {
            let result = resolver.resolve(&request).await;
            results.insert(task_id, result);
        });
    }

    // Worker compensation: credit actual compute at the current load tier.
    let compute_seconds = report
        .execution
        .history
        .iter()
        .map(|i| i.run_result.duration_ms as f64 / 1000.0)
        .sum::<f64>();
    let load = LoadSnapshot {
        queued_tasks: state.queue.queued_len() as u32,
        active_agents: state.agent_caps.len().max(1) as u32,
    };
    let credited = state
        .credits
        .accrue(
            &ContributionReport {
                report_id: report.report_id.clone(),
                account_id: report.agent_id.clone(),
                task_id: Some(outcome.task.task_id.clone()),
                compute_seconds,
                quality_score: 1.0,
                resource_class: outcome.task.resource_class.as_str().to_string(),
            },
            load,
        )
        .await?;

    // Settlement: close the escrow and debit the requester for what the
    // worker actually earned.
    let mut task_status = outcome.task_status;
    if outcome.task_finished {
        if let Some(hold_tx_id) = &outcome.hold_tx_id {
            let _ = state.credits.release(hold_tx_id).await;
        }
        state
            .credits
            .spend(
                &outcome.task.requester_account_id,
                credited,
                "task_execution",
                Some(&outcome.task.task_id),
            )
            .await?;
        if outcome.task_status == TaskStatus::Completed {
            state
                .queue
                .mark_status(&outcome.task.task_id, TaskStatus::Settled)?;
            task_status = TaskStatus::Settled;
        }
    }

    Ok(Json(SubtaskResultResponse {
        task_status,
        credited,
    }))
}

// ── Escalation ────────────────────────────────────────────────────────────────

async fn escalate(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let request: EscalationRequest = parse_body(body)?;
    let task_id = request.task_id.clone();
    // The task may live on another coordinator; status update is best effort.
    let _ = state.queue.mark_status(&task_id, TaskStatus::Escalated);

    let resolver = state.resolver.clone();
    let results = state.escalations.clone();
    tokio::spawn(async move {
        let result = resolver.resolve(&request).await;
        results.insert(request.task_id.clone(), result);
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "status": "resolving" })),
    ))
}

async fn escalation_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(result) = state.escalations.get(&task_id) {
        return Ok(Json(serde_json::to_value(result.clone()).unwrap_or_default()));
    }
    if state.queue.task(&task_id).is_some() {
        return Ok(Json(json!({ "task_id": task_id, "status": "resolving" })));
    }
    Err(ApiError::NotFound)
}

// ── Credits ───────────────────────────────────────────────────────────────────

async fn credits_verify(State(state): State<AppState>) -> Json<serde_json::Value> {
    let report = state.credits.verify().await;
    Json(serde_json::to_value(report).unwrap_or_default())
}

async fn credits_balance(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> Json<serde_json::Value> {
    let balance = state.credits.balance(&account).await;
    Json(json!({ "account_id": account, "balance": balance }))
}

async fn credits_history(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> Json<serde_json::Value> {
    let history = state.credits.history(&account).await;
    Json(json!({ "account_id": account, "transactions": history }))
}

// ── Model management ──────────────────────────────────────────────────────────

async fn model_swap(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    #[derive(Deserialize)]
    struct SwapRequest {
        model: String,
    }
    let req: SwapRequest = parse_body(body)?;
    if !state.models.begin_swap(req.model.clone()) {
        return Err(ApiError::Validation("model swap already in progress".into()));
    }
    Ok(Json(json!({ "swapping_to": req.model })))
}

async fn model_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "active_model": state.models.active_model(),
        "provider": state.models.provider().name(),
        "swap_in_progress": state.models.swap_in_progress(),
    }))
}

async fn model_list(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let models = state
        .models
        .provider()
        .list_models()
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    Ok(Json(json!({ "models": models })))
}

async fn model_pull_progress(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.models.pull_progress()).unwrap_or_default())
}

// ── Handshake ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ReviewRequest {
    agent_id: String,
    task: HandshakeTask,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    error: Option<String>,
    queue_reason: String,
}

async fn handshake_review(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let req: ReviewRequest = parse_body(body)?;
    let session = state.handshakes.open(
        &req.agent_id,
        req.task,
        req.snippet,
        req.error,
        &req.queue_reason,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "session_id": session.session_id,
            "phase": session.phase,
        })),
    ))
}

#[derive(Deserialize)]
struct NegotiateRequest {
    session_id: String,
    agent_id: String,
    accept: bool,
}

async fn handshake_negotiate(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: NegotiateRequest = parse_body(body)?;
    let session = state
        .handshakes
        .negotiate(&req.session_id, &req.agent_id, req.accept)?;

    if session.phase == HandshakePhase::Execute {
        spawn_cloud_execution(state.clone(), session.session_id.clone());
    }

    Ok(Json(json!({
        "session_id": session.session_id,
        "phase": session.phase,
    })))
}

/// Kick off the asynchronous cloud step for an `execute`-phase session.
///
/// Uses the configured cloud inference endpoint when present, otherwise the
/// local model with a senior-assistant framing. The result only lands if the
/// session is still executing when it returns.
fn spawn_cloud_execution(state: AppState, session_id: String) {
    tokio::spawn(async move {
        let Some(session) = state.handshakes.get(&session_id) else {
            return;
        };
        let prompt = format!(
            "You are a senior engineer reviewing a junior's stuck task.\n\
             Task: {}\nLanguage: {}\nCode so far:\n{}\nError:\n{}\n\n\
             Reply with a corrected, complete solution in a single fenced \
             code block.",
            session.task.prompt,
            session.task.language,
            session.snippet.as_deref().unwrap_or("(none)"),
            session.error.as_deref().unwrap_or("(none)"),
        );

        let response = match &state.config.escalation.cloud_inference_url {
            Some(url) => {
                let body = json!({
                    "task_id": session.task.task_id,
                    "prompt": prompt,
                });
                match state.client.post(url).json(&body).send().await {
                    Ok(resp) => resp.text().await.ok(),
                    Err(e) => {
                        warn!(session = %session_id, "cloud execution failed: {e}");
                        None
                    }
                }
            }
            None => match state
                .models
                .provider()
                .generate(GenerateRequest::prompt(prompt))
                .await
            {
                Ok(resp) => Some(resp.text),
                Err(e) => {
                    warn!(session = %session_id, "local escalation failed: {e}");
                    None
                }
            },
        };

        match response {
            Some(text) => {
                state.handshakes.complete_execution(&session_id, text);
            }
            None => {
                let _ = state.handshakes.fail(&session_id, "cloud execution failed");
            }
        }
    });
}

async fn handshake_result(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state.handshakes.get(&session_id).ok_or(ApiError::NotFound)?;
    Ok(Json(json!({
        "session_id": session.session_id,
        "phase": session.phase,
        "cloud_response": session.cloud_response,
        "failure_reason": session.failure_reason,
    })))
}

async fn handshake_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state.handshakes.get(&session_id).ok_or(ApiError::NotFound)?;
    Ok(Json(serde_json::to_value(session).unwrap_or_default()))
}

