// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HTTP authentication: signed-request verification and the static mesh
//! token, plus per-IP rate limiting of failed attempts.
//!
//! # Signed requests
//!
//! Inter-node calls carry the five signature headers (see
//! `edgecoder_crypto::signing`). Verification order matters:
//!
//! 1. headers present and well-formed (else `unauthorized`)
//! 2. Ed25519 signature against the trusted roster — **no state change**
//! 3. timestamp skew + nonce replay — records the nonce only after the
//!    signature is known good, so an attacker cannot poison the replay cache
//!
//! # Rate limiting
//!
//! Failed attempts consume a per-IP token from a `governor` GCRA limiter;
//! successful requests never do, so legitimate traffic is never throttled by
//! its own volume. Loopback is exempt — a local process already has local
//! access to the machine.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use subtle::ConstantTimeEq;
use tracing::warn;

use edgecoder_crypto::{
    verify_request, RequestContext, HDR_AGENT_ID, HDR_BODY_SHA256, HDR_COORDINATOR_PEER_ID,
    HDR_NONCE, HDR_SIGNATURE, HDR_TIMESTAMP_MS,
};

use crate::error::ApiError;
use crate::state::AppState;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// Shared auth state threaded through axum middleware.
#[derive(Clone)]
pub struct AuthState {
    limiter: Arc<IpLimiter>,
    /// Static bearer token for unsigned (portal/browser) calls.
    mesh_token: Option<Arc<String>>,
}

impl AuthState {
    /// `max_per_minute`: failed attempts before lockout; `burst`: attempts
    /// allowed before the limit kicks in.
    pub fn new(mesh_token: Option<String>, max_per_minute: u32, burst: u32) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(max_per_minute).expect("max_per_minute must be > 0"),
        )
        .allow_burst(NonZeroU32::new(burst).expect("burst must be > 0"));
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            mesh_token: mesh_token.map(Arc::new),
        }
    }

    pub fn with_defaults(mesh_token: Option<String>) -> Self {
        Self::new(mesh_token, 5, 2)
    }

    /// Constant-time check of the static mesh token.
    ///
    /// Open when no token is configured (single-machine development).
    pub fn check_mesh_token(&self, provided: Option<&str>) -> bool {
        match (&self.mesh_token, provided) {
            (None, _) => true,
            (Some(expected), Some(given)) => {
                expected.as_bytes().ct_eq(given.as_bytes()).into()
            }
            (Some(_), None) => false,
        }
    }

    fn register_failure(&self, ip: IpAddr) -> bool {
        if is_loopback(ip) {
            return true;
        }
        self.limiter.check_key(&ip).is_ok()
    }
}

/// The signed fields extracted from request headers.
struct SignedHeaderSet {
    peer_id: String,
    timestamp_ms: i64,
    nonce: String,
    body_sha256: String,
    signature: String,
}

fn extract_signed_headers(headers: &HeaderMap) -> Option<SignedHeaderSet> {
    let get = |name: &str| headers.get(name)?.to_str().ok().map(str::to_string);
    let peer_id = get(HDR_AGENT_ID).or_else(|| get(HDR_COORDINATOR_PEER_ID))?;
    Some(SignedHeaderSet {
        peer_id,
        timestamp_ms: get(HDR_TIMESTAMP_MS)?.parse().ok()?,
        nonce: get(HDR_NONCE)?,
        body_sha256: get(HDR_BODY_SHA256)?,
        signature: get(HDR_SIGNATURE)?,
    })
}

/// Axum middleware enforcing signed headers on inter-node routes.
pub async fn signed_auth_mw(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    match verify_signed_request(&state, req).await {
        Ok(req) => next.run(req).await,
        Err(err) => {
            if !state.auth.register_failure(addr.ip()) {
                warn!(ip = %addr.ip(), "rate limit exceeded after repeated auth failures");
                return (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    [(axum::http::header::RETRY_AFTER, "60")],
                    "Too Many Requests",
                )
                    .into_response();
            }
            warn!(ip = %addr.ip(), kind = err.kind(), "signed request rejected");
            err.into_response()
        }
    }
}

/// Verify the signature headers on `req`, returning the request (with its
/// body restored) on success.
async fn verify_signed_request(state: &AppState, req: Request) -> Result<Request, ApiError> {
    let (parts, body) = req.into_parts();
    let headers = extract_signed_headers(&parts.headers).ok_or(ApiError::Unauthorized)?;

    // 1 MiB cap: signed inter-node payloads are task-sized, not uploads.
    let bytes = axum::body::to_bytes(body, 1024 * 1024)
        .await
        .map_err(|e| ApiError::Validation(format!("unreadable body: {e}")))?;

    let ctx = RequestContext {
        peer_id: headers.peer_id.clone(),
        method: parts.method.as_str().to_ascii_uppercase(),
        path: parts.uri.path().to_string(),
        timestamp_ms: headers.timestamp_ms,
        nonce: headers.nonce.clone(),
        body_sha256: headers.body_sha256.clone(),
    };

    {
        let trusted = state.trusted.read().unwrap();
        verify_request(&trusted, &ctx, &bytes, &headers.signature)?;
    }
    // Signature is good — now the nonce may be recorded.
    state
        .nonces
        .verify_nonce(&headers.nonce, &headers.peer_id, headers.timestamp_ms)?;

    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(VerifiedPeer {
        peer_id: headers.peer_id,
    });
    Ok(req)
}

/// Inserted into request extensions after successful verification, so
/// handlers can trust the sender identity.
#[derive(Debug, Clone)]
pub struct VerifiedPeer {
    pub peer_id: String,
}

/// Middleware for the static mesh token on unsigned routes.
pub async fn mesh_token_mw(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if state.auth.check_mesh_token(provided) {
        return next.run(req).await;
    }
    if !state.auth.register_failure(addr.ip()) {
        return (
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            [(axum::http::header::RETRY_AFTER, "60")],
            "Too Many Requests",
        )
            .into_response();
    }
    ApiError::Unauthorized.into_response()
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
