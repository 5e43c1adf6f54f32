// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod identity;
pub mod nonce;
pub mod signing;

pub use identity::{NodeIdentity, TrustedKeys};
pub use nonce::{NonceStore, NonceVerifyError};
pub use signing::{
    body_sha256, canonical_request_bytes, sign_request, verify_request, RequestContext,
    SignatureError, SignedHeaders, HDR_AGENT_ID, HDR_BODY_SHA256, HDR_COORDINATOR_PEER_ID,
    HDR_NONCE, HDR_SIGNATURE, HDR_TIMESTAMP_MS,
};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
