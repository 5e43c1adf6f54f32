// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Signed-request canonical form and the header convention.
//!
//! Every inter-node HTTP request carries five headers that together prove the
//! sender's identity and protect the body from tampering and replay:
//!
//! ```text
//! x-agent-id: edge-ab12…            (or x-coordinator-peer-id)
//! x-timestamp-ms: 1730000000000
//! x-nonce: 550e8400-e29b-41d4-…
//! x-body-sha256: 9f86d08…
//! x-signature: base64(Ed25519(canonical bytes))
//! ```
//!
//! The signature covers `{peer_id, method, path (no query), timestamp_ms,
//! nonce, body_sha256}` in a deterministic length-prefixed encoding, so a
//! request cannot be re-targeted at a different path or replayed with a
//! modified body.

use ed25519_dalek::Signature;
use sha2::{Digest, Sha256};

use crate::identity::{NodeIdentity, TrustedKeys};

pub const HDR_AGENT_ID: &str = "x-agent-id";
pub const HDR_COORDINATOR_PEER_ID: &str = "x-coordinator-peer-id";
pub const HDR_TIMESTAMP_MS: &str = "x-timestamp-ms";
pub const HDR_NONCE: &str = "x-nonce";
pub const HDR_BODY_SHA256: &str = "x-body-sha256";
pub const HDR_SIGNATURE: &str = "x-signature";

/// The signed fields of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub peer_id: String,
    /// Upper-case HTTP method.
    pub method: String,
    /// Request path without the query string.
    pub path: String,
    pub timestamp_ms: i64,
    pub nonce: String,
    /// Lower-case hex SHA-256 of the exact body bytes.
    pub body_sha256: String,
}

/// The five outbound header values produced by [`sign_request`].
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub peer_id: String,
    pub timestamp_ms: i64,
    pub nonce: String,
    pub body_sha256: String,
    pub signature_b64: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature_invalid")]
    Invalid,
    #[error("signature_untrusted_peer")]
    UntrustedPeer,
    #[error("signature_body_mismatch")]
    BodyMismatch,
}

/// SHA-256 of the exact bytes sent on the wire, lower-case hex.
pub fn body_sha256(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Build the canonical byte string that the sender signs and the receiver
/// verifies.
///
/// Format: for each field in order (peer_id, method, path, timestamp_ms as
/// decimal, nonce, body_sha256):
/// ```text
/// field_len_u16_be (2)
/// field_bytes      (N)
/// ```
///
/// This encoding is deterministic and unambiguous.
pub fn canonical_request_bytes(ctx: &RequestContext) -> Vec<u8> {
    let ts = ctx.timestamp_ms.to_string();
    let fields: [&str; 6] = [
        &ctx.peer_id,
        &ctx.method,
        &ctx.path,
        &ts,
        &ctx.nonce,
        &ctx.body_sha256,
    ];
    let mut out = Vec::with_capacity(fields.iter().map(|f| 2 + f.len()).sum());
    for field in fields {
        let bytes = field.as_bytes();
        let len = bytes.len() as u16;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

/// Sign an outbound request, producing the header set.
///
/// `nonce` should be a fresh UUID per request; `timestamp_ms` the sender's
/// current wall clock.
pub fn sign_request(
    identity: &NodeIdentity,
    method: &str,
    path: &str,
    body: &[u8],
    timestamp_ms: i64,
    nonce: &str,
) -> SignedHeaders {
    let body_hash = body_sha256(body);
    let ctx = RequestContext {
        peer_id: identity.peer_id().to_string(),
        method: method.to_ascii_uppercase(),
        path: strip_query(path).to_string(),
        timestamp_ms,
        nonce: nonce.to_string(),
        body_sha256: body_hash.clone(),
    };
    let sig = identity.sign(&canonical_request_bytes(&ctx));
    SignedHeaders {
        peer_id: ctx.peer_id,
        timestamp_ms,
        nonce: nonce.to_string(),
        body_sha256: body_hash,
        signature_b64: base64_encode(&sig.to_bytes()),
    }
}

/// Verify an inbound request signature.
///
/// The caller is expected to have already rebuilt `ctx` from the received
/// headers and the actual request line. `body` is the raw received body;
/// its hash is compared against the claimed `body_sha256` first, so a
/// tampered body fails with [`SignatureError::BodyMismatch`] rather than a
/// generic signature failure.
pub fn verify_request(
    trusted: &TrustedKeys,
    ctx: &RequestContext,
    body: &[u8],
    signature_b64: &str,
) -> Result<(), SignatureError> {
    if trusted.get(&ctx.peer_id).is_none() {
        return Err(SignatureError::UntrustedPeer);
    }
    if body_sha256(body) != ctx.body_sha256 {
        return Err(SignatureError::BodyMismatch);
    }
    let sig_bytes = base64_decode(signature_b64).ok_or(SignatureError::Invalid)?;
    let arr: [u8; 64] = sig_bytes.try_into().map_err(|_| SignatureError::Invalid)?;
    let sig = Signature::from_bytes(&arr);
    if trusted.verify(&ctx.peer_id, &canonical_request_bytes(ctx), &sig) {
        Ok(())
    } else {
        Err(SignatureError::Invalid)
    }
}

/// Drop the query string from a request path.
fn strip_query(path: &str) -> &str {
    match path.split_once('?') {
        Some((p, _)) => p,
        None => path,
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_pair() -> (NodeIdentity, TrustedKeys) {
        let id = NodeIdentity::generate();
        let mut roster = TrustedKeys::new();
        roster.insert(id.peer_id(), id.verifying_key());
        (id, roster)
    }

    fn ctx_from(headers: &SignedHeaders, method: &str, path: &str) -> RequestContext {
        RequestContext {
            peer_id: headers.peer_id.clone(),
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            timestamp_ms: headers.timestamp_ms,
            nonce: headers.nonce.clone(),
            body_sha256: headers.body_sha256.clone(),
        }
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let (id, roster) = signed_pair();
        let body = br#"{"agent_id":"edge-1"}"#;
        let h = sign_request(&id, "post", "/pull", body, 1_000, "nonce-1");
        let ctx = ctx_from(&h, "POST", "/pull");
        assert_eq!(verify_request(&roster, &ctx, body, &h.signature_b64), Ok(()));
    }

    #[test]
    fn tampered_body_fails_with_body_mismatch() {
        let (id, roster) = signed_pair();
        let h = sign_request(&id, "POST", "/pull", b"original", 1_000, "n");
        let ctx = ctx_from(&h, "POST", "/pull");
        assert_eq!(
            verify_request(&roster, &ctx, b"tampered", &h.signature_b64),
            Err(SignatureError::BodyMismatch)
        );
    }

    #[test]
    fn retargeted_path_fails() {
        let (id, roster) = signed_pair();
        let h = sign_request(&id, "POST", "/pull", b"{}", 1_000, "n");
        let ctx = ctx_from(&h, "POST", "/result");
        assert_eq!(
            verify_request(&roster, &ctx, b"{}", &h.signature_b64),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn unknown_peer_fails_with_untrusted() {
        let id = NodeIdentity::generate();
        let roster = TrustedKeys::new();
        let h = sign_request(&id, "POST", "/pull", b"{}", 1_000, "n");
        let ctx = ctx_from(&h, "POST", "/pull");
        assert_eq!(
            verify_request(&roster, &ctx, b"{}", &h.signature_b64),
            Err(SignatureError::UntrustedPeer)
        );
    }

    #[test]
    fn signature_from_other_key_fails() {
        let (_, roster_a) = signed_pair();
        let (id_b, _) = signed_pair();
        let h = sign_request(&id_b, "POST", "/pull", b"{}", 1_000, "n");
        let ctx = ctx_from(&h, "POST", "/pull");
        // id_b is not in roster_a.
        assert_eq!(
            verify_request(&roster_a, &ctx, b"{}", &h.signature_b64),
            Err(SignatureError::UntrustedPeer)
        );
    }

    #[test]
    fn garbage_signature_fails_cleanly() {
        let (id, roster) = signed_pair();
        let h = sign_request(&id, "POST", "/pull", b"{}", 1_000, "n");
        let ctx = ctx_from(&h, "POST", "/pull");
        assert_eq!(
            verify_request(&roster, &ctx, b"{}", "!!not-base64!!"),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn query_string_is_excluded_from_canonical_path() {
        let (id, roster) = signed_pair();
        let h = sign_request(&id, "GET", "/mesh/capabilities?model=x", b"", 1_000, "n");
        // Receiver canonicalises to the bare path.
        let ctx = ctx_from(&h, "GET", "/mesh/capabilities");
        assert_eq!(verify_request(&roster, &ctx, b"", &h.signature_b64), Ok(()));
    }

    #[test]
    fn canonical_bytes_are_length_prefixed_and_unambiguous() {
        // "ab" + "c" must not collide with "a" + "bc".
        let base = RequestContext {
            peer_id: "ab".into(),
            method: "c".into(),
            path: "/".into(),
            timestamp_ms: 0,
            nonce: "".into(),
            body_sha256: "".into(),
        };
        let shifted = RequestContext {
            peer_id: "a".into(),
            method: "bc".into(),
            ..base.clone()
        };
        assert_ne!(
            canonical_request_bytes(&base),
            canonical_request_bytes(&shifted)
        );
    }

    #[test]
    fn body_sha256_matches_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            body_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
