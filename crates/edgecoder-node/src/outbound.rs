// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Outbound signed HTTP requests.
//!
//! Every inter-node call goes through [`signed_post`] so the five signature
//! headers are always present and always computed over the exact bytes sent.

use reqwest::RequestBuilder;
use uuid::Uuid;

use edgecoder_crypto::{
    now_ms, sign_request, NodeIdentity, HDR_BODY_SHA256, HDR_NONCE, HDR_SIGNATURE,
    HDR_TIMESTAMP_MS,
};

/// Build a signed POST with a JSON body.
///
/// `id_header` selects the identity header (`x-agent-id` for workers,
/// `x-coordinator-peer-id` for coordinator-to-coordinator calls).
pub fn signed_post(
    client: &reqwest::Client,
    identity: &NodeIdentity,
    id_header: &'static str,
    url: &str,
    body: &[u8],
) -> RequestBuilder {
    let path = url_path(url);
    let nonce = Uuid::new_v4().to_string();
    let headers = sign_request(identity, "POST", path, body, now_ms(), &nonce);
    client
        .post(url)
        .header(id_header, headers.peer_id)
        .header(HDR_TIMESTAMP_MS, headers.timestamp_ms.to_string())
        .header(HDR_NONCE, headers.nonce)
        .header(HDR_BODY_SHA256, headers.body_sha256)
        .header(HDR_SIGNATURE, headers.signature_b64)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body.to_vec())
}

/// Extract the path component of a URL (no scheme/host/query).
fn url_path(url: &str) -> &str {
    let after_scheme = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let path = match after_scheme.find('/') {
        Some(idx) => &after_scheme[idx..],
        None => "/",
    };
    match path.split_once('?') {
        Some((p, _)) => p,
        None => path,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_path_strips_host_and_query() {
        assert_eq!(url_path("http://10.0.0.1:4301/pull"), "/pull");
        assert_eq!(url_path("https://host/mesh/capabilities?model=x"), "/mesh/capabilities");
        assert_eq!(url_path("http://host"), "/");
    }
}
