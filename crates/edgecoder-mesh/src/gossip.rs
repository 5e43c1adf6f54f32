// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Signed gossip between coordinators.
//!
//! Fan-out is fire-and-forget HTTP: every peer gets a POST to its
//! `coordinator_url`, failures are counted but never abort the broadcast.
//! On ingest, duplicate ids are dropped, expired messages are
//! rejected, and the Ed25519 envelope signature is verified against the
//! trusted roster **before any state is touched**.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use edgecoder_crypto::{now_ms, NodeIdentity, TrustedKeys};

use crate::capability::CapabilityIndex;
use crate::roster::PeerRoster;
use crate::types::{CapabilitySummary, PeerRecord};

/// Recently seen message ids kept for dedup.
const SEEN_CACHE_SIZE: usize = 4_096;

/// Per-peer delivery timeout during fan-out.
const FANOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default envelope time-to-live.
pub const DEFAULT_TTL_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GossipError {
    #[error("signature_expired")]
    Expired,
    #[error("signature_invalid")]
    SignatureInvalid,
    #[error("signature_untrusted_peer")]
    UntrustedPeer,
}

/// Typed gossip payloads; the codec dispatches on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipPayload {
    /// Roster upsert for the announcing peer.
    PeerAnnounce(PeerRecord),
    /// Advisory queue depth, feeds demand pricing.
    QueueSummary { queued_tasks: u32, active_agents: u32 },
    /// Replaces the previous summary from that coordinator.
    CapabilitySummary(CapabilitySummary),
    /// Appended to the audit chain; never merged destructively.
    BlacklistUpdate { peer_id: String, reason: String },
    /// Advisory only.
    TaskComplete { task_id: String, agent_id: String, ok: bool },
}

impl GossipPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::PeerAnnounce(_) => "peer_announce",
            Self::QueueSummary { .. } => "queue_summary",
            Self::CapabilitySummary(_) => "capability_summary",
            Self::BlacklistUpdate { .. } => "blacklist_update",
            Self::TaskComplete { .. } => "task_complete",
        }
    }
}

/// Signed gossip envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub id: String,
    pub from_peer_id: String,
    pub issued_at_ms: i64,
    pub ttl_ms: u64,
    pub payload: GossipPayload,
    /// base64(Ed25519) over the canonical envelope bytes.
    pub signature: String,
}

impl GossipMessage {
    /// Build and sign an envelope from this node.
    pub fn sign(identity: &NodeIdentity, payload: GossipPayload, ttl_ms: u64) -> Self {
        let id = Uuid::new_v4().to_string();
        let issued_at_ms = now_ms();
        let canonical = canonical_envelope_bytes(
            &id,
            identity.peer_id(),
            issued_at_ms,
            ttl_ms,
            &payload,
        );
        let signature = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(identity.sign(&canonical).to_bytes())
        };
        Self {
            id,
            from_peer_id: identity.peer_id().to_string(),
            issued_at_ms,
            ttl_ms,
            payload,
            signature,
        }
    }

    fn verify(&self, trusted: &TrustedKeys) -> Result<(), GossipError> {
        if trusted.get(&self.from_peer_id).is_none() {
            return Err(GossipError::UntrustedPeer);
        }
        let canonical = canonical_envelope_bytes(
            &self.id,
            &self.from_peer_id,
            self.issued_at_ms,
            self.ttl_ms,
            &self.payload,
        );
        let sig_bytes = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(&self.signature)
                .map_err(|_| GossipError::SignatureInvalid)?
        };
        let arr: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| GossipError::SignatureInvalid)?;
        let sig = ed25519_dalek::Signature::from_bytes(&arr);
        if trusted.verify(&self.from_peer_id, &canonical, &sig) {
            Ok(())
        } else {
            Err(GossipError::SignatureInvalid)
        }
    }
}

/// Deterministic envelope bytes covered by the signature.
fn canonical_envelope_bytes(
    id: &str,
    from_peer_id: &str,
    issued_at_ms: i64,
    ttl_ms: u64,
    payload: &GossipPayload,
) -> Vec<u8> {
    let payload_json =
        serde_json::to_string(payload).expect("gossip payloads always serialize");
    let issued = issued_at_ms.to_string();
    let ttl = ttl_ms.to_string();
    let fields: [&str; 5] = [id, from_peer_id, &issued, &ttl, &payload_json];
    let mut out = Vec::with_capacity(fields.iter().map(|f| 4 + f.len()).sum());
    for field in fields {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field.as_bytes());
    }
    out
}

/// An appended blacklist audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub peer_id: String,
    pub reason: String,
    pub reported_by: String,
    pub received_at_ms: i64,
}

/// Mutable gossip state owned by one coordinator.
pub struct GossipState {
    seen: Mutex<LruCache<String, ()>>,
    blacklist: Mutex<Vec<BlacklistEntry>>,
    /// Last advisory queue summary per peer.
    queue_summaries: dashmap::DashMap<String, (u32, u32)>,
}

impl Default for GossipState {
    fn default() -> Self {
        Self {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            blacklist: Mutex::new(Vec::new()),
            queue_summaries: dashmap::DashMap::new(),
        }
    }
}

impl GossipState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and merge one inbound message.
    ///
    /// Returns `Ok(true)` when the payload was applied, `Ok(false)` for a
    /// silently ignored duplicate. Signature verification happens before any
    /// mutation, including the dedup insert.
    pub fn ingest(
        &self,
        msg: &GossipMessage,
        trusted: &TrustedKeys,
        roster: &PeerRoster,
        capabilities: &CapabilityIndex,
    ) -> Result<bool, GossipError> {
        {
            let mut seen = self.seen.lock().unwrap();
            if seen.contains(&msg.id) {
                debug!(id = %msg.id, "duplicate gossip ignored");
                return Ok(false);
            }
        }
        if now_ms() - msg.issued_at_ms > msg.ttl_ms as i64 {
            return Err(GossipError::Expired);
        }
        msg.verify(trusted)?;

        // Signature checked — now it is safe to mutate.
        self.seen.lock().unwrap().put(msg.id.clone(), ());

        match &msg.payload {
            GossipPayload::PeerAnnounce(record) => {
                roster.upsert(record.clone());
            }
            GossipPayload::QueueSummary {
                queued_tasks,
                active_agents,
            } => {
                self.queue_summaries
                    .insert(msg.from_peer_id.clone(), (*queued_tasks, *active_agents));
            }
            GossipPayload::CapabilitySummary(summary) => {
                capabilities.replace(summary.clone());
            }
            GossipPayload::BlacklistUpdate { peer_id, reason } => {
                self.blacklist.lock().unwrap().push(BlacklistEntry {
                    peer_id: peer_id.clone(),
                    reason: reason.clone(),
                    reported_by: msg.from_peer_id.clone(),
                    received_at_ms: now_ms(),
                });
            }
            GossipPayload::TaskComplete { task_id, .. } => {
                debug!(task = %task_id, from = %msg.from_peer_id, "task completion gossip");
            }
        }
        Ok(true)
    }

    pub fn blacklist(&self) -> Vec<BlacklistEntry> {
        self.blacklist.lock().unwrap().clone()
    }

    pub fn queue_summary(&self, peer_id: &str) -> Option<(u32, u32)> {
        self.queue_summaries.get(peer_id).map(|e| *e)
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub failed: usize,
}

/// Fire-and-forget fan-out of `msg` to every peer's gossip endpoint.
///
/// Per-peer failures are logged and counted; they never abort the loop or
/// surface as errors.
pub async fn broadcast(
    client: &reqwest::Client,
    peers: &[PeerRecord],
    msg: &GossipMessage,
) -> BroadcastOutcome {
    let deliveries = peers.iter().map(|peer| {
        let url = format!(
            "{}/mesh/gossip",
            peer.coordinator_url.trim_end_matches('/')
        );
        let client = client.clone();
        async move {
            let result = client
                .post(&url)
                .timeout(FANOUT_TIMEOUT)
                .json(msg)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => true,
                Ok(resp) => {
                    warn!(%url, status = %resp.status(), "gossip delivery rejected");
                    false
                }
                Err(e) => {
                    warn!(%url, "gossip delivery failed: {e}");
                    false
                }
            }
        }
    });

    let results = futures::future::join_all(deliveries).await;
    let sent = results.iter().filter(|ok| **ok).count();
    BroadcastOutcome {
        sent,
        failed: results.len() - sent,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetworkMode;

    fn identity_and_roster() -> (NodeIdentity, TrustedKeys) {
        let id = NodeIdentity::generate();
        let mut trusted = TrustedKeys::new();
        trusted.insert(id.peer_id(), id.verifying_key());
        (id, trusted)
    }

    fn announce_payload(peer_id: &str) -> GossipPayload {
        GossipPayload::PeerAnnounce(PeerRecord {
            peer_id: peer_id.into(),
            public_key: "00".repeat(32),
            coordinator_url: "http://peer:4301".into(),
            network_mode: NetworkMode::Lan,
            last_seen_ms: now_ms(),
            reputation: 0.5,
        })
    }

    fn fresh_state() -> (GossipState, PeerRoster, CapabilityIndex) {
        (GossipState::new(), PeerRoster::new(), CapabilityIndex::new())
    }

    #[test]
    fn signed_message_ingests_and_merges() {
        let (id, trusted) = identity_and_roster();
        let (state, roster, caps) = fresh_state();
        let msg = GossipMessage::sign(&id, announce_payload("peer-x"), DEFAULT_TTL_MS);
        assert_eq!(state.ingest(&msg, &trusted, &roster, &caps), Ok(true));
        assert!(roster.get("peer-x").is_some());
    }

    #[test]
    fn duplicate_is_silently_ignored() {
        let (id, trusted) = identity_and_roster();
        let (state, roster, caps) = fresh_state();
        let msg = GossipMessage::sign(&id, announce_payload("peer-x"), DEFAULT_TTL_MS);
        assert_eq!(state.ingest(&msg, &trusted, &roster, &caps), Ok(true));
        assert_eq!(state.ingest(&msg, &trusted, &roster, &caps), Ok(false));
    }

    #[test]
    fn expired_message_is_rejected() {
        let (id, trusted) = identity_and_roster();
        let (state, roster, caps) = fresh_state();
        let mut msg = GossipMessage::sign(&id, announce_payload("peer-x"), 1_000);
        msg.issued_at_ms -= 10_000;
        assert_eq!(
            state.ingest(&msg, &trusted, &roster, &caps),
            Err(GossipError::Expired)
        );
    }

    #[test]
    fn tampered_payload_fails_before_any_merge() {
        let (id, trusted) = identity_and_roster();
        let (state, roster, caps) = fresh_state();
        let mut msg = GossipMessage::sign(&id, announce_payload("peer-x"), DEFAULT_TTL_MS);
        msg.payload = announce_payload("peer-EVIL");
        assert_eq!(
            state.ingest(&msg, &trusted, &roster, &caps),
            Err(GossipError::SignatureInvalid)
        );
        assert!(roster.get("peer-EVIL").is_none(), "no mutation on bad signature");
        // The id must not have been marked seen either: a correctly signed
        // copy of the same id should still be accepted.
        let good = GossipMessage::sign(&id, announce_payload("peer-x"), DEFAULT_TTL_MS);
        assert_eq!(state.ingest(&good, &trusted, &roster, &caps), Ok(true));
    }

    #[test]
    fn untrusted_sender_is_rejected() {
        let id = NodeIdentity::generate();
        let trusted = TrustedKeys::new();
        let (state, roster, caps) = fresh_state();
        let msg = GossipMessage::sign(&id, announce_payload("peer-x"), DEFAULT_TTL_MS);
        assert_eq!(
            state.ingest(&msg, &trusted, &roster, &caps),
            Err(GossipError::UntrustedPeer)
        );
    }

    #[test]
    fn blacklist_updates_append_to_the_audit_chain() {
        let (id, trusted) = identity_and_roster();
        let (state, roster, caps) = fresh_state();
        for reason in ["spam", "bad results"] {
            let msg = GossipMessage::sign(
                &id,
                GossipPayload::BlacklistUpdate {
                    peer_id: "peer-bad".into(),
                    reason: reason.into(),
                },
                DEFAULT_TTL_MS,
            );
            state.ingest(&msg, &trusted, &roster, &caps).unwrap();
        }
        let entries = state.blacklist();
        assert_eq!(entries.len(), 2, "audit entries append, never replace");
        assert_eq!(entries[0].reason, "spam");
    }

    #[test]
    fn capability_summary_replaces_prior_summary() {
        let (id, trusted) = identity_and_roster();
        let (state, roster, caps) = fresh_state();
        for count in [1u32, 3] {
            let summary = CapabilitySummary {
                coordinator_id: id.peer_id().to_string(),
                models: vec![crate::types::ModelCapability {
                    model: "m".into(),
                    agent_count: count,
                    total_param_capacity: 7.0,
                    avg_load: 0.0,
                }],
                issued_at_ms: now_ms(),
            };
            let msg = GossipMessage::sign(
                &id,
                GossipPayload::CapabilitySummary(summary),
                DEFAULT_TTL_MS,
            );
            state.ingest(&msg, &trusted, &roster, &caps).unwrap();
        }
        let stored = capsule(&caps, id.peer_id());
        assert_eq!(stored.models[0].agent_count, 3, "later summary replaces earlier");
    }

    fn capsule(caps: &CapabilityIndex, coordinator: &str) -> CapabilitySummary {
        caps.get(coordinator).expect("summary stored")
    }

    #[tokio::test]
    async fn broadcast_counts_reachable_and_unreachable_peers() {
        use axum::{routing::post, Router};

        // One real listener that accepts gossip…
        let app = Router::new().route("/mesh/gossip", post(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // …and one peer pointing at a dead port.
        let peers = vec![
            PeerRecord {
                peer_id: "up".into(),
                public_key: "00".repeat(32),
                coordinator_url: format!("http://{addr}"),
                network_mode: NetworkMode::Lan,
                last_seen_ms: now_ms(),
                reputation: 0.5,
            },
            PeerRecord {
                peer_id: "down".into(),
                public_key: "00".repeat(32),
                coordinator_url: "http://127.0.0.1:9".into(),
                network_mode: NetworkMode::Lan,
                last_seen_ms: now_ms(),
                reputation: 0.5,
            },
        ];

        let id = NodeIdentity::generate();
        let msg = GossipMessage::sign(&id, announce_payload("peer-x"), DEFAULT_TTL_MS);
        let client = reqwest::Client::new();
        let outcome = broadcast(&client, &peers, &msg).await;
        assert_eq!(outcome, BroadcastOutcome { sent: 1, failed: 1 });
    }
}
