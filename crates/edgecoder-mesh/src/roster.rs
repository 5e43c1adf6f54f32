// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The non-durable peer set.
//!
//! Inserted on enrollment, touched on heartbeat, evicted by the staleness
//! sweeper. Not persisted across restarts; peers re-enrol.

use dashmap::DashMap;

use edgecoder_crypto::now_ms;

use crate::types::PeerRecord;

#[derive(Debug, Default)]
pub struct PeerRoster {
    peers: DashMap<String, PeerRecord>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer record.
    pub fn upsert(&self, record: PeerRecord) {
        self.peers.insert(record.peer_id.clone(), record);
    }

    /// Refresh `last_seen_ms` for a live peer; returns false when unknown.
    pub fn touch(&self, peer_id: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut entry) => {
                entry.last_seen_ms = now_ms();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.get(peer_id).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.iter().map(|e| e.clone()).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop peers not heard from within `stale_ms`; returns the evicted ids.
    pub fn evict_stale(&self, stale_ms: u64) -> Vec<String> {
        let cutoff = now_ms() - stale_ms as i64;
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|e| e.last_seen_ms < cutoff)
            .map(|e| e.peer_id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// Nudge a peer's reputation by `delta`, clamped to [0, 1].
    pub fn adjust_reputation(&self, peer_id: &str, delta: f64) {
        if let Some(mut entry) = self.peers.get_mut(peer_id) {
            entry.reputation = (entry.reputation + delta).clamp(0.0, 1.0);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetworkMode;

    fn record(id: &str, last_seen_ms: i64) -> PeerRecord {
        PeerRecord {
            peer_id: id.into(),
            public_key: "00".repeat(32),
            coordinator_url: format!("http://{id}:4301"),
            network_mode: NetworkMode::Lan,
            last_seen_ms,
            reputation: 0.5,
        }
    }

    #[test]
    fn upsert_then_get() {
        let roster = PeerRoster::new();
        roster.upsert(record("p1", now_ms()));
        assert!(roster.get("p1").is_some());
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let roster = PeerRoster::new();
        roster.upsert(record("p1", 1));
        let mut updated = record("p1", 2);
        updated.coordinator_url = "http://new:4301".into();
        roster.upsert(updated);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get("p1").unwrap().coordinator_url, "http://new:4301");
    }

    #[test]
    fn touch_refreshes_last_seen() {
        let roster = PeerRoster::new();
        roster.upsert(record("p1", 1));
        assert!(roster.touch("p1"));
        assert!(roster.get("p1").unwrap().last_seen_ms > 1);
    }

    #[test]
    fn touch_unknown_peer_returns_false() {
        let roster = PeerRoster::new();
        assert!(!roster.touch("ghost"));
    }

    #[test]
    fn evict_stale_drops_only_old_peers() {
        let roster = PeerRoster::new();
        roster.upsert(record("old", now_ms() - 10_000));
        roster.upsert(record("fresh", now_ms()));
        let evicted = roster.evict_stale(5_000);
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(roster.get("old").is_none());
        assert!(roster.get("fresh").is_some());
    }

    #[test]
    fn reputation_is_clamped() {
        let roster = PeerRoster::new();
        roster.upsert(record("p1", now_ms()));
        roster.adjust_reputation("p1", 5.0);
        assert_eq!(roster.get("p1").unwrap().reputation, 1.0);
        roster.adjust_reputation("p1", -5.0);
        assert_eq!(roster.get("p1").unwrap().reputation, 0.0);
    }

    #[test]
    fn list_is_sorted_by_peer_id() {
        let roster = PeerRoster::new();
        roster.upsert(record("b", now_ms()));
        roster.upsert(record("a", now_ms()));
        let ids: Vec<String> = roster.list().into_iter().map(|p| p.peer_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
