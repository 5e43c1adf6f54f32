// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Nonce replay cache.
//!
//! A nonce is accepted exactly once within its TTL. The cache is pruned by a
//! periodic sweeper *and* opportunistically on insert when it grows past its
//! soft cap, so a burst of traffic between sweeps cannot grow it unboundedly.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::now_ms;

/// Soft cap; inserts past this trigger an inline prune.
const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NonceVerifyError {
    #[error("timestamp_skew")]
    TimestampSkew,
    #[error("replay")]
    Replay,
}

#[derive(Debug)]
struct NonceEntry {
    #[allow(dead_code)]
    source_id: String,
    expires_at_ms: i64,
}

/// Thread-safe nonce cache.
#[derive(Debug)]
pub struct NonceStore {
    entries: Mutex<HashMap<String, NonceEntry>>,
    ttl_ms: i64,
    max_skew_ms: i64,
    max_entries: usize,
}

impl NonceStore {
    pub fn new(ttl_ms: u64, max_skew_ms: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_ms: ttl_ms as i64,
            max_skew_ms: max_skew_ms as i64,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    #[cfg(test)]
    fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// True when `nonce` is currently live in the cache.
    pub fn exists(&self, nonce: &str) -> bool {
        let now = now_ms();
        let entries = self.entries.lock().unwrap();
        entries
            .get(nonce)
            .map(|e| e.expires_at_ms > now)
            .unwrap_or(false)
    }

    /// Record a nonce with an explicit expiry.
    pub fn insert(&self, nonce: &str, source_id: &str, expires_at_ms: i64) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_entries {
            let now = now_ms();
            entries.retain(|_, e| e.expires_at_ms > now);
        }
        entries.insert(
            nonce.to_string(),
            NonceEntry {
                source_id: source_id.to_string(),
                expires_at_ms,
            },
        );
    }

    /// Drop expired entries; returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = now_ms();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at_ms > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Full replay check for a signed request: timestamp within skew, nonce
    /// unseen. On success the nonce is recorded for `ttl_ms`.
    pub fn verify_nonce(
        &self,
        nonce: &str,
        source_id: &str,
        timestamp_ms: i64,
    ) -> Result<(), NonceVerifyError> {
        let now = now_ms();
        if (now - timestamp_ms).abs() > self.max_skew_ms {
            return Err(NonceVerifyError::TimestampSkew);
        }
        // exists + insert under one lock so two concurrent requests with the
        // same nonce cannot both pass.
        let mut entries = self.entries.lock().unwrap();
        if let Some(e) = entries.get(nonce) {
            if e.expires_at_ms > now {
                return Err(NonceVerifyError::Replay);
            }
        }
        if entries.len() >= self.max_entries {
            entries.retain(|_, e| e.expires_at_ms > now);
        }
        entries.insert(
            nonce.to_string(),
            NonceEntry {
                source_id: source_id.to_string(),
                expires_at_ms: now + self.ttl_ms,
            },
        );
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> NonceStore {
        NonceStore::new(300_000, 30_000)
    }

    #[test]
    fn fresh_nonce_passes_and_is_recorded() {
        let s = store();
        assert_eq!(s.verify_nonce("n1", "peer-a", now_ms()), Ok(()));
        assert!(s.exists("n1"));
    }

    #[test]
    fn replayed_nonce_within_ttl_is_rejected() {
        let s = store();
        let ts = now_ms();
        assert_eq!(s.verify_nonce("n1", "peer-a", ts), Ok(()));
        assert_eq!(
            s.verify_nonce("n1", "peer-a", ts),
            Err(NonceVerifyError::Replay)
        );
    }

    #[test]
    fn replay_is_rejected_regardless_of_source() {
        let s = store();
        let ts = now_ms();
        assert_eq!(s.verify_nonce("n1", "peer-a", ts), Ok(()));
        assert_eq!(
            s.verify_nonce("n1", "peer-b", ts),
            Err(NonceVerifyError::Replay)
        );
    }

    #[test]
    fn timestamp_far_in_past_is_skew() {
        let s = store();
        // 10 × max_skew behind now.
        let ts = now_ms() - 300_000;
        assert_eq!(
            s.verify_nonce("n1", "peer-a", ts),
            Err(NonceVerifyError::TimestampSkew)
        );
        assert!(!s.exists("n1"), "skewed requests must not record the nonce");
    }

    #[test]
    fn timestamp_far_in_future_is_skew() {
        let s = store();
        let ts = now_ms() + 300_000;
        assert_eq!(
            s.verify_nonce("n1", "peer-a", ts),
            Err(NonceVerifyError::TimestampSkew)
        );
    }

    #[test]
    fn prune_drops_expired_entries() {
        let s = store();
        s.insert("dead", "peer-a", now_ms() - 1);
        s.insert("live", "peer-a", now_ms() + 60_000);
        let removed = s.prune();
        assert_eq!(removed, 1);
        assert!(!s.exists("dead"));
        assert!(s.exists("live"));
    }

    #[test]
    fn oversized_store_prunes_on_insert() {
        let s = NonceStore::new(300_000, 30_000).with_max_entries(4);
        for i in 0..4 {
            s.insert(&format!("dead-{i}"), "peer-a", now_ms() - 1);
        }
        assert_eq!(s.len(), 4);
        s.insert("fresh", "peer-a", now_ms() + 60_000);
        assert_eq!(s.len(), 1, "expired entries must be dropped inline");
        assert!(s.exists("fresh"));
    }

    #[test]
    fn expired_nonce_can_be_reused() {
        let s = store();
        s.insert("n1", "peer-a", now_ms() - 1);
        assert_eq!(s.verify_nonce("n1", "peer-a", now_ms()), Ok(()));
    }
}
