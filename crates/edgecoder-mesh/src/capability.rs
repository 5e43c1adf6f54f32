// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Federated capability index.
//!
//! Each coordinator broadcasts a [`CapabilitySummary`] on a timer; received
//! summaries are stored per coordinator and served through the federated
//! query endpoint (`/mesh/capabilities?model=…`).

use dashmap::DashMap;

use crate::types::{CapabilitySummary, ModelCapability};

#[derive(Debug, Default)]
pub struct CapabilityIndex {
    by_coordinator: DashMap<String, CapabilitySummary>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `summary`, replacing any prior one from the same coordinator.
    pub fn replace(&self, summary: CapabilitySummary) {
        self.by_coordinator
            .insert(summary.coordinator_id.clone(), summary);
    }

    pub fn get(&self, coordinator_id: &str) -> Option<CapabilitySummary> {
        self.by_coordinator.get(coordinator_id).map(|e| e.clone())
    }

    /// All stored summaries, sorted by coordinator id for stable output.
    pub fn all(&self) -> Vec<CapabilitySummary> {
        let mut summaries: Vec<CapabilitySummary> =
            self.by_coordinator.iter().map(|e| e.clone()).collect();
        summaries.sort_by(|a, b| a.coordinator_id.cmp(&b.coordinator_id));
        summaries
    }

    /// Federated per-model query: every coordinator's row for `model`.
    pub fn query_model(&self, model: &str) -> Vec<(String, ModelCapability)> {
        let mut rows: Vec<(String, ModelCapability)> = self
            .by_coordinator
            .iter()
            .filter_map(|entry| {
                entry
                    .models
                    .iter()
                    .find(|m| m.model == model)
                    .map(|m| (entry.coordinator_id.clone(), m.clone()))
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Drop summaries issued before `cutoff_ms`.
    pub fn evict_older_than(&self, cutoff_ms: i64) -> usize {
        let stale: Vec<String> = self
            .by_coordinator
            .iter()
            .filter(|e| e.issued_at_ms < cutoff_ms)
            .map(|e| e.coordinator_id.clone())
            .collect();
        for id in &stale {
            self.by_coordinator.remove(id);
        }
        stale.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
