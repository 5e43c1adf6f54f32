// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shared mesh records replicated between coordinators.
//!
//! Peers and capabilities are read-only for everyone except the originating
//! peer; only it mutates its own entry, and the rest of the mesh learns about
//! changes through gossip.

use serde::{Deserialize, Serialize};

/// How a peer is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Lan,
    Wan,
    /// Reachable only over the chunked low-bandwidth transport.
    Ble,
}

/// One entry in the peer roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
    pub coordinator_url: String,
    #[serde(default)]
    pub network_mode: NetworkMode,
    pub last_seen_ms: i64,
    /// 0.0 – 1.0; starts at the neutral midpoint.
    #[serde(default = "default_reputation")]
    pub reputation: f64,
}

fn default_reputation() -> f64 {
    0.5
}

/// What one agent can currently do. Refreshed on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    /// `none`, `vm` or `docker`.
    pub sandbox_mode: String,
    pub active_model: String,
    /// Billions of parameters.
    pub active_model_param_size: f64,
    /// Tasks currently executing on the agent.
    pub current_load: u32,
    /// `swarm-only` or `ide-enabled`.
    pub mode: String,
    pub model_provider: String,
    pub max_concurrent_tasks: u32,
    #[serde(default)]
    pub swap_in_progress: bool,
}

impl AgentCapability {
    /// An agent with spare capacity.
    pub fn has_headroom(&self) -> bool {
        !self.swap_in_progress && self.current_load < self.max_concurrent_tasks
    }
}

/// Per-model aggregate within a [`CapabilitySummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapability {
    pub model: String,
    pub agent_count: u32,
    /// Sum of parameter sizes across agents serving this model, in billions.
    pub total_param_capacity: f64,
    pub avg_load: f64,
}

/// A coordinator's periodic summary of the agents it fronts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySummary {
    pub coordinator_id: String,
    pub models: Vec<ModelCapability>,
    pub issued_at_ms: i64,
}

impl CapabilitySummary {
    /// Aggregate a set of agent capabilities into per-model rows.
    pub fn aggregate<'a>(
        coordinator_id: &str,
        capabilities: impl Iterator<Item = &'a AgentCapability>,
        issued_at_ms: i64,
    ) -> Self {
        use std::collections::BTreeMap;
        // BTreeMap keeps the model order stable across runs.
        let mut by_model: BTreeMap<String, (u32, f64, f64)> = BTreeMap::new();
        for cap in capabilities {
            let entry = by_model.entry(cap.active_model.clone()).or_default();
            entry.0 += 1;
            entry.1 += cap.active_model_param_size;
            entry.2 += cap.current_load as f64;
        }
        let models = by_model
            .into_iter()
            .map(|(model, (count, params, load))| ModelCapability {
                model,
                agent_count: count,
                total_param_capacity: params,
                avg_load: load / count as f64,
            })
            .collect();
        Self {
            coordinator_id: coordinator_id.to_string(),
            models,
            issued_at_ms,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(model: &str, params: f64, load: u32) -> AgentCapability {
        AgentCapability {
            sandbox_mode: "docker".into(),
            active_model: model.into(),
            active_model_param_size: params,
            current_load: load,
            mode: "swarm-only".into(),
            model_provider: "ollama-local".into(),
            max_concurrent_tasks: 2,
            swap_in_progress: false,
        }
    }

    #[test]
    fn aggregate_groups_by_model() {
        let caps = vec![cap("a", 7.0, 1), cap("a", 7.0, 0), cap("b", 70.0, 2)];
        let summary = CapabilitySummary::aggregate("coord-1", caps.iter(), 1_000);
        assert_eq!(summary.models.len(), 2);
        let a = summary.models.iter().find(|m| m.model == "a").unwrap();
        assert_eq!(a.agent_count, 2);
        assert_eq!(a.total_param_capacity, 14.0);
        assert_eq!(a.avg_load, 0.5);
    }

    #[test]
    fn aggregate_of_nothing_is_empty() {
        let summary = CapabilitySummary::aggregate("coord-1", std::iter::empty(), 0);
        assert!(summary.models.is_empty());
    }

    #[test]
    fn headroom_requires_idle_slot_and_no_swap() {
        let mut c = cap("a", 7.0, 1);
        assert!(c.has_headroom());
        c.current_load = 2;
        assert!(!c.has_headroom());
        c.current_load = 0;
        c.swap_in_progress = true;
        assert!(!c.has_headroom());
    }
}
