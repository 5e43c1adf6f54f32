// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide services with explicit lifecycle.
//!
//! Everything a handler needs hangs off [`AppState`]: constructed once at
//! boot, cloned cheaply (everything is behind an `Arc`), torn down at
//! shutdown. No ambient globals anywhere.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use edgecoder_config::Config;
use edgecoder_credits::CreditEngine;
use edgecoder_crypto::{now_ms, NodeIdentity, NonceStore, TrustedKeys};
use edgecoder_mesh::{AgentCapability, CapabilityIndex, GossipState, PeerRoster};
use edgecoder_model::ModelProvider;
use edgecoder_sandbox::{SandboxExecutor, SandboxMode};

use crate::auth::AuthState;
use crate::escalate::{EscalationResolver, EscalationResult};
use crate::handshake::HandshakeStore;
use crate::model_manager::ModelManager;
use crate::queue::TaskQueue;

#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<NodeIdentity>,
    pub trusted: Arc<RwLock<TrustedKeys>>,
    pub nonces: Arc<NonceStore>,
    pub auth: AuthState,
    pub queue: Arc<TaskQueue>,
    pub roster: Arc<PeerRoster>,
    pub gossip: Arc<GossipState>,
    pub capabilities: Arc<CapabilityIndex>,
    /// Capability per enrolled agent, refreshed on heartbeat.
    pub agent_caps: Arc<DashMap<String, AgentCapability>>,
    pub credits: Arc<CreditEngine>,
    pub handshakes: Arc<HandshakeStore>,
    pub resolver: Arc<EscalationResolver>,
    /// Resolved escalations keyed by task id, served by `GET /escalate/:id`.
    pub escalations: Arc<DashMap<String, EscalationResult>>,
    pub models: Arc<ModelManager>,
    pub executor: Arc<SandboxExecutor>,
    pub config: Arc<Config>,
    pub client: reqwest::Client,
    pub started_at_ms: i64,
}

impl AppState {
    /// Assemble all services from configuration. This is the single
    /// construction point for a node's shared state.
    pub fn build(
        config: Arc<Config>,
        identity: NodeIdentity,
        trusted: TrustedKeys,
        model: Arc<dyn ModelProvider>,
    ) -> anyhow::Result<Self> {
        let credits = match &config.credits.ledger_file {
            Some(path) => CreditEngine::open(std::path::Path::new(path))?,
            None => CreditEngine::in_memory(),
        };
        let host_mode =
            SandboxMode::parse(&config.sandbox.mode).unwrap_or(SandboxMode::None);
        let executor = Arc::new(SandboxExecutor::new(
            host_mode,
            config.worker.max_concurrent_tasks,
        ));
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        let identity = Arc::new(identity);
        let resolver = Arc::new(EscalationResolver::new(
            config.escalation.clone(),
            Arc::clone(&identity),
            client.clone(),
        ));

        Ok(Self {
            auth: AuthState::with_defaults(config.mesh.auth_token.clone()),
            nonces: Arc::new(NonceStore::new(
                config.inference.nonce_ttl_ms,
                config.inference.max_signature_skew_ms,
            )),
            trusted: Arc::new(RwLock::new(trusted)),
            identity,
            queue: Arc::new(TaskQueue::new()),
            roster: Arc::new(PeerRoster::new()),
            gossip: Arc::new(GossipState::new()),
            capabilities: Arc::new(CapabilityIndex::new()),
            agent_caps: Arc::new(DashMap::new()),
            credits: Arc::new(credits),
            handshakes: Arc::new(HandshakeStore::new()),
            resolver,
            escalations: Arc::new(DashMap::new()),
            models: Arc::new(ModelManager::new(model)),
            executor,
            config,
            client,
            started_at_ms: now_ms(),
        })
    }

    /// This node's own capability record, derived from live state.
    pub fn own_capability(&self) -> AgentCapability {
        AgentCapability {
            sandbox_mode: self.executor.host_mode().as_str().to_string(),
            active_model: self.models.active_model(),
            active_model_param_size: self.config.model.param_size_b,
            current_load: self.queue.lease_len() as u32,
            mode: self.config.node.agent_mode.clone(),
            model_provider: self.config.model.provider.clone(),
            max_concurrent_tasks: self.config.worker.max_concurrent_tasks as u32,
            swap_in_progress: self.models.swap_in_progress(),
        }
    }
}
