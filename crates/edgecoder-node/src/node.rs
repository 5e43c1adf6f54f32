// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Node startup — assembles the coordinator subsystems and starts them.
//!
//! # Startup sequence
//!
//! [`run_coordinator`] performs these steps in order:
//!
//! 1. Spawn the lease sweeper (expired claims return to the queue).
//! 2. Spawn the nonce-cache pruner.
//! 3. Spawn the handshake-session cleanup sweeper.
//! 4. Spawn the roster staleness sweeper.
//! 5. Spawn the capability broadcast timer (gossip fan-out).
//! 6. Bind the Axum server and serve until shutdown.
//!
//! The worker loop is separate (`worker::run_worker_loop`) so `worker`-mode
//! processes run it without any HTTP server, and `all-in-one` runs both.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use edgecoder_crypto::now_ms;
use edgecoder_mesh::{broadcast, CapabilitySummary, GossipMessage, GossipPayload};

use crate::http;
use crate::state::AppState;

/// How often expired leases are returned to the queue.
const LEASE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
/// Nonce cache prune cadence.
const NONCE_PRUNE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
/// Handshake cleanup cadence.
const HANDSHAKE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Serve the coordinator API, blocking until the listener fails or the
/// process shuts down.
pub async fn run_coordinator(state: AppState, bind: &str) -> anyhow::Result<()> {
    spawn_sweepers(state.clone());

    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid coordinator bind address {bind:?}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, peer_id = %state.identity.peer_id(), "coordinator listening");

    let app = http::router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Start the background sweepers owned by a coordinator.
pub fn spawn_sweepers(state: AppState) {
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LEASE_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let requeued = state.queue.requeue_expired();
                if requeued > 0 {
                    debug!(requeued, "expired leases returned to queue");
                }
            }
        });
    }
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(NONCE_PRUNE_INTERVAL);
            loop {
                tick.tick().await;
                state.nonces.prune();
            }
        });
    }
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HANDSHAKE_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let expired = state.handshakes.sweep();
                if expired > 0 {
                    debug!(expired, "handshake sessions expired");
                }
            }
        });
    }
    {
        let state = state.clone();
        let stale_ms = state.config.mesh.peer_stale_ms;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tick.tick().await;
                let evicted = state.roster.evict_stale(stale_ms);
                for peer in &evicted {
                    warn!(%peer, "peer evicted after staleness window");
                }
                // Stale capability summaries go with their coordinators.
                state
                    .capabilities
                    .evict_older_than(now_ms() - 2 * stale_ms as i64);
            }
        });
    }
    {
        let state = state.clone();
        let interval = state.config.mesh.capability_broadcast_interval_ms;
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_millis(interval.max(1_000)));
            loop {
                tick.tick().await;
                broadcast_capabilities(&state).await;
            }
        });
    }
}

/// Build this coordinator's capability summary and gossip it to the roster.
async fn broadcast_capabilities(state: &AppState) {
    // Own capability plus everything enrolled agents reported.
    let mut caps: Vec<edgecoder_mesh::AgentCapability> =
        state.agent_caps.iter().map(|e| e.clone()).collect();
    caps.push(state.own_capability());

    let summary =
        CapabilitySummary::aggregate(state.identity.peer_id(), caps.iter(), now_ms());
    // Serve our own summary locally too, so the federated query endpoint
    // reflects this coordinator without a gossip round trip.
    state.capabilities.replace(summary.clone());

    let peers = state.roster.list();
    if peers.is_empty() {
        return;
    }
    let msg = GossipMessage::sign(
        &state.identity,
        GossipPayload::CapabilitySummary(summary),
        edgecoder_mesh::gossip::DEFAULT_TTL_MS,
    );
    let outcome = broadcast(&state.client, &peers, &msg).await;
    debug!(sent = outcome.sent, failed = outcome.failed, "capability summary broadcast");

    let queue_msg = GossipMessage::sign(
        &state.identity,
        GossipPayload::QueueSummary {
            queued_tasks: state.queue.queued_len() as u32,
            active_agents: state.agent_caps.len() as u32,
        },
        edgecoder_mesh::gossip::DEFAULT_TTL_MS,
    );
    let _ = broadcast(&state.client, &peers, &queue_msg).await;
}
