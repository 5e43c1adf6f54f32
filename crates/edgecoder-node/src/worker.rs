// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The worker loop: pull a subtask over signed HTTP, run the agent, report
//! the result. Concurrency is capped by a semaphore sized to
//! `max_concurrent_tasks`; each claimed subtask runs in its own spawned task
//! so a slow sandbox never blocks the next pull.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use edgecoder_agent::{Agent, AgentOptions};
use edgecoder_crypto::{NodeIdentity, HDR_AGENT_ID};
use edgecoder_mesh::AgentCapability;
use edgecoder_model::ModelProvider;
use edgecoder_sandbox::{SandboxExecutor, SandboxPolicy};

use crate::outbound::signed_post;
use crate::types::{PullRequest, PullResponse, ResourceClass, SubtaskResultReport};

/// Everything one worker loop needs; cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct WorkerContext {
    pub identity: Arc<NodeIdentity>,
    pub coordinator_url: String,
    pub model: Arc<dyn ModelProvider>,
    pub executor: Arc<SandboxExecutor>,
    pub client: reqwest::Client,
    pub os: String,
    pub poll_interval: Duration,
    pub permits: Arc<Semaphore>,
    pub max_concurrent: usize,
}

impl WorkerContext {
    pub fn new(
        identity: Arc<NodeIdentity>,
        coordinator_url: String,
        model: Arc<dyn ModelProvider>,
        executor: Arc<SandboxExecutor>,
        os: String,
        max_concurrent: usize,
        poll_interval_ms: u64,
    ) -> Self {
        Self {
            identity,
            coordinator_url,
            model,
            executor,
            client: reqwest::Client::new(),
            os,
            poll_interval: Duration::from_millis(poll_interval_ms),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Capability snapshot sent with every pull, doubling as the heartbeat.
    fn capability(&self) -> AgentCapability {
        AgentCapability {
            sandbox_mode: self.executor.host_mode().as_str().to_string(),
            active_model: self.model.model_name().to_string(),
            active_model_param_size: 0.0,
            current_load: (self.max_concurrent - self.permits.available_permits()) as u32,
            mode: "swarm-only".into(),
            model_provider: self.model.name().to_string(),
            max_concurrent_tasks: self.max_concurrent as u32,
            swap_in_progress: false,
        }
    }
}

/// Run the pull loop until the process shuts down.
pub async fn run_worker_loop(ctx: WorkerContext) {
    info!(coordinator = %ctx.coordinator_url, "worker loop started");
    loop {
        // Hold a permit across the whole pull → run → report cycle so the
        // coordinator never sees more claims than this node can execute.
        let permit = ctx
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("worker semaphore is never closed");

        match pull_one(&ctx).await {
            Ok(Some(claimed)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    execute_and_report(&ctx, claimed).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::time::sleep(ctx.poll_interval).await;
            }
            Err(e) => {
                drop(permit);
                warn!("pull failed: {e}");
                tokio::time::sleep(ctx.poll_interval).await;
            }
        }
    }
}

/// One signed pull. `Ok(None)` means the queue had nothing for us (204).
async fn pull_one(ctx: &WorkerContext) -> anyhow::Result<Option<PullResponse>> {
    let url = format!("{}/pull", ctx.coordinator_url.trim_end_matches('/'));
    let request = PullRequest {
        agent_id: ctx.identity.peer_id().to_string(),
        model: ctx.model.model_name().to_string(),
        os: ctx.os.clone(),
        resource_classes: vec![ResourceClass::Cpu],
        capability: Some(ctx.capability()),
    };
    let body = serde_json::to_vec(&request)?;
    let response = signed_post(&ctx.client, &ctx.identity, HDR_AGENT_ID, &url, &body)
        .send()
        .await?;

    if response.status() == reqwest::StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let response = response.error_for_status()?;
    Ok(Some(response.json().await?))
}

/// Run the agent on a claimed subtask and report the outcome.
async fn execute_and_report(ctx: &WorkerContext, claimed: PullResponse) {
    let subtask = &claimed.subtask;
    debug!(subtask = %subtask.subtask_id, "executing claimed subtask");

    let options = AgentOptions::swarm_worker().with_sandbox(SandboxPolicy {
        required: claimed.requires_sandbox,
        timeout_ms: subtask.timeout_ms,
        ..SandboxPolicy::default()
    });
    let agent = Agent::new(Arc::clone(&ctx.model), Arc::clone(&ctx.executor), options);
    let execution = agent.run(&subtask.input, subtask.language).await;

    let report = SubtaskResultReport {
        subtask_id: subtask.subtask_id.clone(),
        agent_id: ctx.identity.peer_id().to_string(),
        report_id: Uuid::new_v4().to_string(),
        execution,
    };
    let url = format!("{}/result", ctx.coordinator_url.trim_end_matches('/'));
    let body = match serde_json::to_vec(&report) {
        Ok(b) => b,
        Err(e) => {
            warn!("result serialization failed: {e}");
            return;
        }
    };
    match signed_post(&ctx.client, &ctx.identity, HDR_AGENT_ID, &url, &body)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            info!(subtask = %subtask.subtask_id, "result reported");
        }
        Ok(resp) => warn!(
            subtask = %subtask.subtask_id,
            status = %resp.status(),
            "result rejected by coordinator"
        ),
        Err(e) => warn!(subtask = %subtask.subtask_id, "result delivery failed: {e}"),
    }
}
