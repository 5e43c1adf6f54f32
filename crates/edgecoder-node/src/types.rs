// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Coordinator wire types.
//!
//! Requests deserialize into these typed values at the HTTP boundary; an
//! unparseable payload never reaches business logic (it fails with
//! `validation_error` in the extractor).

use serde::{Deserialize, Serialize};

use edgecoder_agent::AgentExecution;
use edgecoder_sandbox::Language;

/// Compute class a task needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    #[default]
    Cpu,
    Gpu,
}

impl ResourceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }
}

/// Task lifecycle: queued → claimed → running → {completed | failed |
/// escalated | handshake} → settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Claimed,
    Running,
    Completed,
    Failed,
    Escalated,
    Handshake,
    Settled,
}

/// A submitted coding task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub requester_account_id: String,
    pub prompt: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub resource_class: ResourceClass,
    #[serde(default)]
    pub requires_sandbox: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskKind {
    MicroLoop,
    SingleStep,
}

/// The smallest unit workers claim. Inherits the parent task's sandbox
/// requirement; `timeout_ms` is clamped to [5 s, 60 s] at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub subtask_id: String,
    pub task_id: String,
    pub kind: SubtaskKind,
    pub input: String,
    pub language: Language,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
}

/// Bounds on a subtask's wall clock.
pub const MIN_SUBTASK_TIMEOUT_MS: u64 = 5_000;
pub const MAX_SUBTASK_TIMEOUT_MS: u64 = 60_000;

pub fn clamp_subtask_timeout(timeout_ms: u64) -> u64 {
    timeout_ms.clamp(MIN_SUBTASK_TIMEOUT_MS, MAX_SUBTASK_TIMEOUT_MS)
}

impl Subtask {
    pub fn single_step(task: &Task, input: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            subtask_id: uuid::Uuid::new_v4().to_string(),
            task_id: task.task_id.clone(),
            kind: SubtaskKind::SingleStep,
            input: input.into(),
            language: task.language,
            timeout_ms: clamp_subtask_timeout(timeout_ms),
            snapshot_ref: task.snapshot_ref.clone(),
        }
    }
}

// ── HTTP request/response bodies ─────────────────────────────────────────────

/// `POST /tasks` body.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitTaskRequest {
    pub requester_account_id: String,
    pub prompt: String,
    pub language: Language,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub resource_class: ResourceClass,
    #[serde(default)]
    pub requires_sandbox: bool,
    #[serde(default)]
    pub snapshot_ref: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Pre-decomposed subtask inputs; when empty the task becomes one
    /// single-step subtask.
    #[serde(default)]
    pub subtasks: Vec<SubtaskSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubtaskSpec {
    pub input: String,
    #[serde(default)]
    pub kind: Option<SubtaskKind>,
    #[serde(default = "default_subtask_timeout")]
    pub timeout_ms: u64,
}

fn default_subtask_timeout() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub subtask_count: usize,
    /// Escrow hold placed against the requester.
    pub hold_tx_id: String,
}

/// `POST /pull` body — the worker-initiated claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub agent_id: String,
    pub model: String,
    pub os: String,
    /// Resource classes this worker can serve.
    #[serde(default = "default_resource_classes")]
    pub resource_classes: Vec<ResourceClass>,
    /// Fresh capability snapshot; every pull doubles as a heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<edgecoder_mesh::AgentCapability>,
}

fn default_resource_classes() -> Vec<ResourceClass> {
    vec![ResourceClass::Cpu]
}

/// `POST /pull` response when a subtask is available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub subtask: Subtask,
    pub requires_sandbox: bool,
    pub priority: i32,
    /// Lease expiry; past it the subtask returns to the queue.
    pub lease_expires_at_ms: i64,
}

/// `POST /result` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResultReport {
    pub subtask_id: String,
    pub agent_id: String,
    /// Idempotency key for credit accrual.
    pub report_id: String,
    pub execution: AgentExecution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResultResponse {
    pub task_status: TaskStatus,
    pub credited: f64,
}

/// Registration body for `POST /mesh/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub peer_id: String,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
    pub coordinator_url: String,
    pub registration_token: String,
    #[serde(default)]
    pub capability: Option<edgecoder_mesh::AgentCapability>,
}

/// Node status document for `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub peer_id: String,
    pub version: String,
    pub runtime_mode: String,
    pub uptime_ms: i64,
    pub queued_subtasks: usize,
    pub active_leases: usize,
    pub peers: usize,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
