// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The coordinator's task queue.
//!
//! Pull ordering: priority descending, then parent-task FIFO, ties broken by
//! subtask age. A claim takes a lease of `timeout_ms + 5 s grace`; leases
//! whose worker never reports back are returned to the queue by the sweeper.
//!
//! All queue operations run under one mutex, so a pull is serialised per
//! coordinator: two workers can never claim the same subtask.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use edgecoder_crypto::now_ms;
use edgecoder_mesh::AgentCapability;

use crate::error::ApiError;
use crate::types::{
    PullRequest, PullResponse, ResourceClass, Subtask, SubtaskResultReport, Task, TaskStatus,
};

/// Extra time past the subtask timeout before a lease is declared dead.
pub const LEASE_GRACE_MS: u64 = 5_000;

#[derive(Debug, Clone)]
struct QueuedSubtask {
    subtask: Subtask,
    priority: i32,
    requires_sandbox: bool,
    resource_class: ResourceClass,
    task_created_at_ms: i64,
    enqueued_at_ms: i64,
}

#[derive(Debug, Clone)]
struct Lease {
    entry: QueuedSubtask,
    agent_id: String,
    expires_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub total_subtasks: usize,
    pub completed_subtasks: usize,
    /// Escrow hold placed at submit, released at settlement.
    pub hold_tx_id: Option<String>,
    pub results: Vec<SubtaskResultReport>,
}

/// Outcome of recording one subtask result.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub task: Task,
    pub task_status: TaskStatus,
    /// True when this was the task's last outstanding subtask.
    pub task_finished: bool,
    pub hold_tx_id: Option<String>,
}

#[derive(Default)]
struct QueueInner {
    pending: Vec<QueuedSubtask>,
    leases: HashMap<String, Lease>,
    tasks: HashMap<String, TaskRecord>,
}

/// One queue per coordinator; exclusively owns its tasks.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task and its subtasks.
    pub fn submit(&self, task: Task, subtasks: Vec<Subtask>, hold_tx_id: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        for subtask in &subtasks {
            inner.pending.push(QueuedSubtask {
                subtask: subtask.clone(),
                priority: task.priority,
                requires_sandbox: task.requires_sandbox,
                resource_class: task.resource_class,
                task_created_at_ms: task.created_at_ms,
                enqueued_at_ms: now,
            });
        }
        info!(task = %task.task_id, subtasks = subtasks.len(), "task queued");
        inner.tasks.insert(
            task.task_id.clone(),
            TaskRecord {
                total_subtasks: subtasks.len(),
                completed_subtasks: 0,
                status: TaskStatus::Queued,
                hold_tx_id,
                results: Vec::new(),
                task,
            },
        );
    }

    /// Claim the best matching subtask for a worker, or `None` (→ 204).
    pub fn claim(
        &self,
        req: &PullRequest,
        capability: Option<&AgentCapability>,
    ) -> Option<PullResponse> {
        let mut inner = self.inner.lock().unwrap();

        let sandbox_ok = |entry: &QueuedSubtask| {
            if !entry.requires_sandbox {
                return true;
            }
            match capability {
                Some(cap) => cap.sandbox_mode != "none",
                None => false,
            }
        };
        let class_ok =
            |entry: &QueuedSubtask| match entry.resource_class {
                ResourceClass::Cpu => true,
                ResourceClass::Gpu => req.resource_classes.contains(&ResourceClass::Gpu),
            };

        let best = inner
            .pending
            .iter()
            .enumerate()
            .filter(|(_, e)| sandbox_ok(e) && class_ok(e))
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    // FIFO: an older parent task wins, so compare reversed.
                    .then(b.task_created_at_ms.cmp(&a.task_created_at_ms))
                    .then(b.enqueued_at_ms.cmp(&a.enqueued_at_ms))
            })
            .map(|(idx, _)| idx)?;

        let entry = inner.pending.remove(best);
        let expires_at_ms = now_ms() + (entry.subtask.timeout_ms + LEASE_GRACE_MS) as i64;
        let response = PullResponse {
            subtask: entry.subtask.clone(),
            requires_sandbox: entry.requires_sandbox,
            priority: entry.priority,
            lease_expires_at_ms: expires_at_ms,
        };
        debug!(
            subtask = %entry.subtask.subtask_id,
            agent = %req.agent_id,
            "subtask claimed"
        );
        if let Some(record) = inner.tasks.get_mut(&entry.subtask.task_id) {
            if record.status == TaskStatus::Queued {
                record.status = TaskStatus::Claimed;
            }
        }
        inner.leases.insert(
            entry.subtask.subtask_id.clone(),
            Lease {
                entry,
                agent_id: req.agent_id.clone(),
                expires_at_ms,
            },
        );
        Some(response)
    }

    /// Record a subtask result from the leased worker.
    pub fn complete(&self, report: &SubtaskResultReport) -> Result<CompletionOutcome, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        let lease = inner
            .leases
            .remove(&report.subtask_id)
            .ok_or(ApiError::NotFound)?;
        if lease.agent_id != report.agent_id {
            // Someone else's lease; put it back untouched.
            let key = report.subtask_id.clone();
            inner.leases.insert(key, lease);
            return Err(ApiError::SessionOwnerMismatch);
        }

        let task_id = lease.entry.subtask.task_id.clone();
        let record = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(ApiError::NotFound)?;
        record.completed_subtasks += 1;
        record.results.push(report.clone());

        let execution = &report.execution;
        record.status = if execution.escalated {
            TaskStatus::Escalated
        } else if !execution.ok() {
            TaskStatus::Failed
        } else if record.completed_subtasks >= record.total_subtasks {
            TaskStatus::Completed
        } else {
            TaskStatus::Running
        };

        let task_finished = record.completed_subtasks >= record.total_subtasks
            || matches!(record.status, TaskStatus::Failed | TaskStatus::Escalated);

        Ok(CompletionOutcome {
            task: record.task.clone(),
            task_status: record.status,
            task_finished,
            hold_tx_id: record.hold_tx_id.clone(),
        })
    }

    /// Return expired leases to the queue; called by the sweeper.
    pub fn requeue_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let expired: Vec<String> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at_ms <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(lease) = inner.leases.remove(id) {
                warn!(subtask = %id, agent = %lease.agent_id, "lease expired, requeueing");
                let mut entry = lease.entry;
                entry.enqueued_at_ms = now;
                if let Some(record) = inner.tasks.get_mut(&entry.subtask.task_id) {
                    if matches!(record.status, TaskStatus::Claimed | TaskStatus::Running) {
                        record.status = TaskStatus::Queued;
                    }
                }
                inner.pending.push(entry);
            }
        }
        expired.len()
    }

    pub fn mark_status(&self, task_id: &str, status: TaskStatus) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.tasks.get_mut(task_id).ok_or(ApiError::NotFound)?;
        record.status = status;
        Ok(())
    }

    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner.lock().unwrap().tasks.get(task_id).cloned()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn lease_len(&self) -> usize {
        self.inner.lock().unwrap().leases.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
