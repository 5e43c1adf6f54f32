// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The sandbox executor: policy resolution, subset validation, dispatch.
//!
//! Mode resolution picks the strongest mode that both the policy allows and
//! the host provides. `vm` currently maps to the hardened host path (rlimits
//! + session isolation + optional `sandbox-exec`); hosts with a microVM
//! runtime advertise `docker` alongside it in practice.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::subset::validate_python;
use crate::types::{Language, QueueReason, RunResult, SandboxMode, SandboxPolicy};
use crate::{docker, host};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SandboxError {
    /// The policy requires isolation but resolution landed on `none`.
    #[error("sandbox_required")]
    Required,
    /// None of the policy's allowed modes is available on this host.
    #[error("sandbox_unavailable")]
    Unavailable,
}

/// Executes generated code under the node's isolation capabilities.
///
/// One executor per process, constructed at boot; concurrency is capped by a
/// semaphore sized to `max_concurrent_tasks`.
pub struct SandboxExecutor {
    /// Strongest isolation this host provides.
    host_mode: SandboxMode,
    permits: Arc<Semaphore>,
}

impl SandboxExecutor {
    pub fn new(host_mode: SandboxMode, max_concurrent: usize) -> Self {
        Self {
            host_mode,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn host_mode(&self) -> SandboxMode {
        self.host_mode
    }

    /// Pick the execution mode for `policy`, or fail when the policy cannot
    /// be satisfied.
    pub fn resolve_mode(&self, policy: &SandboxPolicy) -> Result<SandboxMode, SandboxError> {
        let best = policy
            .allowed_modes
            .iter()
            .copied()
            .filter(|m| *m <= self.host_mode)
            .max();
        match best {
            Some(SandboxMode::None) | None if policy.required => {
                if policy.allowed_modes.iter().any(|m| *m > self.host_mode) {
                    Err(SandboxError::Unavailable)
                } else {
                    Err(SandboxError::Required)
                }
            }
            Some(mode) => Ok(mode),
            None => Ok(SandboxMode::None),
        }
    }

    /// Validate and run `code`.
    ///
    /// Python passes subset validation first; violations produce a queued
    /// [`RunResult`] **without any execution**. Mode-resolution failures are
    /// returned as [`SandboxError`] so callers can map them to the
    /// `sandbox_required` / `sandbox_unavailable` error kinds.
    pub async fn run(
        &self,
        language: Language,
        code: &str,
        policy: &SandboxPolicy,
    ) -> Result<RunResult, SandboxError> {
        let mode = self.resolve_mode(policy)?;

        if language == Language::Python {
            if let Err(violation) = validate_python(code) {
                debug!(%violation, "python subset violation");
                return Ok(RunResult::queued(
                    language,
                    QueueReason::OutsideSubset,
                    violation.to_string(),
                ));
            }
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .expect("sandbox semaphore is never closed");

        let mut policy = policy.clone();
        policy.timeout_ms = policy.timeout_ms.clamp(5_000, 60_000);

        let result = match mode {
            SandboxMode::Docker => docker::run(language, code, &policy).await,
            SandboxMode::Vm | SandboxMode::None => host::run(language, code, &policy).await,
        };

        if !result.ok {
            warn!(
                exit_code = result.exit_code,
                queue_for_cloud = result.queue_for_cloud,
                "sandbox run failed"
            );
        }
        Ok(result)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(modes: &[SandboxMode], required: bool) -> SandboxPolicy {
        SandboxPolicy {
            allowed_modes: modes.to_vec(),
            required,
            ..SandboxPolicy::default()
        }
    }

    #[test]
    fn resolution_picks_strongest_available_mode() {
        let ex = SandboxExecutor::new(SandboxMode::Docker, 1);
        let p = policy(&[SandboxMode::None, SandboxMode::Vm, SandboxMode::Docker], false);
        assert_eq!(ex.resolve_mode(&p), Ok(SandboxMode::Docker));
    }

    #[test]
    fn resolution_caps_at_host_capability() {
        let ex = SandboxExecutor::new(SandboxMode::Vm, 1);
        let p = policy(&[SandboxMode::None, SandboxMode::Vm, SandboxMode::Docker], false);
        assert_eq!(ex.resolve_mode(&p), Ok(SandboxMode::Vm));
    }

    #[test]
    fn required_policy_on_bare_host_is_sandbox_required() {
        let ex = SandboxExecutor::new(SandboxMode::None, 1);
        let p = policy(&[SandboxMode::None], true);
        assert_eq!(ex.resolve_mode(&p), Err(SandboxError::Required));
    }

    #[test]
    fn required_docker_only_policy_on_bare_host_is_unavailable() {
        let ex = SandboxExecutor::new(SandboxMode::None, 1);
        let p = policy(&[SandboxMode::Docker], true);
        assert_eq!(ex.resolve_mode(&p), Err(SandboxError::Unavailable));
    }

    #[test]
    fn unsatisfiable_but_optional_policy_falls_back_to_host() {
        let ex = SandboxExecutor::new(SandboxMode::None, 1);
        let p = policy(&[SandboxMode::Docker], false);
        assert_eq!(ex.resolve_mode(&p), Ok(SandboxMode::None));
    }

    #[tokio::test]
    async fn python_subset_violation_short_circuits_without_execution() {
        let ex = SandboxExecutor::new(SandboxMode::None, 1);
        let p = policy(&[SandboxMode::None], false);
        let result = ex
            .run(Language::Python, "import os\nos.system('rm -rf /')", &p)
            .await
            .unwrap();
        assert!(!result.ok);
        assert!(result.queue_for_cloud);
        assert_eq!(result.queue_reason, Some(QueueReason::OutsideSubset));
        assert_eq!(result.duration_ms, 0, "nothing may have executed");
    }

    #[tokio::test]
    async fn required_policy_error_prevents_subset_scan_and_execution() {
        let ex = SandboxExecutor::new(SandboxMode::None, 1);
        let p = policy(&[SandboxMode::None], true);
        let err = ex
            .run(Language::Python, "print('hi')", &p)
            .await
            .unwrap_err();
        assert_eq!(err, SandboxError::Required);
    }
}
