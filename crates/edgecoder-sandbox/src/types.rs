// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Exit code reported when a run hits its wall-clock timeout, matching the
/// coreutils `timeout` convention.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Isolation level, ordered by strength: `none < vm < docker`.
///
/// The derived `Ord` follows variant order, so `SandboxMode::None <
/// SandboxMode::Vm < SandboxMode::Docker` holds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    #[default]
    None,
    Vm,
    Docker,
}

impl SandboxMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "vm" => Some(Self::Vm),
            "docker" => Some(Self::Docker),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Vm => "vm",
            Self::Docker => "docker",
        }
    }
}

/// Languages the mesh executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
}

impl Language {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "py" => Some(Self::Python),
            "javascript" | "js" => Some(Self::Javascript),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
        }
    }
}

/// Why a run wants cloud assistance instead of another local iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    OutsideSubset,
    Timeout,
    ModelLimit,
    Manual,
}

/// Per-run isolation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Modes acceptable for this run, strongest wins.
    pub allowed_modes: Vec<SandboxMode>,
    /// When true, resolving to [`SandboxMode::None`] is an error rather than
    /// a bare-host run.
    pub required: bool,
    #[serde(default)]
    pub allow_network: bool,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub pids_limit: u32,
    pub timeout_ms: u64,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allowed_modes: vec![SandboxMode::Docker, SandboxMode::Vm, SandboxMode::None],
            required: false,
            allow_network: false,
            memory_mb: 256,
            cpu_cores: 0.5,
            pids_limit: 50,
            timeout_ms: 30_000,
        }
    }
}

/// Outcome of one sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub language: Language,
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub queue_for_cloud: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_reason: Option<QueueReason>,
}

impl RunResult {
    /// A run rejected before execution (subset violation, manual queue…).
    pub fn queued(language: Language, reason: QueueReason, diagnostic: impl Into<String>) -> Self {
        Self {
            language,
            ok: false,
            stdout: String::new(),
            stderr: diagnostic.into(),
            exit_code: -1,
            duration_ms: 0,
            queue_for_cloud: true,
            queue_reason: Some(reason),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_modes_are_strictly_ordered() {
        assert!(SandboxMode::None < SandboxMode::Vm);
        assert!(SandboxMode::Vm < SandboxMode::Docker);
    }

    #[test]
    fn mode_parse_round_trip() {
        for mode in [SandboxMode::None, SandboxMode::Vm, SandboxMode::Docker] {
            assert_eq!(SandboxMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(SandboxMode::parse("podman"), None);
    }

    #[test]
    fn language_parse_accepts_aliases() {
        assert_eq!(Language::parse("py"), Some(Language::Python));
        assert_eq!(Language::parse("JS"), Some(Language::Javascript));
        assert_eq!(Language::parse("rust"), None);
    }

    #[test]
    fn queue_reason_serialises_snake_case() {
        let json = serde_json::to_string(&QueueReason::OutsideSubset).unwrap();
        assert_eq!(json, "\"outside_subset\"");
    }

    #[test]
    fn queued_result_is_not_ok_and_flags_cloud() {
        let r = RunResult::queued(Language::Python, QueueReason::OutsideSubset, "import os");
        assert!(!r.ok);
        assert!(r.queue_for_cloud);
        assert_eq!(r.queue_reason, Some(QueueReason::OutsideSubset));
        assert!(r.stdout.is_empty(), "nothing may have executed");
    }
}
