// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

/// Which subsystems this process runs.
///
/// Every node ships the same binary; the mode selects the subset of
/// subsystems started at boot. `all-in-one` is the default for single-machine
/// deployments and runs coordinator, worker, inference gateway and IDE
/// provider in one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeMode {
    Worker,
    Coordinator,
    ControlPlane,
    Inference,
    IdeProvider,
    #[default]
    AllInOne,
}

impl RuntimeMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "worker" => Some(Self::Worker),
            "coordinator" => Some(Self::Coordinator),
            "control-plane" => Some(Self::ControlPlane),
            "inference" => Some(Self::Inference),
            "ide-provider" => Some(Self::IdeProvider),
            "all-in-one" => Some(Self::AllInOne),
            _ => None,
        }
    }

    /// True when this mode serves the coordinator HTTP API.
    pub fn runs_coordinator(self) -> bool {
        matches!(self, Self::Coordinator | Self::ControlPlane | Self::AllInOne)
    }

    pub fn runs_worker(self) -> bool {
        matches!(self, Self::Worker | Self::AllInOne)
    }

    pub fn runs_inference(self) -> bool {
        matches!(self, Self::Inference | Self::AllInOne)
    }

    pub fn runs_ide_provider(self) -> bool {
        matches!(self, Self::IdeProvider | Self::AllInOne)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Identity and runtime mode of this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable agent identifier. Generated (and persisted next to the keypair)
    /// when absent.
    pub agent_id: Option<String>,
    /// Reported operating system (`linux`, `darwin`, `windows`).
    pub agent_os: Option<String>,
    /// `swarm-only` or `ide-enabled`.
    #[serde(default = "default_agent_mode")]
    pub agent_mode: String,
    /// Token presented on `POST /mesh/register`.
    pub registration_token: Option<String>,
    #[serde(default)]
    pub runtime_mode: RuntimeMode,
    /// Ed25519 keypair file. Created with mode 0o600 on first boot.
    pub keypair_file: Option<String>,
    /// JSON roster of trusted peer public keys.
    pub trusted_keys_file: Option<String>,
    /// Coordinator HTTP bind address.
    #[serde(default = "default_coordinator_bind")]
    pub coordinator_bind: String,
    /// Inference gateway bind address.
    #[serde(default = "default_inference_bind")]
    pub inference_bind: String,
    /// IDE provider bind address.
    #[serde(default = "default_ide_bind")]
    pub ide_bind: String,
}

fn default_agent_mode() -> String {
    "swarm-only".into()
}
fn default_coordinator_bind() -> String {
    "0.0.0.0:4301".into()
}
fn default_inference_bind() -> String {
    "0.0.0.0:4302".into()
}
fn default_ide_bind() -> String {
    "0.0.0.0:4304".into()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            agent_os: None,
            agent_mode: default_agent_mode(),
            registration_token: None,
            runtime_mode: RuntimeMode::default(),
            keypair_file: None,
            trusted_keys_file: None,
            coordinator_bind: default_coordinator_bind(),
            inference_bind: default_inference_bind(),
            ide_bind: default_ide_bind(),
        }
    }
}

/// Mesh membership and gossip settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Coordinator this worker pulls from (and gossips to).
    pub coordinator_url: Option<String>,
    /// Static bearer token for unsigned (browser/portal) calls.
    pub auth_token: Option<String>,
    /// Minimum time between unsolicited offers to the same peer.
    #[serde(default = "default_peer_offer_cooldown_ms")]
    pub peer_offer_cooldown_ms: u64,
    /// Peers not heard from for this long are evicted from the roster.
    #[serde(default = "default_peer_stale_ms")]
    pub peer_stale_ms: u64,
    /// Interval between capability-summary broadcasts.
    #[serde(default = "default_capability_interval_ms")]
    pub capability_broadcast_interval_ms: u64,
}

fn default_peer_offer_cooldown_ms() -> u64 {
    30_000
}
fn default_peer_stale_ms() -> u64 {
    300_000
}
fn default_capability_interval_ms() -> u64 {
    60_000
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            coordinator_url: None,
            auth_token: None,
            peer_offer_cooldown_ms: default_peer_offer_cooldown_ms(),
            peer_stale_ms: default_peer_stale_ms(),
            capability_broadcast_interval_ms: default_capability_interval_ms(),
        }
    }
}

/// Local model backend selection.
///
/// `provider` is `"ollama-local"` (talks to an Ollama daemon),
/// `"edgecoder-local"` (an OpenAI-compatible local server) or `"mock"`
/// (deterministic, for tests and CI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_provider")]
    pub provider: String,
    /// Model name forwarded to the provider.
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Ollama daemon address.
    #[serde(default = "default_ollama_host")]
    pub ollama_host: String,
    /// Base URL for the `edgecoder-local` OpenAI-compatible server.
    pub base_url: Option<String>,
    /// Approximate parameter count of the active model, in billions.
    /// Reported in capability summaries and used for escrow estimates.
    #[serde(default = "default_param_size")]
    pub param_size_b: f64,
    /// Per-request timeout for generation calls.
    #[serde(default = "default_model_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_model_provider() -> String {
    "ollama-local".into()
}
fn default_model_name() -> String {
    "qwen2.5-coder:7b".into()
}
fn default_ollama_host() -> String {
    "http://127.0.0.1:11434".into()
}
fn default_param_size() -> f64 {
    7.0
}
fn default_model_timeout_ms() -> u64 {
    120_000
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_model_provider(),
            name: default_model_name(),
            ollama_host: default_ollama_host(),
            base_url: None,
            param_size_b: default_param_size(),
            request_timeout_ms: default_model_timeout_ms(),
        }
    }
}

/// Sandbox isolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Strongest isolation this host can provide: `none`, `vm` or `docker`.
    #[serde(default = "default_sandbox_mode")]
    pub mode: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    /// Grant outbound network to sandboxed code. Off unless a policy
    /// explicitly needs it.
    #[serde(default)]
    pub allow_network: bool,
    /// macOS only: apply a `sandbox-exec` profile in host mode.
    #[serde(default = "default_true")]
    pub use_sandbox_exec: bool,
}

fn default_sandbox_mode() -> String {
    "docker".into()
}
fn default_memory_mb() -> u64 {
    256
}
fn default_cpu_cores() -> f64 {
    0.5
}
fn default_pids_limit() -> u32 {
    50
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: default_sandbox_mode(),
            memory_mb: default_memory_mb(),
            cpu_cores: default_cpu_cores(),
            pids_limit: default_pids_limit(),
            allow_network: false,
            use_sandbox_exec: true,
        }
    }
}

/// Credit engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreditsConfig {
    /// Append-only JSONL ledger file. In-memory only when unset.
    pub ledger_file: Option<String>,
}

/// Escalation waterfall settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    pub parent_coordinator_url: Option<String>,
    pub cloud_inference_url: Option<String>,
    #[serde(default = "default_escalation_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_escalation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_escalation_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Where resolved escalations are POSTed back to (best effort).
    pub callback_url: Option<String>,
}

fn default_escalation_timeout_ms() -> u64 {
    30_000
}
fn default_escalation_retries() -> u32 {
    2
}
fn default_escalation_base_delay_ms() -> u64 {
    1_000
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            parent_coordinator_url: None,
            cloud_inference_url: None,
            timeout_ms: default_escalation_timeout_ms(),
            max_retries: default_escalation_retries(),
            retry_base_delay_ms: default_escalation_base_delay_ms(),
            callback_url: None,
        }
    }
}

/// Inference-gateway authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Static token required on gateway calls. Open when unset.
    pub auth_token: Option<String>,
    /// Require full signed-request headers from coordinators.
    #[serde(default)]
    pub require_signed_coordinator_requests: bool,
    #[serde(default = "default_max_skew_ms")]
    pub max_signature_skew_ms: u64,
    #[serde(default = "default_nonce_ttl_ms")]
    pub nonce_ttl_ms: u64,
}

fn default_max_skew_ms() -> u64 {
    30_000
}
fn default_nonce_ttl_ms() -> u64 {
    300_000
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            require_signed_coordinator_requests: false,
            max_signature_skew_ms: default_max_skew_ms(),
            nonce_ttl_ms: default_nonce_ttl_ms(),
        }
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Delay between pull attempts when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_concurrent() -> usize {
    1
}
fn default_poll_interval_ms() -> u64 {
    2_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

// ── Environment overlay ───────────────────────────────────────────────────────

impl Config {
    /// Apply recognised environment variables on top of the file-derived
    /// config. Env always wins; unset variables leave the field untouched.
    pub fn apply_env(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(v) = var("EDGE_RUNTIME_MODE") {
            if let Some(mode) = RuntimeMode::parse(&v) {
                self.node.runtime_mode = mode;
            } else {
                tracing::warn!(value = %v, "unrecognised EDGE_RUNTIME_MODE ignored");
            }
        }
        if let Some(v) = var("AGENT_ID") {
            self.node.agent_id = Some(v);
        }
        if let Some(v) = var("AGENT_OS") {
            self.node.agent_os = Some(v);
        }
        if let Some(v) = var("AGENT_MODE") {
            self.node.agent_mode = v;
        }
        if let Some(v) = var("AGENT_REGISTRATION_TOKEN") {
            self.node.registration_token = Some(v);
        }
        if let Some(v) = var("COORDINATOR_URL") {
            self.mesh.coordinator_url = Some(v);
        }
        if let Some(v) = var("MESH_AUTH_TOKEN") {
            self.mesh.auth_token = Some(v);
        }
        if let Some(v) = var("LOCAL_MODEL_PROVIDER") {
            self.model.provider = v;
        }
        if let Some(v) = var("OLLAMA_MODEL") {
            self.model.name = v;
        }
        if let Some(v) = var("OLLAMA_HOST") {
            self.model.ollama_host = v;
        }
        if let Some(v) = var("MAX_CONCURRENT_TASKS").and_then(|v| v.parse().ok()) {
            self.worker.max_concurrent_tasks = v;
        }
        if let Some(v) = var("PEER_OFFER_COOLDOWN_MS").and_then(|v| v.parse().ok()) {
            self.mesh.peer_offer_cooldown_ms = v;
        }
        if let Some(v) = var("INFERENCE_AUTH_TOKEN") {
            self.inference.auth_token = Some(v);
        }
        if let Some(v) = var("INFERENCE_REQUIRE_SIGNED_COORDINATOR_REQUESTS") {
            self.inference.require_signed_coordinator_requests =
                matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = var("INFERENCE_MAX_SIGNATURE_SKEW_MS").and_then(|v| v.parse().ok()) {
            self.inference.max_signature_skew_ms = v;
        }
        if let Some(v) = var("INFERENCE_NONCE_TTL_MS").and_then(|v| v.parse().ok()) {
            self.inference.nonce_ttl_ms = v;
        }
        if let Some(v) = var("PARENT_COORDINATOR_URL") {
            self.escalation.parent_coordinator_url = Some(v);
        }
        if let Some(v) = var("CLOUD_INFERENCE_URL") {
            self.escalation.cloud_inference_url = Some(v);
        }
        if let Some(v) = var("ESCALATION_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.escalation.timeout_ms = v;
        }
        if let Some(v) = var("ESCALATION_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.escalation.max_retries = v;
        }
        if let Some(v) = var("ESCALATION_RETRY_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.escalation.retry_base_delay_ms = v;
        }
        if let Some(v) = var("ESCALATION_CALLBACK_URL") {
            self.escalation.callback_url = Some(v);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runtime_mode_is_all_in_one() {
        let cfg = Config::default();
        assert_eq!(cfg.node.runtime_mode, RuntimeMode::AllInOne);
    }

    #[test]
    fn runtime_mode_parse_round_trip() {
        for s in [
            "worker",
            "coordinator",
            "control-plane",
            "inference",
            "ide-provider",
            "all-in-one",
        ] {
            assert!(RuntimeMode::parse(s).is_some(), "mode {s} must parse");
        }
        assert!(RuntimeMode::parse("bogus").is_none());
    }

    #[test]
    fn all_in_one_runs_everything() {
        let m = RuntimeMode::AllInOne;
        assert!(m.runs_coordinator());
        assert!(m.runs_worker());
        assert!(m.runs_inference());
        assert!(m.runs_ide_provider());
    }

    #[test]
    fn worker_mode_runs_only_worker() {
        let m = RuntimeMode::Worker;
        assert!(m.runs_worker());
        assert!(!m.runs_coordinator());
        assert!(!m.runs_inference());
    }

    #[test]
    fn default_binds_match_component_ports() {
        let cfg = NodeConfig::default();
        assert!(cfg.coordinator_bind.ends_with(":4301"));
        assert!(cfg.inference_bind.ends_with(":4302"));
        assert!(cfg.ide_bind.ends_with(":4304"));
    }

    #[test]
    fn default_sandbox_caps_match_spec_defaults() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.memory_mb, 256);
        assert_eq!(cfg.cpu_cores, 0.5);
        assert_eq!(cfg.pids_limit, 50);
        assert!(!cfg.allow_network);
    }

    #[test]
    fn default_escalation_backoff_values() {
        let cfg = EscalationConfig::default();
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.retry_base_delay_ms, 1_000);
        assert_eq!(cfg.timeout_ms, 30_000);
    }

    #[test]
    fn env_overlay_sets_runtime_mode_and_urls() {
        // Env vars are process-global; use names only this test sets.
        std::env::set_var("EDGE_RUNTIME_MODE", "coordinator");
        std::env::set_var("COORDINATOR_URL", "http://10.0.0.2:4301");
        std::env::set_var("MAX_CONCURRENT_TASKS", "3");
        let mut cfg = Config::default();
        cfg.apply_env();
        assert_eq!(cfg.node.runtime_mode, RuntimeMode::Coordinator);
        assert_eq!(cfg.mesh.coordinator_url.as_deref(), Some("http://10.0.0.2:4301"));
        assert_eq!(cfg.worker.max_concurrent_tasks, 3);
        std::env::remove_var("EDGE_RUNTIME_MODE");
        std::env::remove_var("COORDINATOR_URL");
        std::env::remove_var("MAX_CONCURRENT_TASKS");
    }

    #[test]
    fn env_overlay_ignores_bad_numeric_values() {
        std::env::set_var("ESCALATION_MAX_RETRIES", "not-a-number");
        let mut cfg = Config::default();
        cfg.apply_env();
        assert_eq!(cfg.escalation.max_retries, 2, "bad value must leave the default");
        std::env::remove_var("ESCALATION_MAX_RETRIES");
    }
}
