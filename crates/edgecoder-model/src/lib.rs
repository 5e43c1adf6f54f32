// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod extract;
pub mod sanitize;
mod local;
mod mock;
mod ollama;
mod provider;
mod types;

pub use local::LocalCompatProvider;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use ollama::OllamaProvider;
pub use provider::ModelProvider;
pub use types::*;

use anyhow::bail;
use edgecoder_config::ModelConfig;

/// Construct a boxed [`ModelProvider`] from configuration.
///
/// Selects the driver implementation based on `cfg.provider`:
/// `"ollama-local"`, `"edgecoder-local"` (OpenAI-compatible local server) or
/// `"mock"` (deterministic, for tests and CI).
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "ollama-local" => Ok(Box::new(OllamaProvider::new(
            cfg.ollama_host.clone(),
            cfg.name.clone(),
            cfg.request_timeout_ms,
        ))),
        "edgecoder-local" => {
            let base = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:4305/v1".into());
            Ok(Box::new(LocalCompatProvider::new(
                base,
                cfg.name.clone(),
                cfg.request_timeout_ms,
            )))
        }
        "mock" => Ok(Box::new(MockProvider)),
        other => {
            bail!(
                "unknown model provider: {other:?}\n\
                 Recognised providers: ollama-local, edgecoder-local, mock"
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn from_config_ollama_succeeds() {
        assert!(from_config(&minimal_config("ollama-local")).is_ok());
    }

    #[test]
    fn from_config_local_compat_succeeds() {
        assert!(from_config(&minimal_config("edgecoder-local")).is_ok());
    }

    #[test]
    fn from_config_mock_succeeds() {
        assert!(from_config(&minimal_config("mock")).is_ok());
    }

    #[test]
    fn from_config_unknown_provider_returns_error() {
        let result = from_config(&minimal_config("totally_unknown_xyz"));
        assert!(result.is_err());
        assert!(result
            .err()
            .unwrap()
            .to_string()
            .contains("unknown model provider"));
    }
}
