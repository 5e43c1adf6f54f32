// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Driver for a local Ollama daemon.
//!
//! Uses the native Ollama REST API (`/api/generate`, `/api/tags`,
//! `/api/pull`) with non-streaming responses — the swarm path wants the full
//! text in one piece, not deltas.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{GenerateRequest, GenerateResponse, ModelInfo, ModelProvider, PullProgress};

pub struct OllamaProvider {
    host: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Deserialize)]
struct OllamaTag {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    details: Option<OllamaTagDetails>,
}

#[derive(Deserialize)]
struct OllamaTagDetails {
    #[serde(default)]
    parameter_size: Option<String>,
}

impl OllamaProvider {
    pub fn new(host: String, model: String, request_timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            host: host.trim_end_matches('/').to_string(),
            model,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama-local"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let started = std::time::Instant::now();
        let mut body = json!({
            "model": self.model,
            "prompt": req.prompt,
            "stream": false,
        });
        if let Some(system) = &req.system {
            body["system"] = json!(system);
        }
        let mut options = serde_json::Map::new();
        if let Some(t) = req.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(m) = req.max_tokens {
            options.insert("num_predict".into(), json!(m));
        }
        if !options.is_empty() {
            body["options"] = serde_json::Value::Object(options);
        }

        debug!(model = %self.model, "ollama generate");
        let resp = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .context("sending request to ollama")?
            .error_for_status()
            .context("ollama returned an error status")?;
        let parsed: OllamaGenerateResponse =
            resp.json().await.context("parsing ollama response")?;

        Ok(GenerateResponse {
            text: parsed.response,
            model: if parsed.model.is_empty() {
                self.model.clone()
            } else {
                parsed.model
            },
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .context("querying ollama tags")?
            .error_for_status()?;
        let tags: OllamaTagsResponse = resp.json().await.context("parsing ollama tags")?;
        Ok(tags
            .models
            .into_iter()
            .map(|t| ModelInfo {
                param_size_b: t
                    .details
                    .as_ref()
                    .and_then(|d| d.parameter_size.as_deref())
                    .and_then(parse_param_size),
                name: t.name,
                size_bytes: t.size,
            })
            .collect())
    }

    async fn pull_model(&self, model: &str) -> anyhow::Result<PullProgress> {
        // Non-streaming pull: Ollama blocks until the download completes.
        let resp = self
            .client
            .post(self.url("/api/pull"))
            .json(&json!({"name": model, "stream": false}))
            .send()
            .await
            .context("requesting ollama pull")?;
        if !resp.status().is_success() {
            anyhow::bail!("ollama pull failed with status {}", resp.status());
        }
        Ok(PullProgress {
            model: model.to_string(),
            stage: "done".into(),
            fraction: 1.0,
        })
    }
}

/// Parse Ollama's `parameter_size` strings (`"7.6B"`, `"70B"`, `"134M"`)
/// into billions.
fn parse_param_size(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Some(num) = s.strip_suffix(['B', 'b']) {
        return num.trim().parse().ok();
    }
    if let Some(num) = s.strip_suffix(['M', 'm']) {
        return num.trim().parse::<f64>().ok().map(|v| v / 1000.0);
    }
    s.parse().ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_param_size_billions() {
        assert_eq!(parse_param_size("7.6B"), Some(7.6));
        assert_eq!(parse_param_size("70B"), Some(70.0));
    }

    #[test]
    fn parse_param_size_millions_scaled_down() {
        assert_eq!(parse_param_size("134M"), Some(0.134));
    }

    #[test]
    fn parse_param_size_garbage_is_none() {
        assert_eq!(parse_param_size("large"), None);
    }

    #[test]
    fn host_trailing_slash_is_trimmed() {
        let p = OllamaProvider::new("http://127.0.0.1:11434/".into(), "m".into(), 1_000);
        assert_eq!(p.url("/api/tags"), "http://127.0.0.1:11434/api/tags");
    }
}
