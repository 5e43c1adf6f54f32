// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Driver for the `edgecoder-local` inference server — any OpenAI-compatible
//! endpoint running on the loopback (llama.cpp server, vLLM, LM Studio).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{GenerateRequest, GenerateResponse, ModelInfo, ModelProvider};

pub struct LocalCompatProvider {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    data: Vec<ModelListEntry>,
}

#[derive(Deserialize)]
struct ModelListEntry {
    id: String,
}

impl LocalCompatProvider {
    pub fn new(base_url: String, model: String, request_timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client,
        }
    }
}

#[async_trait]
impl ModelProvider for LocalCompatProvider {
    fn name(&self) -> &str {
        "edgecoder-local"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let started = std::time::Instant::now();
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &req.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": req.prompt}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(m) = req.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await
            .context("sending request to local inference server")?
            .error_for_status()
            .context("local inference server returned an error status")?;
        let parsed: ChatCompletionResponse =
            resp.json().await.context("parsing chat completion")?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        Ok(GenerateResponse {
            text,
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
            .get(format!("{}/models", self.base_url))
            .send()
            .await
            .context("querying local model list")?
            .error_for_status()?;
        let parsed: ModelListResponse = resp.json().await.context("parsing model list")?;
        Ok(parsed
            .data
            .into_iter()
            .map(|e| ModelInfo {
                name: e.id,
                param_size_b: None,
                size_bytes: None,
            })
            .collect())
    }
}
