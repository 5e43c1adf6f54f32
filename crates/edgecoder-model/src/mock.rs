// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{GenerateRequest, GenerateResponse, ModelProvider};

/// Deterministic mock provider for tests. Replies with a fenced Python
/// `print` of the prompt's first line, which passes subset validation and
/// executes successfully.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let first_line = req.prompt.lines().next().unwrap_or("").trim();
        let text = format!("```python\nprint({first_line:?})\n```");
        Ok(GenerateResponse {
            text,
            model: "mock-model".into(),
            duration_ms: 0,
        })
    }
}

/// A pre-scripted mock provider. Each call to `generate` pops the next
/// response from the front of the queue; when exhausted, the last script is
/// repeated. Lets tests drive the agent loop through exact
/// generate/reflect sequences without network access.
pub struct ScriptedMockProvider {
    scripts: Mutex<Vec<String>>,
    /// The last prompt seen, for assertions on prompt construction.
    pub last_prompt: Mutex<Option<String>>,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<String>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_prompt: Mutex::new(None),
        }
    }

    /// Convenience: provider that always returns the same text.
    pub fn always(reply: impl Into<String>) -> Self {
        Self::new(vec![reply.into()])
    }
}

#[async_trait]
impl ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<GenerateResponse> {
        *self.last_prompt.lock().unwrap() = Some(req.prompt);
        let text = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.len() > 1 {
                scripts.remove(0)
            } else {
                scripts.first().cloned().unwrap_or_default()
            }
        };
        Ok(GenerateResponse {
            text,
            model: "scripted-mock-model".into(),
            duration_ms: 0,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
