// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// One generation request against the local model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Optional system preamble prepended by drivers that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl GenerateRequest {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            prompt: text.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// The model's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    /// Model that actually served the request (may differ after a swap).
    pub model: String,
    pub duration_ms: u64,
}

/// An entry in the provider's model list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// Approximate parameter count in billions, when the provider reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_size_b: Option<f64>,
    /// On-disk size in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Progress of an in-flight model pull (download).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullProgress {
    pub model: String,
    /// Free-text stage, e.g. `"downloading"`, `"verifying"`, `"done"`.
    pub stage: String,
    /// 0.0 – 1.0 when the provider reports sizes.
    pub fraction: f64,
}
