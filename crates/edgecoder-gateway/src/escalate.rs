// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Gateway-side escalation: wrap the local model in a senior-assistant
//! framing and extract the improved code from its answer.

use serde::{Deserialize, Serialize};

use edgecoder_model::{extract::extract_code, GenerateRequest, ModelProvider};

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEscalationRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "python".into()
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayEscalationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: String,
    pub improved_code: Option<String>,
    pub raw_response: String,
}

const SENIOR_SYSTEM_PROMPT: &str =
    "You are a senior software engineer. A junior engineer's automated \
     attempt at a task has failed and been escalated to you. Diagnose the \
     problem briefly, then provide a corrected, complete solution in a \
     single fenced code block.";

fn escalation_prompt(req: &GatewayEscalationRequest) -> String {
    format!(
        "Task ({lang}): {prompt}\n\nFailed code:\n{code}\n\nError:\n{error}",
        lang = req.language,
        prompt = req.prompt,
        code = req.code.as_deref().unwrap_or("(none)"),
        error = req.error.as_deref().unwrap_or("(none)"),
    )
}

/// Run the senior-assistant escalation against the local model.
pub async fn escalate(
    model: &dyn ModelProvider,
    req: &GatewayEscalationRequest,
) -> anyhow::Result<GatewayEscalationResponse> {
    let request =
        GenerateRequest::prompt(escalation_prompt(req)).with_system(SENIOR_SYSTEM_PROMPT);
    let response = model.generate(request).await?;
    let improved = {
        let code = extract_code(&response.text);
        // When the whole reply comes back (no fence matched), there is no
        // distinguishable code to hand to the agent.
        if code == response.text.trim() && !response.text.trim_start().starts_with("```") {
            None
        } else {
            Some(code)
        }
    };
    Ok(GatewayEscalationResponse {
        task_id: req.task_id.clone(),
        status: if improved.is_some() {
            "completed".into()
        } else {
            "failed".into()
        },
        improved_code: improved,
        raw_response: response.text,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
