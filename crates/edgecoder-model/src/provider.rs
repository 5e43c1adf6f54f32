// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{GenerateRequest, GenerateResponse, ModelInfo, PullProgress};

/// The narrow capability handed to agents and HTTP handlers.
///
/// Components never hold a provider registry — they receive one
/// `Arc<dyn ModelProvider>` constructed at boot and torn down at shutdown.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Driver name for status display (`"ollama-local"`, `"mock"`, …).
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Run one completion and return the full text.
    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<GenerateResponse>;

    /// List the models available from this provider.
    ///
    /// The default implementation reports only the active model. Override to
    /// perform a live API query.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            name: self.model_name().to_string(),
            param_size_b: None,
            size_bytes: None,
        }])
    }

    /// Start pulling `model` so a later swap can activate it.
    ///
    /// Default implementation reports immediate completion — correct for
    /// providers that have no download step (mock, pre-provisioned servers).
    async fn pull_model(&self, model: &str) -> anyhow::Result<PullProgress> {
        Ok(PullProgress {
            model: model.to_string(),
            stage: "done".into(),
            fraction: 1.0,
        })
    }
}
