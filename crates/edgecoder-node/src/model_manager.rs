// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model swap bookkeeping for the coordinator's `/model/*` endpoints.
//!
//! A swap is asynchronous: the pull runs in a spawned task while
//! `swap_in_progress` is advertised through heartbeats so the scheduler
//! stops routing work at the node until the new model is active.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use edgecoder_model::{ModelProvider, PullProgress};

pub struct ModelManager {
    provider: Arc<dyn ModelProvider>,
    active_model: Mutex<String>,
    swap_in_progress: AtomicBool,
    pull_progress: Mutex<PullProgress>,
}

impl ModelManager {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        let active = provider.model_name().to_string();
        Self {
            provider,
            active_model: Mutex::new(active),
            swap_in_progress: AtomicBool::new(false),
            pull_progress: Mutex::new(PullProgress::default()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    pub fn active_model(&self) -> String {
        self.active_model.lock().unwrap().clone()
    }

    pub fn swap_in_progress(&self) -> bool {
        self.swap_in_progress.load(Ordering::SeqCst)
    }

    pub fn pull_progress(&self) -> PullProgress {
        self.pull_progress.lock().unwrap().clone()
    }

    /// Begin swapping to `model`. Returns false when a swap is already
    /// running (the caller maps that to a conflict).
    pub fn begin_swap(self: &Arc<Self>, model: String) -> bool {
        if self
            .swap_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.pull_progress.lock().unwrap() = PullProgress {
            model: model.clone(),
            stage: "downloading".into(),
            fraction: 0.0,
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match manager.provider.pull_model(&model).await {
                Ok(progress) => {
                    *manager.pull_progress.lock().unwrap() = progress;
                    *manager.active_model.lock().unwrap() = model.clone();
                    info!(%model, "model swap complete");
                }
                Err(e) => {
                    error!(%model, "model pull failed: {e}");
                    *manager.pull_progress.lock().unwrap() = PullProgress {
                        model: model.clone(),
                        stage: format!("failed: {e}"),
                        fraction: 0.0,
                    };
                }
            }
            manager.swap_in_progress.store(false, Ordering::SeqCst);
        });
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use edgecoder_model::MockProvider;

    #[tokio::test]
    async fn swap_updates_active_model_when_pull_completes() {
        let manager = Arc::new(ModelManager::new(Arc::new(MockProvider)));
        assert_eq!(manager.active_model(), "mock-model");
        assert!(manager.begin_swap("other-model".into()));
        // The mock pull completes immediately; wait for the spawned task.
        for _ in 0..50 {
            if !manager.swap_in_progress() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(manager.active_model(), "other-model");
        assert_eq!(manager.pull_progress().stage, "done");
    }

    #[tokio::test]
    async fn concurrent_swap_is_rejected() {
        let manager = Arc::new(ModelManager::new(Arc::new(MockProvider)));
        manager.swap_in_progress.store(true, Ordering::SeqCst);
        assert!(!manager.begin_swap("x".into()));
    }
}
