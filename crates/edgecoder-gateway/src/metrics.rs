// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Plain-text counters for `GET /metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub decompose_total: AtomicU64,
    pub escalate_total: AtomicU64,
    pub chat_completions_total: AtomicU64,
    pub failures_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render in Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, counter) in [
            ("edgecoder_gateway_requests_total", &self.requests_total),
            ("edgecoder_gateway_decompose_total", &self.decompose_total),
            ("edgecoder_gateway_escalate_total", &self.escalate_total),
            (
                "edgecoder_gateway_chat_completions_total",
                &self.chat_completions_total,
            ),
            ("edgecoder_gateway_failures_total", &self.failures_total),
        ] {
            out.push_str(&format!(
                "# TYPE {name} counter\n{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
