// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod auth;
pub mod error;
pub mod escalate;
pub mod handshake;
pub mod http;
pub mod model_manager;
pub mod node;
pub mod outbound;
pub mod queue;
pub mod state;
pub mod types;
pub mod worker;

pub use error::ApiError;
pub use state::AppState;
