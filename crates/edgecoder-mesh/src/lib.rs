// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod capability;
pub mod chunk;
pub mod gossip;
pub mod roster;
mod types;

pub use capability::CapabilityIndex;
pub use gossip::{broadcast, BroadcastOutcome, GossipError, GossipMessage, GossipPayload, GossipState};
pub use roster::PeerRoster;
pub use types::{AgentCapability, CapabilitySummary, ModelCapability, NetworkMode, PeerRecord};
