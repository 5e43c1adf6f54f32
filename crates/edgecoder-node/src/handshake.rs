// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Handshake sessions: the multi-phase record coordinating a cloud-assisted
//! recovery for a task outside the local model's capability.
//!
//! Phases advance `handshake → negotiate → execute → result`; any step may
//! move to `failed` or `expired` instead. Cloud execution is spawned
//! asynchronously on the transition to `execute`, and completion only lands
//! on sessions *still in* `execute` — a session expired by the sweeper while
//! the cloud call was in flight stays expired.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use edgecoder_crypto::now_ms;

use crate::error::ApiError;

/// Maximum concurrently active (non-terminal) sessions per agent.
pub const MAX_SESSIONS_PER_AGENT: usize = 5;

/// Sessions stuck in a non-terminal phase longer than this are expired.
pub const SESSION_MAX_AGE_MS: i64 = 5 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakePhase {
    Handshake,
    Negotiate,
    Execute,
    Result,
    Expired,
    Failed,
}

impl HandshakePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Result | Self::Expired | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Negotiate => "negotiate",
            Self::Execute => "execute",
            Self::Result => "result",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }
}

/// The task payload a session carries up to the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeTask {
    pub task_id: String,
    pub prompt: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeSession {
    pub session_id: String,
    pub agent_id: String,
    pub phase: HandshakePhase,
    pub task: HandshakeTask,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub queue_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_response: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// In-memory session store with a per-agent cap and a staleness sweeper.
#[derive(Default)]
pub struct HandshakeStore {
    sessions: Mutex<HashMap<String, HandshakeSession>>,
}

impl HandshakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session in `handshake` phase (`POST /review`).
    pub fn open(
        &self,
        agent_id: &str,
        task: HandshakeTask,
        snippet: Option<String>,
        error: Option<String>,
        queue_reason: &str,
    ) -> Result<HandshakeSession, ApiError> {
        let mut sessions = self.sessions.lock().unwrap();
        let active = sessions
            .values()
            .filter(|s| s.agent_id == agent_id && !s.phase.is_terminal())
            .count();
        if active >= MAX_SESSIONS_PER_AGENT {
            return Err(ApiError::TooManySessions);
        }
        let now = now_ms();
        let session = HandshakeSession {
            session_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            phase: HandshakePhase::Handshake,
            task,
            snippet,
            error,
            queue_reason: queue_reason.to_string(),
            cloud_response: None,
            created_at_ms: now,
            updated_at_ms: now,
            failure_reason: None,
        };
        info!(session = %session.session_id, agent = %agent_id, "handshake opened");
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    /// Negotiate (`POST /negotiate`): accept moves the session to `execute`
    /// (the caller then spawns the cloud run); decline fails it.
    pub fn negotiate(
        &self,
        session_id: &str,
        agent_id: &str,
        accept: bool,
    ) -> Result<HandshakeSession, ApiError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(session_id).ok_or(ApiError::NotFound)?;
        if session.agent_id != agent_id {
            return Err(ApiError::SessionOwnerMismatch);
        }
        if session.phase != HandshakePhase::Handshake {
            return Err(ApiError::InvalidPhaseTransition {
                from: session.phase.as_str().into(),
                to: if accept { "execute" } else { "failed" }.into(),
            });
        }
        session.phase = if accept {
            HandshakePhase::Execute
        } else {
            session.failure_reason = Some("declined at negotiation".into());
            HandshakePhase::Failed
        };
        session.updated_at_ms = now_ms();
        Ok(session.clone())
    }

    /// Land a cloud response. Only sessions still in `execute` move to
    /// `result`; anything else (raced expiry, failure) is left untouched.
    pub fn complete_execution(&self, session_id: &str, cloud_response: String) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(session_id) {
            Some(session) if session.phase == HandshakePhase::Execute => {
                session.cloud_response = Some(cloud_response);
                session.phase = HandshakePhase::Result;
                session.updated_at_ms = now_ms();
                true
            }
            Some(session) => {
                warn!(
                    session = %session_id,
                    phase = session.phase.as_str(),
                    "cloud result arrived for a session no longer executing"
                );
                false
            }
            None => false,
        }
    }

    /// Mark a session failed with a reason.
    pub fn fail(&self, session_id: &str, reason: &str) -> Result<(), ApiError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(session_id).ok_or(ApiError::NotFound)?;
        if session.phase.is_terminal() {
            return Err(ApiError::InvalidPhaseTransition {
                from: session.phase.as_str().into(),
                to: "failed".into(),
            });
        }
        session.phase = HandshakePhase::Failed;
        session.failure_reason = Some(reason.to_string());
        session.updated_at_ms = now_ms();
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<HandshakeSession> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    /// Expire non-terminal sessions older than [`SESSION_MAX_AGE_MS`];
    /// returns how many were expired. Run by the cleanup sweeper.
    pub fn sweep(&self) -> usize {
        let cutoff = now_ms() - SESSION_MAX_AGE_MS;
        let mut sessions = self.sessions.lock().unwrap();
        let mut expired = 0;
        for session in sessions.values_mut() {
            if !session.phase.is_terminal() && session.updated_at_ms < cutoff {
                debug!(session = %session.session_id, "handshake session expired");
                session.phase = HandshakePhase::Expired;
                session.updated_at_ms = now_ms();
                expired += 1;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
