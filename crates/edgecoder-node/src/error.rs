// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The HTTP error boundary.
//!
//! Every error kind maps to a stable status code and a JSON body
//! `{"error": "<kind>", "message": "…"}` so clients can branch on the kind
//! without parsing prose.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use edgecoder_credits::CreditError;
use edgecoder_crypto::{NonceVerifyError, SignatureError};
use edgecoder_sandbox::SandboxError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("signature_invalid")]
    SignatureInvalid,
    #[error("signature_expired")]
    SignatureExpired,
    #[error("signature_replay")]
    SignatureReplay,
    #[error("signature_body_mismatch")]
    SignatureBodyMismatch,
    #[error("signature_untrusted_peer")]
    SignatureUntrustedPeer,
    #[error("validation_error: {0}")]
    Validation(String),
    #[error("not_found")]
    NotFound,
    #[error("session_owner_mismatch")]
    SessionOwnerMismatch,
    #[error("invalid_phase_transition: {from} → {to}")]
    InvalidPhaseTransition { from: String, to: String },
    #[error("too_many_sessions")]
    TooManySessions,
    #[error("insufficient_credits")]
    InsufficientCredits,
    #[error("duplicate_contribution_report")]
    DuplicateContributionReport,
    #[error("sandbox_required")]
    SandboxRequired,
    #[error("sandbox_unavailable")]
    SandboxUnavailable,
    #[error("outside_subset")]
    OutsideSubset,
    #[error("model_limit")]
    ModelLimit,
    #[error("timeout")]
    Timeout,
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::SignatureInvalid => "signature_invalid",
            Self::SignatureExpired => "signature_expired",
            Self::SignatureReplay => "signature_replay",
            Self::SignatureBodyMismatch => "signature_body_mismatch",
            Self::SignatureUntrustedPeer => "signature_untrusted_peer",
            Self::Validation(_) => "validation_error",
            Self::NotFound => "not_found",
            Self::SessionOwnerMismatch => "session_owner_mismatch",
            Self::InvalidPhaseTransition { .. } => "invalid_phase_transition",
            Self::TooManySessions => "too_many_sessions",
            Self::InsufficientCredits => "insufficient_credits",
            Self::DuplicateContributionReport => "duplicate_contribution_report",
            Self::SandboxRequired => "sandbox_required",
            Self::SandboxUnavailable => "sandbox_unavailable",
            Self::OutsideSubset => "outside_subset",
            Self::ModelLimit => "model_limit",
            Self::Timeout => "timeout",
            Self::Upstream(_) => "upstream_failure",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized
            | Self::SignatureInvalid
            | Self::SignatureExpired
            | Self::SignatureReplay
            | Self::SignatureBodyMismatch => StatusCode::UNAUTHORIZED,
            Self::SignatureUntrustedPeer | Self::SessionOwnerMismatch => StatusCode::FORBIDDEN,
            Self::Validation(_)
            | Self::SandboxRequired
            | Self::SandboxUnavailable
            | Self::OutsideSubset
            | Self::ModelLimit => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidPhaseTransition { .. } | Self::DuplicateContributionReport => {
                StatusCode::CONFLICT
            }
            Self::TooManySessions => StatusCode::TOO_MANY_REQUESTS,
            Self::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
            Self::Timeout | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

impl From<SignatureError> for ApiError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::Invalid => Self::SignatureInvalid,
            SignatureError::UntrustedPeer => Self::SignatureUntrustedPeer,
            SignatureError::BodyMismatch => Self::SignatureBodyMismatch,
        }
    }
}

impl From<NonceVerifyError> for ApiError {
    fn from(e: NonceVerifyError) -> Self {
        match e {
            NonceVerifyError::TimestampSkew => Self::SignatureExpired,
            NonceVerifyError::Replay => Self::SignatureReplay,
        }
    }
}

impl From<CreditError> for ApiError {
    fn from(e: CreditError) -> Self {
        match e {
            CreditError::InsufficientCredits => Self::InsufficientCredits,
            CreditError::DuplicateReport => Self::DuplicateContributionReport,
            CreditError::NotFound => Self::NotFound,
            CreditError::Storage(msg) => Self::Internal(msg),
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Required => Self::SandboxRequired,
            SandboxError::Unavailable => Self::SandboxUnavailable,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::SignatureUntrustedPeer.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::InvalidPhaseTransition {
                from: "result".into(),
                to: "execute".into()
            }
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::TooManySessions.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::InsufficientCredits.status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(ApiError::Timeout.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn nonce_errors_map_to_signature_kinds() {
        assert_eq!(
            ApiError::from(NonceVerifyError::TimestampSkew).kind(),
            "signature_expired"
        );
        assert_eq!(
            ApiError::from(NonceVerifyError::Replay).kind(),
            "signature_replay"
        );
    }

    #[test]
    fn credit_errors_map_to_402_and_409() {
        assert_eq!(
            ApiError::from(CreditError::InsufficientCredits).status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ApiError::from(CreditError::DuplicateReport).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn sandbox_errors_are_client_errors() {
        assert_eq!(
            ApiError::from(SandboxError::Required).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::from(SandboxError::Required).kind(), "sandbox_required");
    }
}
