// ABOUTME: Crate-wide error taxonomy bridging per-component error enums to a single Router-facing type
// ABOUTME: Mirrors spec §7: business-logic errors are values, protocol errors stay at the session boundary

use thiserror::Error;

use crate::conversation::ConversationError;
use crate::quota::QuotaError;
use crate::transcode::TranscodeError;

/// Top-level error for everything that can go wrong above the protocol codecs.
///
/// Protocol-layer failures (malformed PDU, bad SMTP verb) are translated into
/// the protocol's own negative acknowledgement at the session boundary and
/// never become a `GatewayError` — see `smpp::session` and `mm4::server`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error(transparent)]
    LimitExceeded(#[from] QuotaError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error("upstream delivery failed: {0}")]
    UpstreamFailed(String),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error("message rejected by carrier as opt-out (STOP)")]
    StopMessage,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The spec §7 taxonomy name, used for structured log fields and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InputInvalid(_) => "InputInvalid",
            GatewayError::AuthFailed(_) => "AuthFailed",
            GatewayError::LimitExceeded(_) => "LimitExceeded",
            GatewayError::Transcode(_) => "TranscodeFailed",
            GatewayError::UpstreamFailed(_) => "UpstreamFailed",
            GatewayError::Conversation(_) => "AckTimeout",
            GatewayError::StopMessage => "StopMessage",
            GatewayError::Internal(_) => "Internal",
        }
    }
}
