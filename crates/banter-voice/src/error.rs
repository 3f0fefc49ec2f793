//! Voice error taxonomy.
//!
//! Connectivity failures are routine and retried by the gateway; everything
//! here describes what the *caller* of a join or mutator sees. Stale-token
//! interruptions travel as [`VoiceError::Superseded`] internally and are
//! swallowed at the public boundary — a superseded join is not a failure.

use banter_gateway::{GatewayError, WaitError};

use crate::engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// The gateway connection was unusable for an intent.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// The connection dropped while a confirmation was pending. The caller
    /// decides whether to retry the whole operation.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// No matching confirmation within the negotiation budget.
    #[error("Timed out waiting for {event_type}")]
    NegotiationTimeout { event_type: String },

    /// The relay reported a failure for this operation.
    #[error("Relay error {code}: {message}")]
    Server { code: u32, message: String },

    /// Capture device or display permission failure — prompt the user
    /// instead of retrying automatically.
    #[error("Capture failed: {0}")]
    Capture(String),

    /// Media engine failure outside capture/permission.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// A newer join or cleanup superseded this work. Not a failure.
    #[error("Session superseded")]
    Superseded,

    /// The operation needs an active session.
    #[error("No active voice session")]
    NotActive,
}

impl From<WaitError> for VoiceError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Timeout { event_type } => Self::NegotiationTimeout { event_type },
            WaitError::ConnectionClosed(reason) => Self::ConnectionClosed(reason),
            // Scope rejection means a leave/cleanup cancelled the wait.
            WaitError::Cancelled(_) => Self::Superseded,
            WaitError::Server { code, message } => Self::Server { code, message },
        }
    }
}

impl From<EngineError> for VoiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::PermissionDenied(msg) => Self::Capture(msg),
            EngineError::NegotiationCancelled => Self::Superseded,
            other => Self::Engine(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
