//! # banter-gateway
//!
//! Client-side real-time gateway for Banter. Handles:
//! - One persistent duplex connection per signaling domain
//! - Candidate fallback with recency-biased selection
//! - Identify handshake, heartbeat, reconnect with backoff
//! - Correlation of request intents with pushed confirmations
//!
//! The connection knows nothing about voice semantics; the voice layer sends
//! intents through [`GatewayConnection::send`] and awaits confirmations
//! through the [`correlate::CorrelationRegistry`] the connection feeds.

pub mod backoff;
pub mod candidates;
pub mod connection;
pub mod correlate;
pub mod protocol;

pub use connection::{ConnectionState, GatewayConnection};
pub use correlate::{CorrelationRegistry, ScopeFilter, WaitError, WaitSpec};

/// Errors from the gateway connection layer.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The connection is not in the ready state.
    #[error("Gateway is not connected")]
    NotConnected,

    /// The connection was disposed and will not reconnect.
    #[error("Gateway disposed")]
    Disposed,

    /// An error from the WebSocket layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No candidate endpoint was configured for this domain.
    #[error("No gateway endpoint candidates configured")]
    NoCandidates,

    /// The Hello/Ready handshake did not complete in time.
    #[error("Gateway handshake timed out")]
    HandshakeTimeout,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
