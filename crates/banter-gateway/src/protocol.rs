//! Gateway wire protocol — what the client and relay send to each other.

use banter_common::events::DispatchEvent;
use serde::{Deserialize, Serialize};

/// Gateway opcodes.
///
/// The same frame shape is used on the core presence domain and on each
/// room provider's voice signaling domain; only the dispatch vocabulary
/// differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d")]
pub enum GatewayMessage {
    /// Client → Relay: authenticate and describe this client.
    Identify(serde_json::Value),

    /// Relay → Client: connection accepted, heartbeat on this cadence.
    Hello { heartbeat_interval: u64 },

    /// Client → Relay: keepalive ping.
    Heartbeat { timestamp: i64 },

    /// Relay → Client: identify accepted, connection usable.
    Ready { session_id: String },

    /// Bidirectional: an event occurred (intents upstream, state downstream).
    Dispatch { event: String, data: serde_json::Value },
}

impl GatewayMessage {
    pub fn dispatch(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self::Dispatch {
            event: event.into(),
            data,
        }
    }

    /// View a `Dispatch` frame as a [`DispatchEvent`].
    pub fn as_dispatch(&self) -> Option<DispatchEvent> {
        match self {
            Self::Dispatch { event, data } => Some(DispatchEvent::new(event.clone(), data.clone())),
            _ => None,
        }
    }
}
