//! Dispatch event types — shared between the gateway and voice crates.
//!
//! The relay pushes events as `{ event, data }` dispatches; the voice layer
//! both consumes them (confirmations, presence changes) and emits intents in
//! the same shape. This module lives in `banter-common` so both crates can
//! use it without circular deps.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dispatch event names on the voice signaling domain.
///
/// Client → relay intents and relay → client confirmations/notifications.
pub mod event {
    // Intents
    pub const VOICE_JOIN: &str = "VOICE_JOIN";
    pub const VOICE_LEAVE: &str = "VOICE_LEAVE";
    pub const TRANSPORT_CREATE: &str = "TRANSPORT_CREATE";
    pub const TRANSPORT_CONNECT: &str = "TRANSPORT_CONNECT";
    pub const PRODUCE: &str = "PRODUCE";
    pub const CONSUME: &str = "CONSUME";

    // Confirmations
    pub const VOICE_JOINED: &str = "VOICE_JOINED";
    pub const TRANSPORT_CREATED: &str = "TRANSPORT_CREATED";
    pub const TRANSPORT_CONNECTED: &str = "TRANSPORT_CONNECTED";
    pub const PRODUCED: &str = "PRODUCED";
    pub const CONSUMED: &str = "CONSUMED";

    // Server-pushed state
    pub const NEW_PRODUCER: &str = "NEW_PRODUCER";
    pub const PRODUCER_CLOSED: &str = "PRODUCER_CLOSED";
    pub const USER_LEFT: &str = "USER_LEFT";
    pub const VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
    pub const VOICE_SPEAKING: &str = "VOICE_SPEAKING";

    /// Error-class dispatch raced against every confirmation wait.
    pub const VOICE_ERROR: &str = "VOICE_ERROR";
}

/// An event pushed through (or sent over) the gateway.
///
/// Scope fields are carried inside `data` rather than as struct fields so
/// the wire shape stays a flat `{ event, data }` pair; the typed accessors
/// below read them out for correlation and routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// Event type (e.g. "VOICE_JOINED", "NEW_PRODUCER")
    pub event: String,
    /// Event payload as JSON
    pub data: serde_json::Value,
}

impl DispatchEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn room_id(&self) -> Option<Uuid> {
        self.uuid_field("room_id")
    }

    pub fn sub_room_id(&self) -> Option<Uuid> {
        self.uuid_field("sub_room_id")
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.uuid_field("user_id")
    }

    pub fn transport_id(&self) -> Option<&str> {
        self.data.get("transport_id").and_then(|v| v.as_str())
    }

    pub fn producer_id(&self) -> Option<&str> {
        self.data.get("producer_id").and_then(|v| v.as_str())
    }

    /// The client-chosen session token echoed back by the relay.
    pub fn session_token(&self) -> Option<u64> {
        self.data.get("session_token").and_then(|v| v.as_u64())
    }

    /// Error code on a `VOICE_ERROR` dispatch.
    pub fn error_code(&self) -> Option<u32> {
        self.data.get("code").and_then(|v| v.as_u64()).map(|c| c as u32)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data.get("message").and_then(|v| v.as_str())
    }

    fn uuid_field(&self, key: &str) -> Option<Uuid> {
        self.data.get(key)?.as_str()?.parse().ok()
    }
}
