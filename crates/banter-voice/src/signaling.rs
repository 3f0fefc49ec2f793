//! Signaling seam between the controller and the gateway.
//!
//! The controller only needs two things from a connection: fire an intent,
//! and await correlated confirmations. Narrowing that to a trait keeps the
//! session state machine testable without sockets.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use banter_gateway::{CorrelationRegistry, GatewayConnection, GatewayError};

#[async_trait]
pub trait Signaling: Send + Sync {
    /// Send a dispatch intent. Fails fast when the connection is not ready.
    async fn send(&self, event: &str, data: Value) -> Result<(), GatewayError>;

    /// The registry confirmations for this domain arrive through.
    fn registry(&self) -> &Arc<CorrelationRegistry>;
}

#[async_trait]
impl Signaling for GatewayConnection {
    async fn send(&self, event: &str, data: Value) -> Result<(), GatewayError> {
        GatewayConnection::send(self, event, data).await
    }

    fn registry(&self) -> &Arc<CorrelationRegistry> {
        GatewayConnection::registry(self)
    }
}
