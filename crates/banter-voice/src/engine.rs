//! The media-engine capability seam.
//!
//! The controller never touches ICE/DTLS/SRTP; it drives an external engine
//! through these traits. The engine's `connect`/`produce` negotiation hooks
//! are surfaced as [`NegotiationRequest`]s on an mpsc channel, each carrying
//! a oneshot ack: the engine's internal call suspends until the controller
//! finishes the gateway round trip and answers the ack exactly once. That
//! keeps cancellation (the session-token check) uniform with the rest of the
//! controller instead of being buried in callback nesting.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Errors surfaced by a media engine implementation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The user (or platform) denied capture or display access.
    #[error("Capture permission denied: {0}")]
    PermissionDenied(String),

    /// The constraints cannot be applied to the live track in place;
    /// the caller reacquires and hot-swaps instead.
    #[error("Constraint not satisfiable in place")]
    ConstraintUnsupported,

    /// Playback cannot start until a user interaction.
    #[error("Playback blocked until user interaction")]
    AutoplayBlocked,

    /// A negotiation round trip failed at the relay.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The controller abandoned the negotiation (session superseded).
    #[error("Negotiation cancelled")]
    NegotiationCancelled,

    #[error("Engine failure: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Audio,
    Video,
}

/// What a local producer carries, distinguishing microphone from screen
/// share on the same send transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Microphone,
    Screen,
}

impl StreamSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Microphone => "microphone",
            Self::Screen => "screen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

/// RTP capability description, opaque to the controller — produced by the
/// relay, consumed by the engine (and echoed in consume intents).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtpCapabilities(pub Value);

/// Parameters for instantiating a local transport, from the relay's
/// transport-created confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportOptions {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Parameters for instantiating a consumer, from the relay's consumed
/// confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerOptions {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Constraints for acquiring (or re-constraining) a local capture stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub device_id: Option<String>,
    pub noise_suppression: bool,
}

/// An opaque handle to a media track, shared between a capture stream and
/// the producer publishing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHandle {
    pub id: String,
    pub kind: MediaKind,
}

/// A PCM frame for local level metering. Samples are f32 in the 16-bit
/// integer range, mono.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

/// A negotiation hook raised by a transport mid-operation. The engine's
/// internal call stays suspended until the ack is answered; dropping the
/// ack sender cancels it.
pub enum NegotiationRequest {
    /// Finalize DTLS parameters with the relay before media can flow.
    Connect {
        dtls_parameters: Value,
        ack: oneshot::Sender<std::result::Result<(), EngineError>>,
    },
    /// Register a new outbound stream with the relay; the ack carries the
    /// relay-assigned producer id.
    Produce {
        kind: MediaKind,
        rtp_parameters: Value,
        source: StreamSource,
        ack: oneshot::Sender<std::result::Result<String, EngineError>>,
    },
}

/// The external media engine. One instance serves the whole client; `load`
/// re-initializes it for each session's relay capabilities.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn load(&self, server_capabilities: RtpCapabilities) -> Result<(), EngineError>;

    /// This client's RTP capabilities, sent with consume intents.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, EngineError>;

    /// Acquire a microphone capture stream. May suspend on a permission
    /// prompt; denial surfaces as [`EngineError::PermissionDenied`].
    async fn acquire_capture(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<Arc<dyn CaptureStream>, EngineError>;

    /// Acquire a display capture stream via the platform picker.
    async fn acquire_display_capture(&self) -> Result<Arc<dyn CaptureStream>, EngineError>;

    /// Create a playback sink for a consumer's track.
    fn create_sink(&self, kind: MediaKind) -> Arc<dyn PlaybackSink>;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &str;

    fn direction(&self) -> TransportDirection;

    /// The transport's negotiation requests. Taken exactly once, by the
    /// controller, which services them for the life of the transport.
    fn take_negotiation_requests(&self) -> Option<mpsc::Receiver<NegotiationRequest>>;

    /// Publish a local track (send transports only).
    async fn produce(
        &self,
        track: TrackHandle,
        source: StreamSource,
    ) -> Result<Arc<dyn MediaProducer>, EngineError>;

    /// Subscribe to a remote producer (recv transports only).
    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn MediaConsumer>, EngineError>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &str;

    fn source(&self) -> StreamSource;

    /// Stop sending without tearing down the producer.
    async fn pause(&self);

    async fn resume(&self);

    /// Hot-swap the underlying track (device switch). The old track keeps
    /// flowing until the swap completes.
    async fn replace_track(&self, track: TrackHandle) -> Result<(), EngineError>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn track(&self) -> TrackHandle;

    async fn close(&self);
}

#[async_trait]
pub trait CaptureStream: Send + Sync {
    fn track(&self) -> TrackHandle;

    fn kind(&self) -> MediaKind;

    /// Apply new constraints to the live track.
    /// [`EngineError::ConstraintUnsupported`] tells the caller to reacquire
    /// and hot-swap instead.
    async fn apply_constraints(&self, constraints: &CaptureConstraints)
    -> Result<(), EngineError>;

    /// Hard-enable/disable the track. Disabled means silence on the wire,
    /// not attenuation.
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// PCM frames for local level metering.
    fn subscribe_frames(&self) -> broadcast::Receiver<AudioFrame>;

    /// Becomes true when capture ends outside our control (device unplugged,
    /// the system picker's "stop sharing" button).
    fn ended_signal(&self) -> watch::Receiver<bool>;

    async fn stop(&self);
}

pub trait PlaybackSink: Send + Sync {
    fn attach(&self, track: TrackHandle);

    /// Begin playback. [`EngineError::AutoplayBlocked`] means retry on the
    /// next user interaction.
    fn play(&self) -> Result<(), EngineError>;

    /// Effective gain, 0.0..=1.0.
    fn set_volume(&self, volume: f32);

    /// Best-effort output retargeting; unsupported selections degrade to the
    /// default device.
    fn set_output_device(&self, device_id: Option<&str>) -> Result<(), EngineError>;

    fn close(&self);
}
