//! Per-session resource ownership.
//!
//! Everything one join owns lives here and is torn down as a unit. The
//! session token bounds which in-flight work may still mutate the session;
//! the controller checks it before every insertion.

use std::collections::HashMap;
use std::sync::Arc;

use banter_common::{RoomId, SubRoomId, UserId};

use crate::engine::{CaptureStream, MediaConsumer, MediaProducer, MediaTransport, PlaybackSink};

/// A local producer and the capture stream feeding it.
pub(crate) struct MediaLane {
    pub producer: Arc<dyn MediaProducer>,
    pub capture: Arc<dyn CaptureStream>,
}

impl MediaLane {
    /// Close the producer, then stop its capture track.
    pub async fn close(self) {
        self.producer.close().await;
        self.capture.stop().await;
    }
}

/// A consumer, its playback sink, and the remote user owning the producer.
pub(crate) struct ConsumerLane {
    pub consumer: Arc<dyn MediaConsumer>,
    pub sink: Arc<dyn PlaybackSink>,
    pub owner: UserId,
    /// Playback was autoplay-blocked; retried on the next user interaction.
    pub playback_blocked: bool,
}

impl ConsumerLane {
    pub async fn close(self) {
        self.consumer.close().await;
        self.sink.close();
    }
}

pub(crate) struct ActiveSession {
    pub room_id: RoomId,
    pub sub_room_id: SubRoomId,
    pub token: u64,
    pub send_transport: Option<Arc<dyn MediaTransport>>,
    pub recv_transport: Option<Arc<dyn MediaTransport>>,
    pub microphone: Option<MediaLane>,
    pub screen: Option<MediaLane>,
    /// producer_id → consumer lane
    pub consumers: HashMap<String, ConsumerLane>,
    /// producer_id → owning user, for bulk teardown on user-left.
    pub producer_owners: HashMap<String, UserId>,
}

impl ActiveSession {
    pub fn new(room_id: RoomId, sub_room_id: SubRoomId, token: u64) -> Self {
        Self {
            room_id,
            sub_room_id,
            token,
            send_transport: None,
            recv_transport: None,
            microphone: None,
            screen: None,
            consumers: HashMap::new(),
            producer_owners: HashMap::new(),
        }
    }

    /// Producer ids owned by one remote user.
    pub fn producers_of(&self, user_id: UserId) -> Vec<String> {
        self.producer_owners
            .iter()
            .filter(|(_, owner)| **owner == user_id)
            .map(|(pid, _)| pid.clone())
            .collect()
    }

    /// Close everything: consumers and their sinks, the screen share, the
    /// microphone lane, then both transports.
    pub async fn teardown(mut self) {
        for (_, lane) in self.consumers.drain() {
            lane.close().await;
        }
        if let Some(screen) = self.screen.take() {
            screen.close().await;
        }
        if let Some(mic) = self.microphone.take() {
            mic.close().await;
        }
        if let Some(transport) = self.recv_transport.take() {
            transport.close().await;
        }
        if let Some(transport) = self.send_transport.take() {
            transport.close().await;
        }
        self.producer_owners.clear();
    }
}
