//! The voice session controller — one user's participation in one room.
//!
//! State machine: Idle → Joining → Negotiating(send) → Negotiating(recv) →
//! Active → Leaving → Idle, with independent sub-states for screen share and
//! for each remote producer's consumer.
//!
//! Cancellation is token-based: every join attempt and every cleanup
//! advances the session token, and all in-flight work captures the token it
//! started under, discarding its result on resume if the token has moved.
//! There is no explicit cancel API; superseded work simply stops mattering.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use banter_common::config::VoiceConfig;
use banter_common::events::{DispatchEvent, event};
use banter_common::{RoomId, SubRoomId, UserId};
use banter_gateway::{ScopeFilter, WaitSpec};

use crate::engine::{
    CaptureStream, ConsumerOptions, EngineError, MediaEngine, MediaKind, MediaTransport,
    NegotiationRequest, PlaybackSink, RtpCapabilities, StreamSource, TransportDirection,
    TransportOptions,
};
use crate::error::{Result, VoiceError};
use crate::levels::{self, LevelConfig};
use crate::policy::{LocalMediaPolicy, UserAudioPreference, effective_volume};
use crate::session::{ActiveSession, ConsumerLane, MediaLane};
use crate::signaling::Signaling;

/// A remote producer as described in the joined payload or a new-producer
/// notification.
#[derive(Debug, Clone, Deserialize)]
struct RemoteProducerInfo {
    producer_id: String,
    user_id: UserId,
    #[serde(default)]
    kind: MediaKind,
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    join: Duration,
    negotiation: Duration,
}

#[derive(Clone)]
pub struct VoiceSessionController {
    inner: Arc<Inner>,
}

struct Inner {
    signaling: Arc<dyn Signaling>,
    engine: Arc<dyn MediaEngine>,
    user_id: UserId,
    timeouts: Timeouts,
    level_config: LevelConfig,
    /// The session token. Monotonic; advanced by every join and cleanup.
    epoch: AtomicU64,
    session: Mutex<Option<ActiveSession>>,
    policy: std::sync::Mutex<LocalMediaPolicy>,
    prefs: std::sync::Mutex<std::collections::HashMap<UserId, UserAudioPreference>>,
    /// Feeds the level pipeline's denoise toggle.
    suppress_tx: watch::Sender<bool>,
    /// Stable local speaking flag across capture swaps.
    speaking_tx: watch::Sender<bool>,
}

impl VoiceSessionController {
    pub fn new(
        signaling: Arc<dyn Signaling>,
        engine: Arc<dyn MediaEngine>,
        user_id: UserId,
        cfg: &VoiceConfig,
    ) -> Self {
        let (suppress_tx, _) = watch::channel(true);
        let (speaking_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                signaling,
                engine,
                user_id,
                timeouts: Timeouts {
                    join: Duration::from_millis(cfg.join_timeout_ms),
                    negotiation: Duration::from_millis(cfg.negotiation_timeout_ms),
                },
                level_config: LevelConfig {
                    threshold_dbfs: cfg.speaking_threshold_dbfs,
                    hang: Duration::from_millis(cfg.speaking_hang_ms),
                },
                epoch: AtomicU64::new(0),
                session: Mutex::new(None),
                policy: std::sync::Mutex::new(LocalMediaPolicy::default()),
                prefs: std::sync::Mutex::new(std::collections::HashMap::new()),
                suppress_tx,
                speaking_tx,
            }),
        }
    }

    // ── Read accessors ──────────────────────────────────────────────────────

    /// The room and sub-room of the active session, if any.
    pub async fn current_room(&self) -> Option<(RoomId, SubRoomId)> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| (s.room_id, s.sub_room_id))
    }

    pub async fn is_active(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }

    pub fn session_token(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub fn local_policy(&self) -> LocalMediaPolicy {
        self.inner.policy.lock().expect("policy lock").clone()
    }

    /// The microphone capture stream of the active session.
    pub async fn capture_stream(&self) -> Option<Arc<dyn CaptureStream>> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.microphone.as_ref().map(|m| m.capture.clone()))
    }

    /// Local speaking flag from the level pipeline.
    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.inner.speaking_tx.subscribe()
    }

    // ── Join / leave ────────────────────────────────────────────────────────

    /// Join a voice sub-room, tearing down any previous session first.
    ///
    /// A join superseded by a newer join or cleanup returns `Ok` with no
    /// observable side effects; every other failure runs an implicit cleanup
    /// so no partial resources leak.
    pub async fn join(
        &self,
        room_id: RoomId,
        sub_room_id: SubRoomId,
        policy: LocalMediaPolicy,
    ) -> Result<()> {
        self.cleanup().await;

        self.inner.suppress_tx.send_replace(policy.noise_suppression);
        *self.inner.policy.lock().expect("policy lock") = policy;

        let token = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(room = %room_id, sub_room = %sub_room_id, token, "Joining voice");

        match self.run_join(room_id, sub_room_id, token).await {
            Ok(()) => Ok(()),
            // A newer join or cleanup owns the session now; whatever this
            // attempt hit on the way out is not a failure.
            Err(_) if self.inner.epoch.load(Ordering::SeqCst) != token => {
                debug!(room = %room_id, token, "Join superseded; discarding");
                Ok(())
            }
            Err(e) => {
                warn!(room = %room_id, token, error = %e, "Join failed; cleaning up");
                self.cleanup_if_current(token).await;
                Err(e)
            }
        }
    }

    async fn run_join(&self, room_id: RoomId, sub_room_id: SubRoomId, token: u64) -> Result<()> {
        let inner = &self.inner;
        let registry = inner.signaling.registry();

        // 1. Join intent → joined confirmation with relay capabilities and
        //    the producers already present.
        inner
            .signaling
            .send(
                event::VOICE_JOIN,
                json!({
                    "room_id": room_id,
                    "sub_room_id": sub_room_id,
                    "session_token": token,
                }),
            )
            .await?;
        let joined = registry
            .await_either(
                WaitSpec::new(
                    event::VOICE_JOINED,
                    ScopeFilter::room(room_id)
                        .with_sub_room(sub_room_id)
                        .with_token(token),
                    inner.timeouts.join,
                ),
                WaitSpec::new(
                    event::VOICE_ERROR,
                    ScopeFilter::room(room_id).with_sub_room(sub_room_id),
                    inner.timeouts.join,
                ),
            )
            .await?;
        self.ensure_current(token)?;

        let capabilities = RtpCapabilities(
            joined
                .data
                .get("rtp_capabilities")
                .cloned()
                .unwrap_or(Value::Null),
        );
        let existing: Vec<RemoteProducerInfo> = joined
            .data
            .get("producers")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        // 2. Initialize the engine with the relay's capabilities.
        inner.engine.load(capabilities).await?;
        self.ensure_current(token)?;

        {
            let mut session = inner.session.lock().await;
            *session = Some(ActiveSession::new(room_id, sub_room_id, token));
        }

        // 3. Send transport.
        let send_transport = self
            .create_transport(room_id, sub_room_id, token, TransportDirection::Send)
            .await?;
        {
            let mut session = inner.session.lock().await;
            match session.as_mut().filter(|s| s.token == token) {
                Some(s) => s.send_transport = Some(send_transport.clone()),
                None => {
                    drop(session);
                    send_transport.close().await;
                    return Err(VoiceError::Superseded);
                }
            }
        }

        // 4. Microphone capture and producer.
        let policy = self.local_policy();
        let capture = inner
            .engine
            .acquire_capture(policy.capture_constraints())
            .await
            .map_err(VoiceError::from)?;
        if self.ensure_current(token).is_err() {
            capture.stop().await;
            return Err(VoiceError::Superseded);
        }
        self.spawn_level_pipeline(&capture);

        let producer = match send_transport
            .produce(capture.track(), StreamSource::Microphone)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                capture.stop().await;
                return Err(e.into());
            }
        };
        if policy.muted {
            // No audio may leave the client while muted — hard-disable, not
            // attenuate.
            producer.pause().await;
            capture.set_enabled(false);
        }
        let lane = MediaLane { producer, capture };
        {
            let mut session = inner.session.lock().await;
            match session.as_mut().filter(|s| s.token == token) {
                Some(s) => s.microphone = Some(lane),
                None => {
                    drop(session);
                    lane.close().await;
                    return Err(VoiceError::Superseded);
                }
            }
        }

        // 5. Recv transport.
        let recv_transport = self
            .create_transport(room_id, sub_room_id, token, TransportDirection::Recv)
            .await?;
        {
            let mut session = inner.session.lock().await;
            match session.as_mut().filter(|s| s.token == token) {
                Some(s) => s.recv_transport = Some(recv_transport),
                None => {
                    drop(session);
                    recv_transport.close().await;
                    return Err(VoiceError::Superseded);
                }
            }
        }

        // 6. Consume the producers already in the room.
        for producer in existing {
            self.consume_remote(
                room_id,
                sub_room_id,
                token,
                &producer.producer_id,
                producer.user_id,
                producer.kind,
            )
            .await?;
        }

        info!(room = %room_id, sub_room = %sub_room_id, token, "Voice session active");
        Ok(())
    }

    /// Tear down the active session (idempotent). Advances the token first
    /// so all in-flight work resolves to cancellation instead of leaking.
    pub async fn cleanup(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let session = self.inner.session.lock().await.take();
        let Some(session) = session else { return };

        self.inner.signaling.registry().reject_scope(
            session.room_id,
            Some(session.sub_room_id),
            "voice session cleanup",
        );
        // Best-effort leave intent; the relay also notices the transports
        // closing.
        let _ = self
            .inner
            .signaling
            .send(
                event::VOICE_LEAVE,
                json!({
                    "room_id": session.room_id,
                    "sub_room_id": session.sub_room_id,
                }),
            )
            .await;

        let (room, sub_room) = (session.room_id, session.sub_room_id);
        session.teardown().await;
        info!(room = %room, sub_room = %sub_room, "Voice session torn down");
    }

    async fn cleanup_if_current(&self, token: u64) {
        if self.inner.epoch.load(Ordering::SeqCst) == token {
            self.cleanup().await;
        }
    }

    // ── Live dispatch handling ──────────────────────────────────────────────

    /// Fold one gateway dispatch into the session. Events outside the
    /// current room/sub-room, and echoes of the local user's own producers,
    /// are ignored.
    pub async fn handle_dispatch(&self, ev: &DispatchEvent) {
        let Some((room_id, sub_room_id, token)) = ({
            let session = self.inner.session.lock().await;
            session
                .as_ref()
                .map(|s| (s.room_id, s.sub_room_id, s.token))
        }) else {
            return;
        };
        if ev.room_id().is_some_and(|r| r != room_id)
            || ev.sub_room_id().is_some_and(|s| s != sub_room_id)
        {
            return;
        }

        match ev.event.as_str() {
            event::NEW_PRODUCER => {
                let Ok(info) = serde_json::from_value::<RemoteProducerInfo>(ev.data.clone())
                else {
                    return;
                };
                match self
                    .consume_remote(
                        room_id,
                        sub_room_id,
                        token,
                        &info.producer_id,
                        info.user_id,
                        info.kind,
                    )
                    .await
                {
                    Ok(()) | Err(VoiceError::Superseded) => {}
                    Err(e) => {
                        warn!(producer = %info.producer_id, error = %e, "Consume failed")
                    }
                }
            }
            event::PRODUCER_CLOSED => {
                let Some(pid) = ev.producer_id() else { return };
                let lane = {
                    let mut session = self.inner.session.lock().await;
                    session.as_mut().and_then(|s| {
                        s.producer_owners.remove(pid);
                        s.consumers.remove(pid)
                    })
                };
                if let Some(lane) = lane {
                    debug!(producer = %pid, "Remote producer closed; consumer removed");
                    lane.close().await;
                }
            }
            event::USER_LEFT => {
                let Some(user_id) = ev.user_id() else { return };
                let lanes = {
                    let mut session = self.inner.session.lock().await;
                    let Some(s) = session.as_mut() else { return };
                    let pids = s.producers_of(user_id);
                    pids.iter()
                        .filter_map(|pid| {
                            s.producer_owners.remove(pid);
                            s.consumers.remove(pid)
                        })
                        .collect::<Vec<_>>()
                };
                if !lanes.is_empty() {
                    debug!(user = %user_id, count = lanes.len(), "User left; consumers removed");
                }
                for lane in lanes {
                    lane.close().await;
                }
            }
            _ => {}
        }
    }

    // ── Consume ─────────────────────────────────────────────────────────────

    async fn consume_remote(
        &self,
        room_id: RoomId,
        sub_room_id: SubRoomId,
        token: u64,
        producer_id: &str,
        owner: UserId,
        kind: MediaKind,
    ) -> Result<()> {
        // Echo suppression: never consume our own producers.
        if owner == self.inner.user_id {
            return Ok(());
        }
        let inner = &self.inner;

        // Idempotence: one consumer per producer id.
        let recv_transport = {
            let session = inner.session.lock().await;
            let Some(s) = session.as_ref().filter(|s| s.token == token) else {
                return Err(VoiceError::Superseded);
            };
            if s.consumers.contains_key(producer_id) {
                return Ok(());
            }
            s.recv_transport.clone().ok_or(VoiceError::NotActive)?
        };

        inner
            .signaling
            .send(
                event::CONSUME,
                json!({
                    "room_id": room_id,
                    "sub_room_id": sub_room_id,
                    "transport_id": recv_transport.id(),
                    "producer_id": producer_id,
                    "rtp_capabilities": inner.engine.rtp_capabilities(),
                    "session_token": token,
                }),
            )
            .await?;
        let pid = producer_id.to_owned();
        let consumed = inner
            .signaling
            .registry()
            .await_either(
                WaitSpec::new(
                    event::CONSUMED,
                    ScopeFilter::room(room_id).with_token(token),
                    inner.timeouts.negotiation,
                )
                .matching(move |ev| ev.producer_id() == Some(pid.as_str())),
                WaitSpec::new(
                    event::VOICE_ERROR,
                    ScopeFilter::room(room_id).with_transport(recv_transport.id()),
                    inner.timeouts.negotiation,
                ),
            )
            .await?;
        self.ensure_current(token)?;

        let options = ConsumerOptions {
            consumer_id: consumed
                .data
                .get("consumer_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned(),
            producer_id: producer_id.to_owned(),
            kind: consumed
                .data
                .get("kind")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or(kind),
            rtp_parameters: consumed
                .data
                .get("rtp_parameters")
                .cloned()
                .unwrap_or(Value::Null),
        };
        let consumer = recv_transport.consume(options).await?;

        let sink = inner.engine.create_sink(consumer.kind());
        sink.attach(consumer.track());
        {
            let policy = inner.policy.lock().expect("policy lock");
            let prefs = inner.prefs.lock().expect("prefs lock");
            let pref = prefs.get(&owner).copied().unwrap_or_default();
            sink.set_volume(effective_volume(policy.deafened, pref));
            if let Some(ref device) = policy.output_device_id {
                // Best-effort: unsupported selections degrade to default.
                let _ = sink.set_output_device(Some(device));
            }
        }
        let playback_blocked = match sink.play() {
            Ok(()) => false,
            Err(EngineError::AutoplayBlocked) => {
                debug!(producer = %producer_id, "Autoplay blocked; queued for user interaction");
                true
            }
            Err(e) => {
                consumer.close().await;
                sink.close();
                return Err(e.into());
            }
        };

        let lane = ConsumerLane {
            consumer,
            sink,
            owner,
            playback_blocked,
        };
        let mut session = inner.session.lock().await;
        match session.as_mut().filter(|s| s.token == token) {
            Some(s) => {
                // A concurrent consume for the same producer may have won.
                if s.consumers.contains_key(producer_id) {
                    drop(session);
                    lane.close().await;
                    return Ok(());
                }
                s.producer_owners.insert(producer_id.to_owned(), owner);
                s.consumers.insert(producer_id.to_owned(), lane);
                debug!(producer = %producer_id, user = %owner, "Consuming remote producer");
                Ok(())
            }
            None => {
                drop(session);
                lane.close().await;
                Err(VoiceError::Superseded)
            }
        }
    }

    /// Retry autoplay-blocked sinks. Call on a user interaction.
    pub async fn resume_playback(&self) {
        let blocked: Vec<(String, Arc<dyn PlaybackSink>)> = {
            let session = self.inner.session.lock().await;
            let Some(s) = session.as_ref() else { return };
            s.consumers
                .iter()
                .filter(|(_, lane)| lane.playback_blocked)
                .map(|(pid, lane)| (pid.clone(), lane.sink.clone()))
                .collect()
        };
        for (pid, sink) in blocked {
            if sink.play().is_ok() {
                let mut session = self.inner.session.lock().await;
                if let Some(lane) = session.as_mut().and_then(|s| s.consumers.get_mut(&pid)) {
                    lane.playback_blocked = false;
                }
            }
        }
    }

    // ── Transport negotiation ───────────────────────────────────────────────

    async fn create_transport(
        &self,
        room_id: RoomId,
        sub_room_id: SubRoomId,
        token: u64,
        direction: TransportDirection,
    ) -> Result<Arc<dyn MediaTransport>> {
        let inner = &self.inner;
        inner
            .signaling
            .send(
                event::TRANSPORT_CREATE,
                json!({
                    "room_id": room_id,
                    "sub_room_id": sub_room_id,
                    "direction": direction,
                    "session_token": token,
                }),
            )
            .await?;
        let direction_str = direction.as_str();
        let created = inner
            .signaling
            .registry()
            .await_either(
                WaitSpec::new(
                    event::TRANSPORT_CREATED,
                    ScopeFilter::room(room_id)
                        .with_sub_room(sub_room_id)
                        .with_token(token),
                    inner.timeouts.negotiation,
                )
                .matching(move |ev| {
                    ev.data.get("direction").and_then(|v| v.as_str()) == Some(direction_str)
                }),
                WaitSpec::new(
                    event::VOICE_ERROR,
                    ScopeFilter::room(room_id).with_sub_room(sub_room_id),
                    inner.timeouts.negotiation,
                ),
            )
            .await?;
        self.ensure_current(token)?;

        let options = TransportOptions {
            id: created.transport_id().unwrap_or_default().to_owned(),
            ice_parameters: created
                .data
                .get("ice_parameters")
                .cloned()
                .unwrap_or(Value::Null),
            ice_candidates: created
                .data
                .get("ice_candidates")
                .cloned()
                .unwrap_or(Value::Null),
            dtls_parameters: created
                .data
                .get("dtls_parameters")
                .cloned()
                .unwrap_or(Value::Null),
        };
        let transport = inner.engine.create_transport(direction, options).await?;
        if self.ensure_current(token).is_err() {
            transport.close().await;
            return Err(VoiceError::Superseded);
        }

        if let Some(requests) = transport.take_negotiation_requests() {
            self.spawn_negotiation_driver(
                transport.id().to_owned(),
                requests,
                room_id,
                sub_room_id,
                token,
            );
        }
        debug!(transport = %transport.id(), direction = direction_str, "Transport created");
        Ok(transport)
    }

    /// Service a transport's negotiation hooks: each request suspends the
    /// engine until the gateway round trip completes, then acks exactly
    /// once. Requests arriving after the token moved are cancelled.
    fn spawn_negotiation_driver(
        &self,
        transport_id: String,
        mut requests: mpsc::Receiver<NegotiationRequest>,
        room_id: RoomId,
        sub_room_id: SubRoomId,
        token: u64,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let stale = inner.epoch.load(Ordering::SeqCst) != token;
                match request {
                    NegotiationRequest::Connect {
                        dtls_parameters,
                        ack,
                    } => {
                        if stale {
                            let _ = ack.send(Err(EngineError::NegotiationCancelled));
                            continue;
                        }
                        let result = connect_round_trip(
                            &inner,
                            &transport_id,
                            dtls_parameters,
                            room_id,
                            sub_room_id,
                            token,
                        )
                        .await;
                        let _ = ack.send(result);
                    }
                    NegotiationRequest::Produce {
                        kind,
                        rtp_parameters,
                        source,
                        ack,
                    } => {
                        if stale {
                            let _ = ack.send(Err(EngineError::NegotiationCancelled));
                            continue;
                        }
                        let result = produce_round_trip(
                            &inner,
                            &transport_id,
                            kind,
                            rtp_parameters,
                            source,
                            room_id,
                            sub_room_id,
                            token,
                        )
                        .await;
                        let _ = ack.send(result);
                    }
                }
            }
            debug!(transport = %transport_id, "Negotiation driver finished");
        });
    }

    // ── Mutators ────────────────────────────────────────────────────────────

    /// Pause/resume the local producer and hard-toggle the capture track.
    pub async fn set_muted(&self, muted: bool) {
        self.inner.policy.lock().expect("policy lock").muted = muted;
        let mic = {
            let session = self.inner.session.lock().await;
            session.as_ref().and_then(|s| {
                s.microphone
                    .as_ref()
                    .map(|m| (m.producer.clone(), m.capture.clone()))
            })
        };
        if let Some((producer, capture)) = mic {
            if muted {
                producer.pause().await;
                capture.set_enabled(false);
            } else {
                capture.set_enabled(true);
                producer.resume().await;
            }
            info!(muted, "Microphone mute toggled");
        }
    }

    /// Force every consumer's effective output to zero until un-deafened;
    /// un-deafening restores the per-user preferences exactly.
    pub async fn set_deafened(&self, deafened: bool) {
        self.inner.policy.lock().expect("policy lock").deafened = deafened;
        self.reapply_volumes(None).await;
        info!(deafened, "Deafen toggled");
    }

    /// Per-remote-user playback preference; recomputes only that user's
    /// consumer sinks.
    pub async fn set_user_audio_preference(&self, user_id: UserId, pref: UserAudioPreference) {
        self.inner
            .prefs
            .lock()
            .expect("prefs lock")
            .insert(user_id, pref);
        self.reapply_volumes(Some(user_id)).await;
    }

    /// Retarget all audio sinks, best-effort; unsupported selections degrade
    /// silently to the default output.
    pub async fn set_audio_output_device(&self, device_id: Option<String>) {
        self.inner
            .policy
            .lock()
            .expect("policy lock")
            .output_device_id = device_id.clone();
        let sinks: Vec<Arc<dyn PlaybackSink>> = {
            let session = self.inner.session.lock().await;
            session
                .as_ref()
                .map(|s| s.consumers.values().map(|l| l.sink.clone()).collect())
                .unwrap_or_default()
        };
        for sink in sinks {
            if let Err(e) = sink.set_output_device(device_id.as_deref()) {
                debug!(error = %e, "Output retarget unsupported; using default");
            }
        }
    }

    /// Switch the capture input device without rejoining.
    pub async fn set_audio_input_device(&self, device_id: Option<String>) -> Result<()> {
        self.inner
            .policy
            .lock()
            .expect("policy lock")
            .input_device_id = device_id;
        self.apply_capture_constraints().await
    }

    /// Toggle noise suppression on the live capture.
    pub async fn set_noise_suppression(&self, enabled: bool) -> Result<()> {
        self.inner
            .policy
            .lock()
            .expect("policy lock")
            .noise_suppression = enabled;
        self.inner.suppress_tx.send_replace(enabled);
        self.apply_capture_constraints().await
    }

    /// Apply the current capture constraints in place; when the engine
    /// cannot, reacquire and hot-swap. The old track stops only after the
    /// replacement succeeds, and the producer is reused — never duplicated.
    async fn apply_capture_constraints(&self) -> Result<()> {
        let (producer, capture, token) = {
            let session = self.inner.session.lock().await;
            let Some(s) = session.as_ref() else {
                // Idle: the policy simply applies at the next join.
                return Ok(());
            };
            let Some(mic) = s.microphone.as_ref() else {
                return Ok(());
            };
            (mic.producer.clone(), mic.capture.clone(), s.token)
        };
        let constraints = self
            .inner
            .policy
            .lock()
            .expect("policy lock")
            .capture_constraints();

        match capture.apply_constraints(&constraints).await {
            Ok(()) => Ok(()),
            Err(EngineError::ConstraintUnsupported) => {
                let fresh = self
                    .inner
                    .engine
                    .acquire_capture(constraints)
                    .await
                    .map_err(VoiceError::from)?;
                if self.ensure_current(token).is_err() {
                    fresh.stop().await;
                    return Err(VoiceError::Superseded);
                }
                producer.replace_track(fresh.track()).await?;
                fresh.set_enabled(!self.inner.policy.lock().expect("policy lock").muted);
                // Old track stops only after the swap landed.
                capture.stop().await;
                self.spawn_level_pipeline(&fresh);
                let mut session = self.inner.session.lock().await;
                match session.as_mut().filter(|s| s.token == token) {
                    Some(s) => {
                        if let Some(mic) = s.microphone.as_mut() {
                            mic.capture = fresh;
                        }
                        info!("Capture reacquired and hot-swapped");
                        Ok(())
                    }
                    None => {
                        drop(session);
                        fresh.stop().await;
                        Err(VoiceError::Superseded)
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reapply_volumes(&self, only_user: Option<UserId>) {
        let lanes: Vec<(UserId, Arc<dyn PlaybackSink>)> = {
            let session = self.inner.session.lock().await;
            session
                .as_ref()
                .map(|s| {
                    s.consumers
                        .values()
                        .filter(|lane| only_user.is_none_or(|u| lane.owner == u))
                        .map(|lane| (lane.owner, lane.sink.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        let deafened = self.inner.policy.lock().expect("policy lock").deafened;
        for (owner, sink) in lanes {
            let pref = self
                .inner
                .prefs
                .lock()
                .expect("prefs lock")
                .get(&owner)
                .copied()
                .unwrap_or_default();
            sink.set_volume(effective_volume(deafened, pref));
        }
    }

    // ── Screen share ────────────────────────────────────────────────────────

    /// Start sharing the screen: an independent producer on the same send
    /// transport. Ending capture from the system picker triggers the same
    /// teardown as [`stop_screen_share`].
    pub async fn start_screen_share(&self) -> Result<()> {
        let (send_transport, token) = {
            let session = self.inner.session.lock().await;
            let Some(s) = session.as_ref() else {
                return Err(VoiceError::NotActive);
            };
            if s.screen.is_some() {
                return Ok(());
            }
            (
                s.send_transport.clone().ok_or(VoiceError::NotActive)?,
                s.token,
            )
        };

        let capture = self
            .inner
            .engine
            .acquire_display_capture()
            .await
            .map_err(VoiceError::from)?;
        if self.ensure_current(token).is_err() {
            capture.stop().await;
            return Err(VoiceError::Superseded);
        }

        let producer = match send_transport
            .produce(capture.track(), StreamSource::Screen)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                capture.stop().await;
                return Err(e.into());
            }
        };

        let mut ended = capture.ended_signal();
        let lane = MediaLane { producer, capture };
        {
            let mut session = self.inner.session.lock().await;
            match session.as_mut().filter(|s| s.token == token) {
                Some(s) => s.screen = Some(lane),
                None => {
                    drop(session);
                    lane.close().await;
                    return Err(VoiceError::Superseded);
                }
            }
        }

        // The system picker's "stop sharing" takes the same path as an
        // explicit stop.
        let controller = self.clone();
        tokio::spawn(async move {
            if ended.wait_for(|e| *e).await.is_ok()
                && controller.inner.epoch.load(Ordering::SeqCst) == token
            {
                debug!("Display capture ended by the system; stopping share");
                let _ = controller.stop_screen_share().await;
            }
        });

        info!("Screen share started");
        Ok(())
    }

    /// Stop sharing. Closes only the screen producer and its capture; the
    /// microphone producer is untouched.
    pub async fn stop_screen_share(&self) -> Result<()> {
        let lane = {
            let mut session = self.inner.session.lock().await;
            session.as_mut().and_then(|s| s.screen.take())
        };
        if let Some(lane) = lane {
            lane.close().await;
            info!("Screen share stopped");
        }
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn ensure_current(&self, token: u64) -> Result<()> {
        if self.inner.epoch.load(Ordering::SeqCst) == token {
            Ok(())
        } else {
            Err(VoiceError::Superseded)
        }
    }

    fn spawn_level_pipeline(&self, capture: &Arc<dyn CaptureStream>) {
        let frames = capture.subscribe_frames();
        let suppress = self.inner.suppress_tx.subscribe();
        let mut pipeline = levels::spawn_pipeline(frames, suppress, self.inner.level_config);
        let out = self.inner.speaking_tx.clone();
        tokio::spawn(async move {
            while pipeline.changed().await.is_ok() {
                let speaking = *pipeline.borrow();
                out.send_replace(speaking);
            }
            out.send_replace(false);
        });
    }
}

// ── Negotiation round trips ─────────────────────────────────────────────────

/// Cancelled waits (cleanup, leave) stay distinguishable from real failures
/// so superseded work remains a silent no-op all the way up.
fn map_wait_error(e: banter_gateway::WaitError) -> EngineError {
    match e {
        banter_gateway::WaitError::Cancelled(_) => EngineError::NegotiationCancelled,
        other => EngineError::NegotiationFailed(other.to_string()),
    }
}

async fn connect_round_trip(
    inner: &Inner,
    transport_id: &str,
    dtls_parameters: Value,
    room_id: RoomId,
    sub_room_id: SubRoomId,
    token: u64,
) -> std::result::Result<(), EngineError> {
    let send = inner.signaling.send(
        event::TRANSPORT_CONNECT,
        json!({
            "room_id": room_id,
            "sub_room_id": sub_room_id,
            "transport_id": transport_id,
            "dtls_parameters": dtls_parameters,
            "session_token": token,
        }),
    );
    send.await
        .map_err(|e| EngineError::NegotiationFailed(e.to_string()))?;

    inner
        .signaling
        .registry()
        .await_either(
            WaitSpec::new(
                event::TRANSPORT_CONNECTED,
                ScopeFilter::room(room_id)
                    .with_transport(transport_id)
                    .with_token(token),
                inner.timeouts.negotiation,
            ),
            WaitSpec::new(
                event::VOICE_ERROR,
                ScopeFilter::room(room_id).with_transport(transport_id),
                inner.timeouts.negotiation,
            ),
        )
        .await
        .map(|_| ())
        .map_err(map_wait_error)
}

#[allow(clippy::too_many_arguments)]
async fn produce_round_trip(
    inner: &Inner,
    transport_id: &str,
    kind: MediaKind,
    rtp_parameters: Value,
    source: StreamSource,
    room_id: RoomId,
    sub_room_id: SubRoomId,
    token: u64,
) -> std::result::Result<String, EngineError> {
    let send = inner.signaling.send(
        event::PRODUCE,
        json!({
            "room_id": room_id,
            "sub_room_id": sub_room_id,
            "transport_id": transport_id,
            "kind": kind,
            "rtp_parameters": rtp_parameters,
            "source": source,
            "session_token": token,
        }),
    );
    send.await
        .map_err(|e| EngineError::NegotiationFailed(e.to_string()))?;

    // Keyed by the local user id to disambiguate from other users producing
    // concurrently, and by source so a microphone and a screen produce on
    // the same transport cannot claim each other's confirmation.
    let local_user = inner.user_id;
    let source_str = source.as_str();
    let produced = inner
        .signaling
        .registry()
        .await_either(
            WaitSpec::new(
                event::PRODUCED,
                ScopeFilter::room(room_id)
                    .with_transport(transport_id)
                    .with_token(token),
                inner.timeouts.negotiation,
            )
            .matching(move |ev| {
                ev.user_id() == Some(local_user)
                    && ev.data.get("source").and_then(|v| v.as_str()) == Some(source_str)
            }),
            WaitSpec::new(
                event::VOICE_ERROR,
                ScopeFilter::room(room_id).with_transport(transport_id),
                inner.timeouts.negotiation,
            ),
        )
        .await
        .map_err(map_wait_error)?;

    produced
        .producer_id()
        .map(str::to_owned)
        .ok_or_else(|| EngineError::NegotiationFailed("produced event lacked producer_id".into()))
}
