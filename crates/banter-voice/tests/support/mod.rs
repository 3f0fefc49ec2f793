//! Shared test doubles: a scripted SFU relay behind the signaling seam, and
//! a mock media engine that records everything the controller does to it.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use banter_common::UserId;
use banter_common::config::VoiceConfig;
use banter_common::events::{DispatchEvent, event};
use banter_gateway::{CorrelationRegistry, GatewayError};
use banter_voice::controller::VoiceSessionController;
use banter_voice::engine::{
    AudioFrame, CaptureConstraints, CaptureStream, ConsumerOptions, EngineError, MediaConsumer,
    MediaEngine, MediaKind, MediaProducer, MediaTransport, NegotiationRequest, PlaybackSink,
    RtpCapabilities, StreamSource, TrackHandle, TransportDirection, TransportOptions,
};
use banter_voice::signaling::Signaling;

// ── Scripted relay ──────────────────────────────────────────────────────────

pub type Responder = Box<dyn Fn(&DispatchEvent, u64) -> Vec<DispatchEvent> + Send + Sync>;

/// A fake SFU relay: records every intent and answers with the
/// confirmations a healthy relay would push, with per-event overrides for
/// failure scenarios. Responses are delivered asynchronously, after the
/// controller has registered its wait, like a real push stream.
pub struct ScriptedRelay {
    registry: Arc<CorrelationRegistry>,
    pub local_user: UserId,
    sent: Mutex<Vec<DispatchEvent>>,
    overrides: Mutex<HashMap<String, Responder>>,
    silenced: Mutex<HashSet<String>>,
    seq: AtomicU64,
    /// Producers already in the room when a join lands.
    pub initial_producers: Mutex<Vec<Value>>,
}

impl ScriptedRelay {
    pub fn new(local_user: UserId) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(CorrelationRegistry::new()),
            local_user,
            sent: Mutex::new(Vec::new()),
            overrides: Mutex::new(HashMap::new()),
            silenced: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
            initial_producers: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<DispatchEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_events(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|e| e.event.clone()).collect()
    }

    /// Replace the canned response for one intent type.
    pub fn set_responder(
        &self,
        event_type: &str,
        f: impl Fn(&DispatchEvent, u64) -> Vec<DispatchEvent> + Send + Sync + 'static,
    ) {
        self.overrides
            .lock()
            .unwrap()
            .insert(event_type.to_owned(), Box::new(f));
    }

    /// Withhold any response to one intent type.
    pub fn silence(&self, event_type: &str) {
        self.silenced.lock().unwrap().insert(event_type.to_owned());
    }

    fn respond(&self, intent: &DispatchEvent, seq: u64) -> Vec<DispatchEvent> {
        let d = &intent.data;
        match intent.event.as_str() {
            event::VOICE_JOIN => vec![DispatchEvent::new(
                event::VOICE_JOINED,
                json!({
                    "room_id": d["room_id"],
                    "sub_room_id": d["sub_room_id"],
                    "session_token": d["session_token"],
                    "rtp_capabilities": {"codecs": ["opus", "vp9"]},
                    "producers": *self.initial_producers.lock().unwrap(),
                }),
            )],
            event::TRANSPORT_CREATE => {
                let direction = d["direction"].as_str().unwrap_or("x");
                vec![DispatchEvent::new(
                    event::TRANSPORT_CREATED,
                    json!({
                        "room_id": d["room_id"],
                        "sub_room_id": d["sub_room_id"],
                        "session_token": d["session_token"],
                        "direction": d["direction"],
                        "transport_id": format!("t-{direction}-{seq}"),
                        "ice_parameters": {"ufrag": format!("u{seq}")},
                        "ice_candidates": [],
                        "dtls_parameters": {"role": "server"},
                    }),
                )]
            }
            event::TRANSPORT_CONNECT => vec![DispatchEvent::new(
                event::TRANSPORT_CONNECTED,
                json!({
                    "room_id": d["room_id"],
                    "transport_id": d["transport_id"],
                    "session_token": d["session_token"],
                }),
            )],
            event::PRODUCE => vec![DispatchEvent::new(
                event::PRODUCED,
                json!({
                    "room_id": d["room_id"],
                    "transport_id": d["transport_id"],
                    "session_token": d["session_token"],
                    "user_id": self.local_user,
                    "producer_id": format!("p-local-{seq}"),
                    "source": d["source"],
                }),
            )],
            event::CONSUME => vec![DispatchEvent::new(
                event::CONSUMED,
                json!({
                    "room_id": d["room_id"],
                    "session_token": d["session_token"],
                    "producer_id": d["producer_id"],
                    "consumer_id": format!("c-{seq}"),
                    "kind": "audio",
                    "rtp_parameters": {"codec": "opus"},
                }),
            )],
            _ => vec![],
        }
    }
}

#[async_trait]
impl Signaling for ScriptedRelay {
    async fn send(&self, event_type: &str, data: Value) -> Result<(), GatewayError> {
        let intent = DispatchEvent::new(event_type, data);
        self.sent.lock().unwrap().push(intent.clone());
        if self.silenced.lock().unwrap().contains(event_type) {
            return Ok(());
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let responses = {
            let overrides = self.overrides.lock().unwrap();
            match overrides.get(event_type) {
                Some(f) => f(&intent, seq),
                None => self.respond(&intent, seq),
            }
        };
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            for response in responses {
                // Land after the caller has registered its wait.
                tokio::task::yield_now().await;
                registry.resolve(&response);
            }
        });
        Ok(())
    }

    fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }
}

// ── Mock media engine ───────────────────────────────────────────────────────

pub struct EngineState {
    pub loaded: Mutex<Option<Value>>,
    pub transports: Mutex<Vec<Arc<MockTransport>>>,
    pub captures: Mutex<Vec<Arc<MockCapture>>>,
    pub displays: Mutex<Vec<Arc<MockCapture>>>,
    pub sinks: Mutex<Vec<Arc<MockSink>>>,
    pub deny_capture: AtomicBool,
    pub deny_display: AtomicBool,
    /// Whether apply_constraints succeeds in place.
    pub constraints_in_place: AtomicBool,
    pub autoplay_blocked: AtomicBool,
    pub output_retarget_unsupported: AtomicBool,
    /// Ordered record of engine-side effects, for ordering assertions.
    pub log: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl EngineState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            loaded: Mutex::new(None),
            transports: Mutex::new(Vec::new()),
            captures: Mutex::new(Vec::new()),
            displays: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            deny_capture: AtomicBool::new(false),
            deny_display: AtomicBool::new(false),
            constraints_in_place: AtomicBool::new(true),
            autoplay_blocked: AtomicBool::new(false),
            output_retarget_unsupported: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        })
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    pub fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.direction == direction)
            .cloned()
    }

    pub fn producers(&self, source: StreamSource) -> Vec<Arc<MockProducer>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .flat_map(|t| t.producers.lock().unwrap().clone())
            .filter(|p| p.source == source)
            .collect()
    }

    pub fn mic_producer(&self) -> Option<Arc<MockProducer>> {
        self.producers(StreamSource::Microphone).into_iter().next()
    }

    pub fn screen_producer(&self) -> Option<Arc<MockProducer>> {
        self.producers(StreamSource::Screen).into_iter().next()
    }

    pub fn consumers(&self) -> Vec<Arc<MockConsumer>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .flat_map(|t| t.consumers.lock().unwrap().clone())
            .collect()
    }

    pub fn all_sinks(&self) -> Vec<Arc<MockSink>> {
        self.sinks.lock().unwrap().clone()
    }

    /// The sink attached for one remote producer id.
    pub fn sink_for(&self, producer_id: &str) -> Option<Arc<MockSink>> {
        let consumers = self.consumers();
        let consumer = consumers.iter().find(|c| c.producer_id == producer_id)?;
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .find(|s| {
                s.attached.lock().unwrap().as_ref().map(|t| t.id.as_str())
                    == Some(consumer.track_id.as_str())
            })
            .cloned()
    }

    pub fn last_capture(&self) -> Option<Arc<MockCapture>> {
        self.captures.lock().unwrap().last().cloned()
    }
}

pub struct MockEngine {
    pub state: Arc<EngineState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: EngineState::new(),
        }
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn load(&self, server_capabilities: RtpCapabilities) -> Result<(), EngineError> {
        *self.state.loaded.lock().unwrap() = Some(server_capabilities.0);
        Ok(())
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities(json!({"codecs": ["opus"]}))
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, EngineError> {
        let (neg_tx, neg_rx) = mpsc::channel(8);
        let transport = Arc::new(MockTransport {
            id: options.id,
            direction,
            neg_tx,
            neg_rx: Mutex::new(Some(neg_rx)),
            connected: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            state: self.state.clone(),
        });
        self.state.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }

    async fn acquire_capture(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<Arc<dyn CaptureStream>, EngineError> {
        if self.state.deny_capture.load(Ordering::SeqCst) {
            return Err(EngineError::PermissionDenied("microphone denied".into()));
        }
        let capture = Arc::new(MockCapture::new(
            format!("track-mic-{}", self.state.next()),
            MediaKind::Audio,
            constraints,
            self.state.clone(),
        ));
        self.state.captures.lock().unwrap().push(capture.clone());
        Ok(capture)
    }

    async fn acquire_display_capture(&self) -> Result<Arc<dyn CaptureStream>, EngineError> {
        if self.state.deny_display.load(Ordering::SeqCst) {
            return Err(EngineError::PermissionDenied("display denied".into()));
        }
        let capture = Arc::new(MockCapture::new(
            format!("track-screen-{}", self.state.next()),
            MediaKind::Video,
            CaptureConstraints::default(),
            self.state.clone(),
        ));
        self.state.displays.lock().unwrap().push(capture.clone());
        Ok(capture)
    }

    fn create_sink(&self, kind: MediaKind) -> Arc<dyn PlaybackSink> {
        let sink = Arc::new(MockSink {
            kind,
            volume: Mutex::new(1.0),
            attached: Mutex::new(None),
            playing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            output_device: Mutex::new(None),
            state: self.state.clone(),
        });
        self.state.sinks.lock().unwrap().push(sink.clone());
        sink
    }
}

pub struct MockTransport {
    pub id: String,
    pub direction: TransportDirection,
    neg_tx: mpsc::Sender<NegotiationRequest>,
    neg_rx: Mutex<Option<mpsc::Receiver<NegotiationRequest>>>,
    pub connected: AtomicBool,
    pub producers: Mutex<Vec<Arc<MockProducer>>>,
    pub consumers: Mutex<Vec<Arc<MockConsumer>>>,
    pub closed: AtomicBool,
    state: Arc<EngineState>,
}

impl MockTransport {
    /// Raise the `connect` hook on first media, like a DTLS handshake.
    async fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (ack, done) = oneshot::channel();
        self.neg_tx
            .send(NegotiationRequest::Connect {
                dtls_parameters: json!({"role": "client"}),
                ack,
            })
            .await
            .map_err(|_| EngineError::NegotiationCancelled)?;
        done.await.map_err(|_| EngineError::NegotiationCancelled)??;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn take_negotiation_requests(&self) -> Option<mpsc::Receiver<NegotiationRequest>> {
        self.neg_rx.lock().unwrap().take()
    }

    async fn produce(
        &self,
        track: TrackHandle,
        source: StreamSource,
    ) -> Result<Arc<dyn MediaProducer>, EngineError> {
        self.ensure_connected().await?;
        let (ack, done) = oneshot::channel();
        self.neg_tx
            .send(NegotiationRequest::Produce {
                kind: track.kind,
                rtp_parameters: json!({"codec": "opus"}),
                source,
                ack,
            })
            .await
            .map_err(|_| EngineError::NegotiationCancelled)?;
        let producer_id = done.await.map_err(|_| EngineError::NegotiationCancelled)??;
        let producer = Arc::new(MockProducer {
            id: producer_id,
            source,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            track: Mutex::new(track),
            state: self.state.clone(),
        });
        self.producers.lock().unwrap().push(producer.clone());
        Ok(producer)
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn MediaConsumer>, EngineError> {
        self.ensure_connected().await?;
        let consumer = Arc::new(MockConsumer {
            id: options.consumer_id,
            producer_id: options.producer_id.clone(),
            kind: options.kind,
            track_id: format!("remote-{}", options.producer_id),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().unwrap().push(consumer.clone());
        Ok(consumer)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.record(format!("transport.close {}", self.id));
    }
}

pub struct MockProducer {
    pub id: String,
    pub source: StreamSource,
    pub paused: AtomicBool,
    pub closed: AtomicBool,
    pub track: Mutex<TrackHandle>,
    state: Arc<EngineState>,
}

#[async_trait]
impl MediaProducer for MockProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> StreamSource {
        self.source
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.state.record(format!("producer.pause {}", self.id));
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.state.record(format!("producer.resume {}", self.id));
    }

    async fn replace_track(&self, track: TrackHandle) -> Result<(), EngineError> {
        self.state
            .record(format!("producer.replace {} -> {}", self.id, track.id));
        *self.track.lock().unwrap() = track;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.record(format!("producer.close {}", self.id));
    }
}

pub struct MockConsumer {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub track_id: String,
    pub closed: AtomicBool,
}

#[async_trait]
impl MediaConsumer for MockConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> TrackHandle {
        TrackHandle {
            id: self.track_id.clone(),
            kind: self.kind,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockCapture {
    pub track_id: String,
    kind: MediaKind,
    pub constraints: Mutex<CaptureConstraints>,
    enabled: AtomicBool,
    pub stopped: AtomicBool,
    frames_tx: broadcast::Sender<AudioFrame>,
    ended_tx: watch::Sender<bool>,
    state: Arc<EngineState>,
}

impl MockCapture {
    fn new(
        track_id: String,
        kind: MediaKind,
        constraints: CaptureConstraints,
        state: Arc<EngineState>,
    ) -> Self {
        let (frames_tx, _) = broadcast::channel(16);
        let (ended_tx, _) = watch::channel(false);
        Self {
            track_id,
            kind,
            constraints: Mutex::new(constraints),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            frames_tx,
            ended_tx,
            state,
        }
    }

    /// Simulate the system ending the capture (picker "stop sharing").
    pub fn end_capture(&self) {
        self.ended_tx.send_replace(true);
    }

    pub fn push_frame(&self, samples: Vec<f32>) {
        let _ = self.frames_tx.send(AudioFrame {
            samples: samples.into(),
            sample_rate: 48_000,
        });
    }
}

#[async_trait]
impl CaptureStream for MockCapture {
    fn track(&self) -> TrackHandle {
        TrackHandle {
            id: self.track_id.clone(),
            kind: self.kind,
        }
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn apply_constraints(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<(), EngineError> {
        if self.state.constraints_in_place.load(Ordering::SeqCst) {
            *self.constraints.lock().unwrap() = constraints.clone();
            self.state
                .record(format!("capture.constrain {}", self.track_id));
            Ok(())
        } else {
            Err(EngineError::ConstraintUnsupported)
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<AudioFrame> {
        self.frames_tx.subscribe()
    }

    fn ended_signal(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.state.record(format!("capture.stop {}", self.track_id));
    }
}

pub struct MockSink {
    pub kind: MediaKind,
    pub volume: Mutex<f32>,
    pub attached: Mutex<Option<TrackHandle>>,
    pub playing: AtomicBool,
    pub closed: AtomicBool,
    pub output_device: Mutex<Option<String>>,
    state: Arc<EngineState>,
}

impl PlaybackSink for MockSink {
    fn attach(&self, track: TrackHandle) {
        *self.attached.lock().unwrap() = Some(track);
    }

    fn play(&self) -> Result<(), EngineError> {
        if self.state.autoplay_blocked.load(Ordering::SeqCst) {
            return Err(EngineError::AutoplayBlocked);
        }
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock().unwrap() = volume;
    }

    fn set_output_device(&self, device_id: Option<&str>) -> Result<(), EngineError> {
        if self.state.output_retarget_unsupported.load(Ordering::SeqCst) {
            return Err(EngineError::Other(anyhow::anyhow!(
                "setSinkId unsupported"
            )));
        }
        *self.output_device.lock().unwrap() = device_id.map(str::to_owned);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

pub struct Harness {
    pub controller: VoiceSessionController,
    pub relay: Arc<ScriptedRelay>,
    pub engine: Arc<EngineState>,
    pub local_user: UserId,
}

pub fn voice_config() -> VoiceConfig {
    VoiceConfig {
        join_timeout_ms: 500,
        negotiation_timeout_ms: 500,
        speaking_threshold_dbfs: -50.0,
        speaking_hang_ms: 100,
    }
}

pub fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let local_user = Uuid::new_v4();
    let relay = ScriptedRelay::new(local_user);
    let engine = MockEngine::new();
    let state = engine.state.clone();
    let controller = VoiceSessionController::new(
        relay.clone(),
        Arc::new(engine),
        local_user,
        &voice_config(),
    );
    Harness {
        controller,
        relay,
        engine: state,
        local_user,
    }
}

pub fn remote_producer(producer_id: &str, user_id: UserId) -> Value {
    json!({"producer_id": producer_id, "user_id": user_id, "kind": "audio"})
}

pub fn new_producer_event(
    room: Uuid,
    sub_room: Uuid,
    producer_id: &str,
    user_id: UserId,
) -> DispatchEvent {
    DispatchEvent::new(
        event::NEW_PRODUCER,
        json!({
            "room_id": room,
            "sub_room_id": sub_room,
            "producer_id": producer_id,
            "user_id": user_id,
            "kind": "audio",
        }),
    )
}
