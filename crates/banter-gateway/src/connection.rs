//! The gateway connection — one persistent duplex connection per domain.
//!
//! Lifecycle: try candidates round-robin → socket open → send `Identify` →
//! await `Hello` (start heartbeating at its cadence) → await `Ready` (mark
//! usable, promote the candidate). On any close the connection rejects every
//! pending correlated wait, backs off, and cycles to the next candidate.
//! Connection loss is routine and never fatal to the application.
//!
//! The disconnected/connecting/ready progression is observable through a
//! watch channel; candidate selection and backoff live in their own
//! socket-free modules so the policy parts stay unit-testable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use banter_common::config::GatewayConfig;
use banter_common::events::DispatchEvent;

use crate::backoff::ReconnectPolicy;
use crate::candidates::CandidateList;
use crate::correlate::CorrelationRegistry;
use crate::protocol::GatewayMessage;
use crate::{GatewayError, Result};

/// Where the connection currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

/// A reconnecting gateway connection for one signaling domain (the core
/// presence gateway, or a room provider's voice gateway).
pub struct GatewayConnection {
    shared: Arc<Shared>,
}

struct Shared {
    /// Domain label for logs ("core", "voice:eu-west", ...).
    domain: String,
    identify: serde_json::Value,
    policy: ReconnectPolicy,
    handshake_timeout: Duration,
    candidates: std::sync::Mutex<CandidateList>,
    registry: Arc<CorrelationRegistry>,
    dispatch_tx: broadcast::Sender<DispatchEvent>,
    state_tx: watch::Sender<ConnectionState>,
    outbound: std::sync::Mutex<Option<mpsc::Sender<Message>>>,
    disposed_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl GatewayConnection {
    pub fn new(
        domain: impl Into<String>,
        candidates: Vec<String>,
        identify: serde_json::Value,
    ) -> Self {
        let (dispatch_tx, _) = broadcast::channel(256);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (disposed_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                domain: domain.into(),
                identify,
                policy: ReconnectPolicy::default(),
                handshake_timeout: Duration::from_secs(10),
                candidates: std::sync::Mutex::new(CandidateList::new(candidates)),
                registry: Arc::new(CorrelationRegistry::new()),
                dispatch_tx,
                state_tx,
                outbound: std::sync::Mutex::new(None),
                disposed_tx,
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(
        domain: impl Into<String>,
        cfg: &GatewayConfig,
        identify: serde_json::Value,
    ) -> Self {
        Self::new(domain, cfg.endpoints.clone(), identify)
            .with_policy(ReconnectPolicy::new(
                Duration::from_millis(cfg.reconnect_base_delay_ms),
                Duration::from_millis(cfg.reconnect_max_delay_ms),
            ))
            .with_handshake_timeout(Duration::from_millis(cfg.identify_timeout_ms))
    }

    /// Override the reconnect backoff. Only effective before [`connect`].
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.policy = policy;
        }
        self
    }

    /// Override the Hello/Ready handshake budget. Only effective before [`connect`].
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.handshake_timeout = timeout;
        }
        self
    }

    /// Subscribe to pushed dispatch events.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.shared.dispatch_tx.subscribe()
    }

    /// The correlation registry fed by this connection.
    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.shared.registry
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// The candidate currently preferred for the next attempt.
    pub fn preferred_endpoint(&self) -> Option<String> {
        self.shared
            .candidates
            .lock()
            .expect("candidates lock")
            .preferred()
            .map(str::to_owned)
    }

    /// Replace the candidate list from re-derived configuration.
    pub fn rederive_candidates(&self, urls: Vec<String>) {
        self.shared
            .candidates
            .lock()
            .expect("candidates lock")
            .rederive(urls);
    }

    /// Spawn the background run loop that maintains the connection.
    /// Returns immediately; use [`wait_until_ready`] before sending.
    /// Idempotent — a second call is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if *self.shared.disposed_tx.borrow() {
            return Err(GatewayError::Disposed);
        }
        if self.shared.candidates.lock().expect("candidates lock").is_empty() {
            return Err(GatewayError::NoCandidates);
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            run_loop(shared).await;
        });
        Ok(())
    }

    /// Block until the connection reaches the ready state.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.state_tx.subscribe();
        let ready = rx.wait_for(|s| *s == ConnectionState::Ready);
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::Disposed),
            Err(_) => Err(GatewayError::NotConnected),
        }
    }

    /// Send a dispatch intent. Fails fast when the connection is not ready;
    /// callers needing reliable delivery await readiness first.
    pub async fn send(&self, event: &str, data: serde_json::Value) -> Result<()> {
        if self.state() != ConnectionState::Ready {
            return Err(GatewayError::NotConnected);
        }
        let tx = self
            .shared
            .outbound
            .lock()
            .expect("outbound lock")
            .clone()
            .ok_or(GatewayError::NotConnected)?;
        let frame = serde_json::to_string(&GatewayMessage::dispatch(event, data))?;
        tx.send(Message::Text(frame.into()))
            .await
            .map_err(|_| GatewayError::NotConnected)
    }

    /// Stop reconnection, close the socket, reject all pending waits.
    /// Idempotent.
    pub fn dispose(&self) {
        if self.shared.disposed_tx.send_replace(true) {
            return;
        }
        *self.shared.outbound.lock().expect("outbound lock") = None;
        self.shared.registry.reject_all("gateway disposed");
        self.shared
            .state_tx
            .send_replace(ConnectionState::Disconnected);
        info!(domain = %self.shared.domain, "Gateway disposed");
    }
}

async fn run_loop(shared: Arc<Shared>) {
    let mut disposed_rx = shared.disposed_tx.subscribe();
    let mut attempt: u32 = 0;

    loop {
        if *disposed_rx.borrow() {
            break;
        }
        let Some(url) = shared.candidates.lock().expect("candidates lock").next() else {
            warn!(domain = %shared.domain, "No gateway candidates; giving up");
            break;
        };

        shared.state_tx.send_replace(ConnectionState::Connecting);
        debug!(domain = %shared.domain, endpoint = %url, "Connecting to gateway");

        let outcome = run_once(&shared, &url, &mut disposed_rx).await;

        *shared.outbound.lock().expect("outbound lock") = None;
        shared.state_tx.send_replace(ConnectionState::Disconnected);
        shared.registry.reject_all("connection closed");

        if *disposed_rx.borrow() {
            break;
        }

        match outcome {
            Ok(reached_ready) => {
                if reached_ready {
                    attempt = 0;
                }
                attempt += 1;
                let delay = shared.policy.delay(attempt);
                info!(
                    domain = %shared.domain,
                    endpoint = %url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Gateway closed; reconnecting"
                );
                wait_or_disposed(delay, &mut disposed_rx).await;
            }
            Err(e) => {
                attempt += 1;
                let delay = shared.policy.delay(attempt);
                warn!(
                    domain = %shared.domain,
                    endpoint = %url,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Gateway connection failed; reconnecting"
                );
                wait_or_disposed(delay, &mut disposed_rx).await;
            }
        }
    }

    shared.state_tx.send_replace(ConnectionState::Disconnected);
    debug!(domain = %shared.domain, "Gateway run loop stopped");
}

async fn wait_or_disposed(delay: Duration, disposed_rx: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = sleep(delay) => {}
        _ = disposed_rx.wait_for(|d| *d) => {}
    }
}

/// Drive one socket session to completion. Returns whether the session ever
/// reached the ready state (resets the backoff and promotes the candidate).
async fn run_once(
    shared: &Arc<Shared>,
    url: &str,
    disposed_rx: &mut watch::Receiver<bool>,
) -> Result<bool> {
    let ws = tokio::select! {
        r = connect_async(url) => r?.0,
        _ = disposed_rx.wait_for(|d| *d) => return Ok(false),
    };
    let (mut sink, mut stream) = ws.split();

    let identify = serde_json::to_string(&GatewayMessage::Identify(shared.identify.clone()))?;
    sink.send(Message::Text(identify.into())).await?;

    // Phase 1: await Hello for the heartbeat cadence.
    let hello_deadline = sleep(shared.handshake_timeout);
    tokio::pin!(hello_deadline);
    let heartbeat_interval = loop {
        tokio::select! {
            _ = &mut hello_deadline => return Err(GatewayError::HandshakeTimeout),
            _ = async { let _ = disposed_rx.wait_for(|d| *d).await; } => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(false);
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed.into());
                };
                match msg? {
                    Message::Text(text) => {
                        if let Ok(GatewayMessage::Hello { heartbeat_interval }) =
                            serde_json::from_str::<GatewayMessage>(&text)
                        {
                            break heartbeat_interval;
                        }
                    }
                    Message::Close(_) => {
                        return Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed.into());
                    }
                    _ => {}
                }
            }
        }
    };
    debug!(
        domain = %shared.domain,
        interval_ms = heartbeat_interval,
        "Hello received; heartbeating"
    );

    // Phase 2: heartbeat at the Hello cadence, relay outbound intents, and
    // deliver inbound dispatches, until the socket closes.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval.max(1)));
    heartbeat.tick().await; // the first tick completes immediately

    // Ready must still arrive within the handshake budget.
    let ready_deadline = sleep(shared.handshake_timeout);
    tokio::pin!(ready_deadline);
    let mut reached_ready = false;

    loop {
        tokio::select! {
            _ = &mut ready_deadline, if !reached_ready => {
                return Err(GatewayError::HandshakeTimeout);
            }
            _ = async { let _ = disposed_rx.wait_for(|d| *d).await; } => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(reached_ready);
            }
            _ = heartbeat.tick() => {
                let frame = serde_json::to_string(&GatewayMessage::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                })?;
                sink.send(Message::Text(frame.into())).await?;
            }
            Some(frame) = out_rx.recv() => {
                sink.send(frame).await?;
            }
            msg = stream.next() => {
                let Some(msg) = msg else { return Ok(reached_ready) };
                let text = match msg? {
                    Message::Text(t) => t,
                    Message::Close(_) => return Ok(reached_ready),
                    _ => continue,
                };
                let frame = match serde_json::from_str::<GatewayMessage>(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!(domain = %shared.domain, error = %e, "Skipping unparseable frame");
                        continue;
                    }
                };
                match frame {
                    GatewayMessage::Ready { session_id } => {
                        reached_ready = true;
                        *shared.outbound.lock().expect("outbound lock") = Some(out_tx.clone());
                        shared
                            .candidates
                            .lock()
                            .expect("candidates lock")
                            .promote(url);
                        shared.state_tx.send_replace(ConnectionState::Ready);
                        info!(
                            domain = %shared.domain,
                            endpoint = %url,
                            session = %session_id,
                            "Gateway ready"
                        );
                    }
                    GatewayMessage::Dispatch { event, data } => {
                        let ev = DispatchEvent::new(event, data);
                        let resolved = shared.registry.resolve(&ev);
                        if resolved > 0 {
                            debug!(
                                domain = %shared.domain,
                                event = %ev.event,
                                resolved,
                                "Dispatch resolved pending waits"
                            );
                        }
                        let _ = shared.dispatch_tx.send(ev);
                    }
                    // Server-side frames we ignore on the client read path.
                    GatewayMessage::Hello { .. }
                    | GatewayMessage::Heartbeat { .. }
                    | GatewayMessage::Identify(_) => {}
                }
            }
        }
    }
}
