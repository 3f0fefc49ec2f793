//! Event correlation — awaitable request/response calls over the push stream.
//!
//! The relay never replies to an intent directly; it pushes a dispatch that
//! happens to confirm it. The registry holds pending waits keyed by event
//! type, each with a scope filter (room / sub-room / transport / session
//! token) and an optional custom matcher. An inbound dispatch resolves every
//! wait it satisfies; leaves and connection loss reject the relevant waits so
//! callers never hang.

use banter_common::events::DispatchEvent;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Why a pending wait was rejected instead of resolved.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WaitError {
    /// No matching dispatch arrived within the wait's budget.
    #[error("Timed out waiting for {event_type}")]
    Timeout { event_type: String },

    /// The owning connection closed; the caller should retry the whole
    /// operation once the connection is ready again.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The wait was cancelled (room leave, session cleanup).
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The relay reported a failure for the awaited operation.
    #[error("Relay error {code}: {message}")]
    Server { code: u32, message: String },
}

/// Scope fields a dispatch must satisfy to fulfil a wait.
///
/// A `None` field is unconstrained; a `Some` field must equal the
/// corresponding field carried in the event's payload.
#[derive(Debug, Clone, Default)]
pub struct ScopeFilter {
    pub room_id: Option<Uuid>,
    pub sub_room_id: Option<Uuid>,
    pub transport_id: Option<String>,
    pub session_token: Option<u64>,
}

impl ScopeFilter {
    pub fn room(room_id: Uuid) -> Self {
        Self {
            room_id: Some(room_id),
            ..Self::default()
        }
    }

    pub fn with_sub_room(mut self, sub_room_id: Uuid) -> Self {
        self.sub_room_id = Some(sub_room_id);
        self
    }

    pub fn with_transport(mut self, transport_id: impl Into<String>) -> Self {
        self.transport_id = Some(transport_id.into());
        self
    }

    pub fn with_token(mut self, token: u64) -> Self {
        self.session_token = Some(token);
        self
    }

    fn matches(&self, ev: &DispatchEvent) -> bool {
        if let Some(room) = self.room_id {
            if ev.room_id() != Some(room) {
                return false;
            }
        }
        if let Some(sub) = self.sub_room_id {
            if ev.sub_room_id() != Some(sub) {
                return false;
            }
        }
        if let Some(ref tid) = self.transport_id {
            if ev.transport_id() != Some(tid.as_str()) {
                return false;
            }
        }
        if let Some(token) = self.session_token {
            if ev.session_token() != Some(token) {
                return false;
            }
        }
        true
    }
}

type Matcher = Box<dyn Fn(&DispatchEvent) -> bool + Send + Sync>;

/// A single awaitable wait.
pub struct WaitSpec {
    pub event_type: String,
    pub scope: ScopeFilter,
    pub matcher: Option<Matcher>,
    pub timeout: Duration,
}

impl WaitSpec {
    pub fn new(event_type: impl Into<String>, scope: ScopeFilter, timeout: Duration) -> Self {
        Self {
            event_type: event_type.into(),
            scope,
            matcher: None,
            timeout,
        }
    }

    /// Additional predicate beyond the scope fields (e.g. keying a produced
    /// confirmation by the local user id).
    pub fn matching(mut self, f: impl Fn(&DispatchEvent) -> bool + Send + Sync + 'static) -> Self {
        self.matcher = Some(Box::new(f));
        self
    }
}

struct PendingWait {
    id: u64,
    scope: ScopeFilter,
    matcher: Option<Matcher>,
    tx: oneshot::Sender<Result<DispatchEvent, WaitError>>,
}

/// The pending-wait map. The only mutable state shared between the
/// connection's dispatch path and the voice controller; the lock is never
/// held across an await.
#[derive(Default)]
pub struct CorrelationRegistry {
    buckets: Mutex<HashMap<String, Vec<PendingWait>>>,
    next_id: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the first dispatch of `event_type` satisfying the spec's scope
    /// and matcher. Rejects with [`WaitError::Timeout`] after the budget.
    ///
    /// A timeout firing concurrently with a matching arrival settles to
    /// whichever happened first: the resolved value wins if it was already
    /// delivered when the timer fired.
    pub async fn wait_for(&self, spec: WaitSpec) -> Result<DispatchEvent, WaitError> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut buckets = self.buckets.lock().expect("correlation lock poisoned");
            buckets.entry(spec.event_type.clone()).or_default().push(PendingWait {
                id,
                scope: spec.scope,
                matcher: spec.matcher,
                tx,
            });
        }
        // Removes the entry on every exit path (timeout, caller dropped mid-
        // select); redundant after a resolve, which already removed it.
        let _guard = WaitGuard {
            registry: self,
            event_type: spec.event_type.clone(),
            id,
        };

        let mut rx = rx;
        match tokio::time::timeout(spec.timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WaitError::Cancelled("registry dropped".into())),
            Err(_elapsed) => match rx.try_recv() {
                // The resolution landed just as the timer fired; it was first.
                Ok(result) => result,
                Err(_) => Err(WaitError::Timeout {
                    event_type: spec.event_type,
                }),
            },
        }
    }

    /// Race a success wait against an error-class dispatch scoped the same
    /// way. A relay-reported failure surfaces as [`WaitError::Server`]
    /// instead of letting the success wait time out. Only an actual error
    /// dispatch wins the race; the error wait timing out does not — the
    /// success wait's own timeout stays authoritative.
    pub async fn await_either(
        &self,
        success: WaitSpec,
        error: WaitSpec,
    ) -> Result<DispatchEvent, WaitError> {
        tokio::select! {
            res = self.wait_for(success) => res,
            ev = async {
                match self.wait_for(error).await {
                    Ok(ev) => ev,
                    // Timed out or cancelled: let the success branch decide.
                    Err(_) => std::future::pending().await,
                }
            } => Err(WaitError::Server {
                code: ev.error_code().unwrap_or(0),
                message: ev.error_message().unwrap_or("unknown relay error").to_owned(),
            }),
        }
    }

    /// Deliver one inbound dispatch: resolve **all** matching waits for its
    /// event type and remove them. Returns how many were resolved.
    pub fn resolve(&self, event: &DispatchEvent) -> usize {
        let mut buckets = self.buckets.lock().expect("correlation lock poisoned");
        let Some(waits) = buckets.get_mut(&event.event) else {
            return 0;
        };

        let mut resolved = 0;
        waits.retain_mut(|wait| {
            let hit = wait.scope.matches(event)
                && wait.matcher.as_ref().is_none_or(|m| m(event));
            if !hit {
                return true;
            }
            resolved += 1;
            // The receiver may already be gone (timed out); ignored.
            let tx = std::mem::replace(&mut wait.tx, dead_sender());
            let _ = tx.send(Ok(event.clone()));
            false
        });
        if waits.is_empty() {
            buckets.remove(&event.event);
        }
        resolved
    }

    /// Cancel only the waits relevant to a room (and optionally one
    /// sub-room), leaving unrelated waits untouched. Waits with no room
    /// scope are not affected.
    pub fn reject_scope(&self, room_id: Uuid, sub_room_id: Option<Uuid>, reason: &str) {
        self.reject_where(
            |wait| {
                wait.scope.room_id == Some(room_id)
                    && (sub_room_id.is_none() || wait.scope.sub_room_id == sub_room_id)
            },
            || WaitError::Cancelled(reason.to_owned()),
        );
    }

    /// Reject every pending wait. Used on connection loss and disposal.
    pub fn reject_all(&self, reason: &str) {
        self.reject_where(|_| true, || WaitError::ConnectionClosed(reason.to_owned()));
    }

    /// Total pending waits across all event types.
    pub fn pending_len(&self) -> usize {
        let buckets = self.buckets.lock().expect("correlation lock poisoned");
        buckets.values().map(|w| w.len()).sum()
    }

    /// Pending waits scoped to a room.
    pub fn pending_for_room(&self, room_id: Uuid) -> usize {
        let buckets = self.buckets.lock().expect("correlation lock poisoned");
        buckets
            .values()
            .flatten()
            .filter(|w| w.scope.room_id == Some(room_id))
            .count()
    }

    fn reject_where(
        &self,
        pred: impl Fn(&PendingWait) -> bool,
        reason: impl Fn() -> WaitError,
    ) {
        let mut buckets = self.buckets.lock().expect("correlation lock poisoned");
        for waits in buckets.values_mut() {
            waits.retain_mut(|wait| {
                if !pred(wait) {
                    return true;
                }
                let tx = std::mem::replace(&mut wait.tx, dead_sender());
                let _ = tx.send(Err(reason()));
                false
            });
        }
        buckets.retain(|_, waits| !waits.is_empty());
    }

    fn remove(&self, event_type: &str, id: u64) {
        let mut buckets = self.buckets.lock().expect("correlation lock poisoned");
        if let Some(waits) = buckets.get_mut(event_type) {
            waits.retain(|w| w.id != id);
            if waits.is_empty() {
                buckets.remove(event_type);
            }
        }
    }
}

/// Placeholder sender used to move the live one out of a retained slot.
fn dead_sender() -> oneshot::Sender<Result<DispatchEvent, WaitError>> {
    oneshot::channel().0
}

struct WaitGuard<'a> {
    registry: &'a CorrelationRegistry,
    event_type: String,
    id: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.event_type, self.id);
    }
}
