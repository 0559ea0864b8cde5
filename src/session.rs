//! Session state owned by the session manager.
//!
//! The manager is the only writer. Callers observe read-only [`Session`]
//! snapshots or subscribe to state transitions through a `watch` channel.
//! Transitions are compare-and-set so concurrent callers never overwrite a
//! newer state with a stale one.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use tokio::sync::watch;
use uuid::Uuid;

use crate::routing::TransportKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Read-only snapshot of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub endpoint: Option<String>,
    /// Transport that currently serves streaming-capable routes.
    pub transport: TransportKind,
    pub state: SessionState,
    /// Milliseconds since the Unix epoch of the last successful exchange.
    pub last_activity_ms: Option<i64>,
    /// Reconnect attempts made after unexpected drops.
    pub reconnects: u32,
    pub closed: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct SessionMeta {
    endpoint: Option<String>,
    reconnects: u32,
    closed: bool,
    last_error: Option<String>,
}

pub(crate) struct SessionCell {
    id: Uuid,
    state: watch::Sender<SessionState>,
    last_activity: AtomicI64,
    meta: Mutex<SessionMeta>,
}

impl SessionCell {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self { id: Uuid::new_v4(), state, last_activity: AtomicI64::new(0), meta: Mutex::new(SessionMeta::default()) }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Move to `to` only if the current state is one of `from`.
    pub(crate) fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if from.contains(current) && *current != to {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Unconditionally set the state, returning the previous one.
    pub(crate) fn force(&self, to: SessionState) -> SessionState {
        self.state.send_replace(to)
    }

    /// Wake state subscribers without changing the state.
    pub(crate) fn notify(&self) {
        self.state.send_modify(|_| {});
    }

    pub(crate) fn touch(&self) {
        self.last_activity.store(frames::now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn set_endpoint(&self, endpoint: &str) {
        self.meta().endpoint = Some(endpoint.to_owned());
    }

    pub(crate) fn endpoint(&self) -> Option<String> {
        self.meta().endpoint.clone()
    }

    pub(crate) fn record_error(&self, message: impl Into<String>) {
        self.meta().last_error = Some(message.into());
    }

    pub(crate) fn clear_error(&self) {
        self.meta().last_error = None;
    }

    pub(crate) fn bump_reconnects(&self) {
        let mut meta = self.meta();
        meta.reconnects = meta.reconnects.saturating_add(1);
    }

    /// Mark closed; returns `false` if the session was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut meta = self.meta();
        !std::mem::replace(&mut meta.closed, true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.meta().closed
    }

    pub(crate) fn snapshot(&self) -> Session {
        let state = self.state();
        let meta = self.meta();
        let last = self.last_activity.load(Ordering::Relaxed);
        Session {
            id: self.id,
            endpoint: meta.endpoint.clone(),
            transport: if state == SessionState::Connected { TransportKind::Streaming } else { TransportKind::Http },
            state,
            last_activity_ms: (last > 0).then_some(last),
            reconnects: meta.reconnects,
            closed: meta.closed,
            last_error: meta.last_error.clone(),
        }
    }

    fn meta(&self) -> std::sync::MutexGuard<'_, SessionMeta> {
        self.meta.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// =============================================================================
// RESOURCE GAUGE
// =============================================================================

/// Counts live transport handles (stream channels, HTTP clients).
#[derive(Debug, Clone, Default)]
pub struct ResourceGauge {
    live: Arc<AtomicUsize>,
}

impl ResourceGauge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn acquire(&self) -> GaugeGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        GaugeGuard { live: Arc::clone(&self.live) }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Releases its handle slot on drop.
#[derive(Debug)]
pub struct GaugeGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
