//! Session manager: the single entry point for issuing requests.
//!
//! DESIGN
//! ======
//! The manager owns one streaming channel and one HTTP backend. Each call is
//! resolved by the [`RoutingPolicy`] into a streaming or HTTP call; callers
//! never see which transport served them. Session state lives in a `watch`
//! channel inside [`SessionCell`], written only from this module.
//!
//! LIFECYCLE
//! =========
//! 1. `connect` serializes on an async mutex, so concurrent callers collapse
//!    into one handshake. The first success spawns the supervisor.
//! 2. The supervisor watches the live channel. An unexpected drop starts a
//!    bounded backoff loop: one attempt per interval, never a storm.
//! 3. Streaming calls whose channel dropped under them wait for the
//!    supervisor (bounded by `call_timeout`) and retry up to
//!    `max_call_retries` times. A reply timeout on a live channel is final.
//!    Routes with an HTTP fallback skip the wait and go to HTTP.
//! 4. `close` (or dropping the last handle) stops the supervisor, shuts the
//!    channel down and drops the HTTP client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::SdkConfig;
use crate::error::{ErrorCode, SdkError};
use crate::http::{HttpBackend, HttpTransport};
use crate::routing::{Call, HttpCall, Interaction, Request, Response, RoutingPolicy, StreamCall};
use crate::session::{ResourceGauge, Session, SessionCell, SessionState};
use crate::stream::{ChannelExit, ChannelOptions, StreamChannel, StreamConnector, Subscription, WsConnector};

/// Cheaply cloneable handle; clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: SdkConfig,
    policy: RoutingPolicy,
    connector: Arc<dyn StreamConnector>,
    http: Mutex<Option<Arc<dyn HttpBackend>>>,
    channel: Mutex<Option<StreamChannel>>,
    session: SessionCell,
    gauge: ResourceGauge,
    connect_lock: tokio::sync::Mutex<()>,
    /// Set while the supervisor is between a drop and a successful reconnect.
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Where a streaming call can be served right now.
enum Availability {
    Live(StreamChannel),
    Pending,
    Unavailable(SdkError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").field("session", &self.inner.session.snapshot()).finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Build a manager on the WebSocket connector and, when an HTTP base URL
    /// is configured, a pooled `reqwest` backend.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Config`] when the config fails validation or the
    /// HTTP client cannot be built.
    pub fn new(config: SdkConfig, policy: RoutingPolicy) -> Result<Self, SdkError> {
        config.validate()?;
        let gauge = ResourceGauge::new();
        let connector: Arc<dyn StreamConnector> =
            Arc::new(WsConnector::new(config.handshake_timeout, config.auth_token.clone()));
        let http = match &config.http_base_url {
            Some(url) => {
                let transport = HttpTransport::new(url, config.auth_token.as_deref(), config.http, &gauge)?;
                Some(Arc::new(transport) as Arc<dyn HttpBackend>)
            }
            None => None,
        };
        Ok(Self::from_parts(config, policy, connector, http, gauge))
    }

    /// Build a manager on caller-supplied transports.
    ///
    /// Channels built by `connector` are counted on `gauge`; an HTTP backend
    /// that should show up in [`SessionManager::open_handles`] must acquire
    /// its slot from the same gauge.
    #[must_use]
    pub fn from_parts(
        config: SdkConfig,
        policy: RoutingPolicy,
        connector: Arc<dyn StreamConnector>,
        http: Option<Arc<dyn HttpBackend>>,
        gauge: ResourceGauge,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                policy,
                connector,
                http: Mutex::new(http),
                channel: Mutex::new(None),
                session: SessionCell::new(),
                gauge,
                connect_lock: tokio::sync::Mutex::new(()),
                reconnecting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Establish the streaming channel. No-op when already connected.
    ///
    /// # Errors
    ///
    /// [`SdkError::Connection`] when the endpoint is unreachable or the
    /// handshake times out; [`SdkError::Closed`] after `close`.
    pub async fn connect(&self, endpoint: &str) -> Result<(), SdkError> {
        self.ensure_open()?;
        let _serial = self.inner.connect_lock.lock().await;
        self.ensure_open()?;

        if self.inner.live_channel().is_some() {
            debug!(endpoint = %endpoint, "session: already connected");
            return Ok(());
        }

        self.inner.establish(endpoint).await?;
        self.spawn_supervisor();
        Ok(())
    }

    /// Connect to the configured `stream_url`.
    ///
    /// # Errors
    ///
    /// [`SdkError::Config`] when no stream URL is configured, otherwise as
    /// [`SessionManager::connect`].
    pub async fn connect_configured(&self) -> Result<(), SdkError> {
        let endpoint =
            self.inner.config.stream_url.clone().ok_or_else(|| SdkError::Config("no stream url configured".into()))?;
        self.connect(&endpoint).await
    }

    /// Release the streaming channel and the HTTP client. Idempotent.
    pub async fn close(&self) {
        if !self.inner.session.mark_closed() {
            return;
        }
        info!(session = %self.inner.session.snapshot().id, "session: closing");
        self.inner.session.force(SessionState::Closing);
        self.inner.shutdown.cancel();

        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(task) = supervisor {
            if let Err(e) = task.await {
                warn!(error = %e, "session: supervisor ended abnormally");
            }
        }

        // Wait out any handshake in progress; `establish` discards its result.
        let _serial = self.inner.connect_lock.lock().await;
        let channel = lock(&self.inner.channel).take();
        if let Some(channel) = channel {
            channel.shutdown().await;
        }
        lock(&self.inner.http).take();
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        self.inner.session.force(SessionState::Disconnected);
        info!(open_handles = self.inner.gauge.count(), "session: closed");
    }

    fn spawn_supervisor(&self) {
        let mut slot = lock(&self.inner.supervisor);
        if slot.is_none() {
            let weak = Arc::downgrade(&self.inner);
            let shutdown = self.inner.shutdown.clone();
            *slot = Some(tokio::spawn(supervise(weak, shutdown)));
        }
    }

    fn ensure_open(&self) -> Result<(), SdkError> {
        if self.inner.session.is_closed() { Err(SdkError::Closed) } else { Ok(()) }
    }

    // =========================================================================
    // CALLS
    // =========================================================================

    /// Dispatch `request` to whichever transport the routing policy picks.
    ///
    /// # Errors
    ///
    /// [`SdkError::NotConnected`] for streaming-only routes before `connect`,
    /// [`SdkError::Transport`] for network failures once retries are spent,
    /// [`SdkError::Protocol`] for malformed payloads, plus remote and HTTP
    /// status errors from the backend. Request-stream routes are collected
    /// whole and fail with [`SdkError::Transport`] when the stream has not
    /// finished within `call_timeout`.
    pub async fn call(&self, request: Request) -> Result<Response, SdkError> {
        self.call_with_cancel(request, &CancellationToken::new()).await
    }

    /// As [`SessionManager::call`], aborted with [`SdkError::Cancelled`] when
    /// `cancel` fires. Streaming calls send a `cancel` frame downstream.
    ///
    /// # Errors
    ///
    /// See [`SessionManager::call`].
    pub async fn call_with_cancel(&self, request: Request, cancel: &CancellationToken) -> Result<Response, SdkError> {
        self.ensure_open()?;
        let plan = self.inner.policy.resolve(&request, self.inner.streaming_attached())?;
        debug!(route = %request.route, transport = ?plan.call.transport(), "session: dispatch");

        let result = match plan.call {
            Call::Http(call) => self.execute_http(call, cancel).await,
            Call::Stream(call) => match plan.fallback {
                Some(fallback) if self.inner.live_channel().is_none() => {
                    debug!(route = %call.route, "session: streaming down, using http fallback");
                    self.execute_http(fallback, cancel).await
                }
                fallback => match self.execute_stream(&call, cancel, fallback.is_some()).await {
                    Err(e) if e.is_transport() || e.is_connection() => match fallback {
                        Some(fallback) => {
                            warn!(route = %call.route, error = %e, "session: streaming failed, using http fallback");
                            self.execute_http(fallback, cancel).await
                        }
                        None => Err(e),
                    },
                    other => other,
                },
            },
        };

        match &result {
            Ok(_) => self.inner.session.touch(),
            Err(e) => debug!(route = %request.route, error = %e, "session: call failed"),
        }
        result
    }

    /// Open a request-stream and return its subscription.
    ///
    /// # Errors
    ///
    /// As [`SessionManager::call`]; [`SdkError::Protocol`] when the route is
    /// served over HTTP only.
    pub async fn subscribe(&self, request: Request) -> Result<Subscription, SdkError> {
        self.subscribe_with_cancel(request, CancellationToken::new()).await
    }

    /// As [`SessionManager::subscribe`], ended when `cancel` fires.
    ///
    /// # Errors
    ///
    /// See [`SessionManager::subscribe`].
    pub async fn subscribe_with_cancel(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Subscription, SdkError> {
        self.ensure_open()?;
        let plan = self.inner.policy.resolve(&request, self.inner.streaming_attached())?;
        let Call::Stream(call) = plan.call else {
            return Err(SdkError::Protocol(format!("route {} cannot be subscribed over http", request.route)));
        };

        let mut retries = 0;
        loop {
            let channel = self.inner.wait_for_channel(&cancel).await?;
            match channel.request_stream(&call.route, call.data.clone(), cancel.clone()) {
                Ok(subscription) => {
                    self.inner.session.touch();
                    return Ok(subscription);
                }
                Err(e) if e.retryable() && channel.is_closed() && retries < self.inner.config.max_call_retries => {
                    retries += 1;
                    debug!(route = %call.route, retry = retries, "session: retrying subscribe");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `call` on the channel. Retries follow a channel drop only; with
    /// `has_fallback` the first drop is returned so the caller can use HTTP.
    async fn execute_stream(
        &self,
        call: &StreamCall,
        cancel: &CancellationToken,
        has_fallback: bool,
    ) -> Result<Response, SdkError> {
        let mut retries = 0;
        loop {
            let channel = self.inner.wait_for_channel(cancel).await?;
            let result = match call.interaction {
                Interaction::FireAndForget => {
                    return channel.fire_and_forget(&call.route, call.data.clone()).map(|()| Response::Empty);
                }
                Interaction::RequestResponse => {
                    channel.request_response(&call.route, call.data.clone(), cancel).await.map(|value| {
                        if value.is_null() { Response::Empty } else { Response::Single(value) }
                    })
                }
                Interaction::RequestStream => match channel.request_stream(&call.route, call.data.clone(), cancel.clone()) {
                    Ok(subscription) => self.collect_within_timeout(&call.route, subscription).await,
                    Err(e) => Err(e),
                },
            };

            let dropped = channel.is_closed();
            match result {
                Err(e) if e.retryable() && dropped && !has_fallback && retries < self.inner.config.max_call_retries => {
                    retries += 1;
                    debug!(route = %call.route, retry = retries, error = %e, "session: retrying streaming call");
                }
                other => return other,
            }
        }
    }

    /// Drain a request-stream, bounded by `call_timeout`. Dropping the
    /// subscription on timeout sends a `cancel` frame.
    async fn collect_within_timeout(&self, route: &str, subscription: Subscription) -> Result<Response, SdkError> {
        match tokio::time::timeout(self.inner.config.call_timeout, subscription.collect()).await {
            Ok(collected) => collected.map(Response::Many),
            Err(_) => Err(SdkError::Transport(format!("{route} timed out"))),
        }
    }

    async fn execute_http(&self, call: HttpCall, cancel: &CancellationToken) -> Result<Response, SdkError> {
        let backend = lock(&self.inner.http).clone().ok_or_else(|| {
            if self.inner.session.is_closed() {
                SdkError::Closed
            } else {
                SdkError::Config("no http base url configured".into())
            }
        })?;
        tokio::select! {
            result = backend.execute(call) => result,
            () = cancel.cancelled() => Err(SdkError::Cancelled),
        }
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    /// Read-only snapshot of the session.
    #[must_use]
    pub fn session(&self) -> Session {
        self.inner.session.snapshot()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    /// Live transport handles (streaming channels and HTTP clients).
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.inner.gauge.count()
    }

    /// Wait until the session reaches `state`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        let mut states = self.inner.session.subscribe();
        tokio::time::timeout(timeout, states.wait_for(|current| *current == state))
            .await
            .is_ok_and(|result| result.is_ok())
    }
}

// =============================================================================
// INNER
// =============================================================================

impl ManagerInner {
    fn live_channel(&self) -> Option<StreamChannel> {
        lock(&self.channel).as_ref().filter(|channel| !channel.is_closed()).cloned()
    }

    /// `true` once a channel has been established at least once.
    fn streaming_attached(&self) -> bool {
        self.session.endpoint().is_some()
    }

    fn availability(&self) -> Availability {
        let slot = lock(&self.channel);
        match slot.as_ref() {
            Some(channel) if !channel.is_closed() => return Availability::Live(channel.clone()),
            // Dropped but not yet noticed by the supervisor.
            Some(_) => return Availability::Pending,
            None => {}
        }
        drop(slot);

        if self.reconnecting.load(Ordering::SeqCst) || self.session.state() == SessionState::Connecting {
            return Availability::Pending;
        }
        if !self.streaming_attached() {
            return Availability::Unavailable(SdkError::NotConnected);
        }
        let reason = self.session.snapshot().last_error.unwrap_or_else(|| "disconnected".into());
        Availability::Unavailable(SdkError::Transport(format!("streaming channel unavailable: {reason}")))
    }

    /// Wait for a live channel while a reconnect is in progress.
    async fn wait_for_channel(&self, cancel: &CancellationToken) -> Result<StreamChannel, SdkError> {
        let mut states = self.session.subscribe();
        let wait = async {
            loop {
                if self.session.is_closed() {
                    return Err(SdkError::Closed);
                }
                match self.availability() {
                    Availability::Live(channel) => return Ok(channel),
                    Availability::Unavailable(e) => return Err(e),
                    Availability::Pending => {}
                }
                tokio::select! {
                    () = cancel.cancelled() => return Err(SdkError::Cancelled),
                    changed = states.changed() => {
                        if changed.is_err() {
                            return Err(SdkError::Closed);
                        }
                    }
                }
            }
        };
        tokio::time::timeout(self.config.call_timeout, wait)
            .await
            .map_err(|_| SdkError::Transport("timed out waiting for streaming reconnect".into()))?
    }

    /// Handshake and install a channel. Caller holds `connect_lock`.
    async fn establish(&self, endpoint: &str) -> Result<(), SdkError> {
        self.session.transition(&[SessionState::Disconnected, SessionState::Connected], SessionState::Connecting);
        let options = ChannelOptions { call_timeout: self.config.call_timeout, gauge: self.gauge.clone() };

        match self.connector.connect(endpoint, &options).await {
            Ok(channel) => {
                if self.session.is_closed() {
                    channel.shutdown().await;
                    return Err(SdkError::Closed);
                }
                *lock(&self.channel) = Some(channel);
                self.session.set_endpoint(endpoint);
                self.session.clear_error();
                self.session.touch();
                self.reconnecting.store(false, Ordering::SeqCst);
                self.session.transition(&[SessionState::Connecting], SessionState::Connected);
                info!(endpoint = %endpoint, "session: connected");
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "session: connect failed");
                self.session.record_error(e.to_string());
                self.session.transition(&[SessionState::Connecting], SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// One reconnect attempt, serialized with `connect`.
    async fn reattach(&self, attempt: u32) -> Result<(), SdkError> {
        let _serial = self.connect_lock.lock().await;
        if self.session.is_closed() {
            return Err(SdkError::Closed);
        }
        if self.live_channel().is_some() {
            // A caller reconnected while we were backing off.
            self.reconnecting.store(false, Ordering::SeqCst);
            self.session.transition(&[SessionState::Disconnected], SessionState::Connected);
            return Ok(());
        }
        let endpoint = self.session.endpoint().ok_or(SdkError::NotConnected)?;
        self.session.bump_reconnects();
        info!(endpoint = %endpoint, attempt, "session: reconnect attempt");
        self.establish(&endpoint).await
    }

    /// Record a drop observed by the supervisor. Returns `false` when a
    /// caller already replaced the dropped channel.
    fn mark_dropped(&self, reason: &str) -> bool {
        {
            let mut slot = lock(&self.channel);
            if slot.as_ref().is_some_and(|channel| !channel.is_closed()) {
                return false;
            }
            self.reconnecting.store(true, Ordering::SeqCst);
            *slot = None;
        }
        self.session.record_error(format!("stream dropped: {reason}"));
        self.session.transition(&[SessionState::Connected], SessionState::Disconnected);
        true
    }

    fn give_up(&self, attempts: u32) {
        warn!(attempts, "session: reconnect attempts exhausted");
        let last = self.session.snapshot().last_error.unwrap_or_default();
        self.session.record_error(format!("reconnect gave up after {attempts} attempts: {last}"));
        self.reconnecting.store(false, Ordering::SeqCst);
        self.session.transition(&[SessionState::Connecting], SessionState::Disconnected);
        self.session.notify();
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let channel = self.channel.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(channel) = channel {
            channel.request_shutdown();
        }
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

/// Watch the live channel and reconnect after unexpected drops.
///
/// Holds only a weak reference so dropping the last manager handle ends it.
async fn supervise(weak: Weak<ManagerInner>, shutdown: CancellationToken) {
    loop {
        let Some(channel) = next_channel(&weak, &shutdown).await else { return };
        let exit = tokio::select! {
            () = shutdown.cancelled() => return,
            exit = channel.closed() => exit,
        };
        drop(channel);

        // Only `close` shuts an installed channel down, and that is caught below.
        let reason = match exit {
            ChannelExit::Dropped(reason) => reason,
            ChannelExit::Shutdown => "channel shut down".to_owned(),
        };
        {
            let Some(inner) = weak.upgrade() else { return };
            if inner.session.is_closed() {
                return;
            }
            if !inner.mark_dropped(&reason) {
                continue;
            }
            warn!(reason = %reason, "session: stream dropped, reconnecting");
        }

        if !reconnect(&weak, &shutdown).await {
            return;
        }
    }
}

/// The installed channel, live or already closed. A channel that died before
/// the supervisor got here still has to be reported as a drop.
async fn next_channel(weak: &Weak<ManagerInner>, shutdown: &CancellationToken) -> Option<StreamChannel> {
    let mut states = weak.upgrade()?.session.subscribe();
    loop {
        {
            let inner = weak.upgrade()?;
            if inner.session.is_closed() {
                return None;
            }
            if let Some(channel) = lock(&inner.channel).clone() {
                return Some(channel);
            }
        }
        tokio::select! {
            () = shutdown.cancelled() => return None,
            changed = states.changed() => changed.ok()?,
        }
    }
}

/// Backoff loop. Returns `false` when the supervisor should stop.
///
/// Exhausting the schedule is not a stop: the supervisor goes back to waiting
/// for a caller to `connect` again.
async fn reconnect(weak: &Weak<ManagerInner>, shutdown: &CancellationToken) -> bool {
    let Some(config) = weak.upgrade().map(|inner| inner.config.backoff) else { return false };
    let mut backoff = Backoff::new(config);

    loop {
        let Some(delay) = backoff.next_delay() else {
            if let Some(inner) = weak.upgrade() {
                inner.give_up(backoff.attempt());
            }
            return true;
        };
        debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), attempt = backoff.attempt(), "session: backing off");
        tokio::select! {
            () = shutdown.cancelled() => return false,
            () = tokio::time::sleep(delay) => {}
        }

        let Some(inner) = weak.upgrade() else { return false };
        match inner.reattach(backoff.attempt()).await {
            Ok(()) => return true,
            Err(SdkError::Closed) => return false,
            Err(e) => debug!(error = %e, attempt = backoff.attempt(), "session: reconnect attempt failed"),
        }
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;
