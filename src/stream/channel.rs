//! Multiplexed streaming channel over one WebSocket.
//!
//! DESIGN
//! ======
//! A single I/O task owns the socket. Callers never touch it: outbound frames
//! go through an unbounded queue, so sends never block, and inbound replies
//! are routed to per-request receivers by `parent_id`.
//!
//! LIFECYCLE
//! =========
//! 1. `spawn` acquires a gauge slot and starts the I/O task.
//! 2. Requests register in the pending map, then enqueue their frame.
//! 3. Terminal replies (`done` / `error` / `cancel`) remove the entry.
//! 4. On exit every pending request gets a transport error, the gauge slot is
//!    released, and the exit reason is published on a `watch` channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use frames::{Frame, Interaction, Status};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::subscription::Subscription;
use crate::error::SdkError;
use crate::session::ResourceGauge;

pub(crate) type ReplySender = mpsc::UnboundedSender<Result<Frame, SdkError>>;
pub(crate) type ReplyReceiver = mpsc::UnboundedReceiver<Result<Frame, SdkError>>;

/// Why the I/O task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelExit {
    /// `shutdown` was requested or every handle was dropped.
    Shutdown,
    /// The socket failed or the peer went away.
    Dropped(String),
}

/// Options applied to every channel a connector builds.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub call_timeout: Duration,
    pub gauge: ResourceGauge,
}

#[derive(Default)]
struct Pending {
    replies: HashMap<String, ReplySender>,
    closed: bool,
}

type SharedPending = Arc<Mutex<Pending>>;

fn lock(pending: &SharedPending) -> std::sync::MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct ChannelInner {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: SharedPending,
    shutdown: CancellationToken,
    exit: watch::Receiver<Option<ChannelExit>>,
    task: Mutex<Option<JoinHandle<()>>>,
    call_timeout: Duration,
}

/// Cheaply cloneable handle to one streaming connection.
#[derive(Clone)]
pub struct StreamChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel").field("exit", &*self.inner.exit.borrow()).finish_non_exhaustive()
    }
}

impl StreamChannel {
    /// Take ownership of an established WebSocket and start the I/O task.
    pub fn spawn<S>(socket: WebSocketStream<S>, options: &ChannelOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (exit_tx, exit) = watch::channel(None);
        let pending: SharedPending = Arc::new(Mutex::new(Pending::default()));
        let shutdown = CancellationToken::new();

        let io = IoTask {
            socket,
            outbound: outbound_rx,
            pending: Arc::clone(&pending),
            shutdown: shutdown.clone(),
            exit: exit_tx,
            guard: options.gauge.acquire(),
        };
        let task = tokio::spawn(io.run());

        Self {
            inner: Arc::new(ChannelInner {
                outbound,
                pending,
                shutdown,
                exit,
                task: Mutex::new(Some(task)),
                call_timeout: options.call_timeout,
            }),
        }
    }

    /// `true` once the I/O task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.exit.borrow().is_some()
    }

    /// Number of requests awaiting a terminal reply.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.pending).replies.len()
    }

    /// Wait until the I/O task stops and report why.
    pub async fn closed(&self) -> ChannelExit {
        let mut exit = self.inner.exit.clone();
        loop {
            if let Some(reason) = exit.borrow_and_update().clone() {
                return reason;
            }
            if exit.changed().await.is_err() {
                return exit.borrow().clone().unwrap_or(ChannelExit::Shutdown);
            }
        }
    }

    /// Close the socket and wait for the I/O task to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let task = self.inner.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "stream: io task ended abnormally");
            }
        }
        self.closed().await;
    }

    /// Ask the I/O task to stop without waiting for it.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Send a request and wait for its single reply payload.
    ///
    /// # Errors
    ///
    /// Transport errors when the channel is down or the reply times out,
    /// [`SdkError::Remote`] for error frames, [`SdkError::Cancelled`] when
    /// `cancel` fires or the peer cancels.
    pub async fn request_response(
        &self,
        route: &str,
        data: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, SdkError> {
        let request = Frame::request(route, Interaction::RequestResponse, data);
        let mut replies = self.register(&request)?;

        let wait = async {
            loop {
                let Some(reply) = replies.recv().await else {
                    return Err(SdkError::Transport("stream closed".into()));
                };
                let frame = reply?;
                match frame.status {
                    Status::Item | Status::Done => return Ok(frame.data),
                    Status::Error => return Err(remote_error(&frame)),
                    Status::Cancel => return Err(SdkError::Cancelled),
                    Status::Request => {}
                }
            }
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.inner.call_timeout, wait) => match result {
                Ok(result) => result,
                Err(_) => {
                    self.abort(&request);
                    return Err(SdkError::Transport(format!("{route} timed out")));
                }
            },
            () = cancel.cancelled() => {
                self.abort(&request);
                return Err(SdkError::Cancelled);
            }
        };
        self.forget(&request.id);
        outcome
    }

    /// Open a request-stream and return its subscription.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the channel is down.
    pub fn request_stream(
        &self,
        route: &str,
        data: Value,
        cancel: CancellationToken,
    ) -> Result<Subscription, SdkError> {
        let request = Frame::request(route, Interaction::RequestStream, data);
        let replies = self.register(&request)?;
        Ok(Subscription::new(self.clone(), request, replies, cancel))
    }

    /// Enqueue a request that expects no reply.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the channel is down.
    pub fn fire_and_forget(&self, route: &str, data: Value) -> Result<(), SdkError> {
        if self.is_closed() {
            return Err(SdkError::Transport("stream closed".into()));
        }
        let request = Frame::request(route, Interaction::FireAndForget, data);
        self.inner.outbound.send(request).map_err(|_| SdkError::Transport("stream closed".into()))
    }

    fn register(&self, request: &Frame) -> Result<ReplyReceiver, SdkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut pending = lock(&self.inner.pending);
            if pending.closed {
                return Err(SdkError::Transport("stream closed".into()));
            }
            pending.replies.insert(request.id.clone(), tx);
        }
        if self.inner.outbound.send(request.clone()).is_err() {
            self.forget(&request.id);
            return Err(SdkError::Transport("stream closed".into()));
        }
        debug!(id = %request.id, route = %request.route, interaction = ?request.interaction, "stream: request sent");
        Ok(rx)
    }

    pub(crate) fn forget(&self, request_id: &str) {
        lock(&self.inner.pending).replies.remove(request_id);
    }

    /// Drop the pending entry and tell the peer to stop work on `request`.
    pub(crate) fn abort(&self, request: &Frame) {
        let removed = lock(&self.inner.pending).replies.remove(&request.id).is_some();
        if removed {
            debug!(id = %request.id, route = %request.route, "stream: cancel sent");
            let _ = self.inner.outbound.send(Frame::cancel(request));
        }
    }
}

pub(crate) fn remote_error(frame: &Frame) -> SdkError {
    SdkError::Remote {
        route: frame.route.clone(),
        code: frame.error_code().unwrap_or("E_UNKNOWN").to_owned(),
        message: frame.error_message().unwrap_or("request failed").to_owned(),
    }
}

// =============================================================================
// I/O TASK
// =============================================================================

struct IoTask<S> {
    socket: WebSocketStream<S>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    pending: SharedPending,
    shutdown: CancellationToken,
    exit: watch::Sender<Option<ChannelExit>>,
    guard: crate::session::GaugeGuard,
}

impl<S> IoTask<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let reason = self.pump().await;
        match &reason {
            ChannelExit::Shutdown => {
                let _ = self.socket.close(None).await;
                info!("stream: channel shut down");
            }
            ChannelExit::Dropped(why) => warn!(reason = %why, "stream: channel dropped"),
        }

        let orphaned: Vec<ReplySender> = {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            pending.replies.drain().map(|(_, tx)| tx).collect()
        };

        // Publish the exit before failing waiters so they observe a closed channel.
        let Self { exit, guard, socket, .. } = self;
        drop(socket);
        drop(guard);
        exit.send_replace(Some(reason));

        for tx in orphaned {
            let _ = tx.send(Err(SdkError::Transport("stream closed".into())));
        }
    }

    async fn pump(&mut self) -> ChannelExit {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return ChannelExit::Shutdown,
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else { return ChannelExit::Shutdown };
                    let bytes = frames::encode_frame(&frame);
                    if let Err(e) = self.socket.send(Message::Binary(bytes.into())).await {
                        return ChannelExit::Dropped(e.to_string());
                    }
                }
                message = self.socket.next() => match message {
                    None => return ChannelExit::Dropped("closed by peer".into()),
                    Some(Err(e)) => return ChannelExit::Dropped(e.to_string()),
                    Some(Ok(Message::Binary(bytes))) => self.route_inbound(&bytes),
                    Some(Ok(Message::Close(_))) => return ChannelExit::Dropped("closed by peer".into()),
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn route_inbound(&self, bytes: &[u8]) {
        let frame = match frames::decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "stream: undecodable frame dropped");
                return;
            }
        };

        let Some(parent_id) = frame.parent_id.clone() else {
            debug!(id = %frame.id, route = %frame.route, "stream: unsolicited frame ignored");
            return;
        };

        let mut pending = lock(&self.pending);
        let terminal = frame.status.is_terminal();
        let Some(tx) = pending.replies.get(&parent_id) else {
            debug!(parent_id = %parent_id, status = ?frame.status, "stream: reply for unknown request");
            return;
        };
        let delivered = tx.send(Ok(frame)).is_ok();
        if terminal || !delivered {
            pending.replies.remove(&parent_id);
        }
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
