//! Incremental consumer for a request-stream.

use frames::{Frame, Status};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::channel::{ReplyReceiver, StreamChannel, remote_error};
use crate::error::SdkError;

/// Items of one open request-stream.
///
/// Cancelling the token, calling [`Subscription::cancel`], or dropping the
/// subscription before completion sends a `cancel` frame downstream.
pub struct Subscription {
    channel: StreamChannel,
    request: Frame,
    replies: ReplyReceiver,
    cancel: CancellationToken,
    finished: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.request.id)
            .field("route", &self.request.route)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(channel: StreamChannel, request: Frame, replies: ReplyReceiver, cancel: CancellationToken) -> Self {
        Self { channel, request, replies, cancel, finished: false }
    }

    /// Request id used on the wire.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.request.id
    }

    #[must_use]
    pub fn route(&self) -> &str {
        &self.request.route
    }

    /// Token that cancels this subscription when triggered.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next item; `None` once the stream completed or was cancelled.
    pub async fn next(&mut self) -> Option<Result<Value, SdkError>> {
        if self.finished {
            return None;
        }

        loop {
            let reply = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.finish_with_cancel();
                    return Some(Err(SdkError::Cancelled));
                }
                reply = self.replies.recv() => reply,
            };

            let frame = match reply {
                None => {
                    self.finished = true;
                    return Some(Err(SdkError::Transport("stream closed".into())));
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Some(Ok(frame)) => frame,
            };

            match frame.status {
                Status::Item => return Some(Ok(frame.data)),
                Status::Done => {
                    self.finished = true;
                    return None;
                }
                Status::Error => {
                    self.finished = true;
                    return Some(Err(remote_error(&frame)));
                }
                Status::Cancel => {
                    self.finished = true;
                    return Some(Err(SdkError::Cancelled));
                }
                Status::Request => {}
            }
        }
    }

    /// Drain the stream into a list.
    ///
    /// # Errors
    ///
    /// Returns the first error the stream yields.
    pub async fn collect(mut self) -> Result<Vec<Value>, SdkError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Stop the stream and notify the peer.
    pub fn cancel(&mut self) {
        if !self.finished {
            self.finish_with_cancel();
        }
    }

    fn finish_with_cancel(&mut self) {
        self.finished = true;
        self.channel.abort(&self.request);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.finished {
            self.channel.abort(&self.request);
        }
    }
}
