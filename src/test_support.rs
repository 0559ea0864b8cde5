//! In-memory streaming backend and connector for tests.
//!
//! Sockets are real WebSocket streams over `tokio::io::duplex`, so the channel
//! code under test runs unchanged.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use frames::{Frame, Status};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::DuplexStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;

use crate::error::SdkError;
use crate::stream::{ChannelOptions, StreamChannel, StreamConnector};

pub(crate) async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
    (client, server)
}

/// Handle to one running fake backend connection.
#[derive(Clone, Default)]
pub(crate) struct BackendHandle {
    pub received: Arc<Mutex<Vec<Frame>>>,
    pub kill: CancellationToken,
}

impl BackendHandle {
    pub fn received(&self) -> Vec<Frame> {
        self.received.lock().expect("received lock").clone()
    }

    pub fn cancels(&self) -> Vec<Frame> {
        self.received().into_iter().filter(|f| f.status == Status::Cancel).collect()
    }

    /// Drop the connection from the server side.
    pub fn drop_connection(&self) {
        self.kill.cancel();
    }
}

/// Serve the scripted routes on `socket` until killed or the client leaves.
///
/// - `echo` → done with the request data
/// - `items` → `data.count` items then done
/// - `endless` → an item every 10ms until cancelled
/// - `fail` → error frame
/// - `hang`, `stall*` → never answers
/// - `garbage` → an undecodable message, then done
/// - `chats.*` → canned chat data
/// - anything else → done with `{"route": <route>}`
pub(crate) fn spawn_backend(mut socket: WebSocketStream<DuplexStream>) -> BackendHandle {
    let handle = BackendHandle::default();
    let task_handle = handle.clone();

    tokio::spawn(async move {
        let mut endless: Vec<Frame> = Vec::new();
        let mut tick = tokio::time::interval(Duration::from_millis(10));
        loop {
            tokio::select! {
                () = task_handle.kill.cancelled() => return,
                _ = tick.tick(), if !endless.is_empty() => {
                    for req in &endless {
                        if send(&mut socket, &req.item(json!({"tick": true}))).await.is_err() {
                            return;
                        }
                    }
                }
                msg = socket.next() => {
                    let Some(Ok(msg)) = msg else { return };
                    let Message::Binary(bytes) = msg else { continue };
                    let Ok(req) = frames::decode_frame(&bytes) else { continue };
                    task_handle.received.lock().expect("received lock").push(req.clone());

                    if req.status == Status::Cancel {
                        endless.retain(|open| Some(open.id.as_str()) != req.parent_id.as_deref());
                        continue;
                    }
                    if answer(&mut socket, &req, &mut endless).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    handle
}

async fn answer(
    socket: &mut WebSocketStream<DuplexStream>,
    req: &Frame,
    endless: &mut Vec<Frame>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match req.route.as_str() {
        "echo" => send(socket, &req.done(req.data.clone())).await,
        "items" => {
            let count = req.data.get("count").and_then(serde_json::Value::as_u64).unwrap_or(0);
            for n in 0..count {
                send(socket, &req.item(json!({"n": n}))).await?;
            }
            send(socket, &req.done(serde_json::Value::Null)).await
        }
        "endless" => {
            endless.push(req.clone());
            Ok(())
        }
        "fail" => send(socket, &req.error("E_TEST", "boom")).await,
        "hang" => Ok(()),
        route if route.starts_with("stall") => Ok(()),
        "garbage" => {
            socket.send(Message::Binary(vec![0xff, 0x00, 0x13].into())).await?;
            send(socket, &req.done(req.data.clone())).await
        }
        route if route.starts_with("chats.") => answer_chat(socket, req).await,
        _ if req.interaction == frames::Interaction::FireAndForget => Ok(()),
        route => send(socket, &req.done(json!({"route": route}))).await,
    }
}

/// Chat routes with canned data derived from the request.
async fn answer_chat(
    socket: &mut WebSocketStream<DuplexStream>,
    req: &Frame,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let field = |key: &str| req.data.get(key).and_then(serde_json::Value::as_str).unwrap_or_default().to_owned();
    let message = |chat_id: &str, n: u64| {
        json!({
            "id": format!("m{n}"),
            "chatId": chat_id,
            "senderId": "u1",
            "content": format!("hello {n}"),
            "timestamp": 1_700_000_000_000_i64 + i64::try_from(n).unwrap_or_default(),
        })
    };

    match req.route.as_str() {
        "chats.getAll" => {
            let user = field("userId");
            for peer in ["u2", "u3"] {
                send(socket, &req.item(json!({"id": format!("{user}-{peer}"), "user1Id": user, "user2Id": peer}))).await?;
            }
            send(socket, &req.done(serde_json::Value::Null)).await
        }
        "chats.getMessages" => {
            let chat_id = field("chatId");
            let size = req.data.get("size").and_then(serde_json::Value::as_u64).unwrap_or(0);
            for n in 0..size {
                send(socket, &req.item(message(&chat_id, n))).await?;
            }
            send(socket, &req.done(serde_json::Value::Null)).await
        }
        "chats.getOrCreate" => {
            let (a, b) = (field("user1Id"), field("user2Id"));
            send(socket, &req.done(json!({"id": format!("{a}-{b}"), "user1Id": a, "user2Id": b, "lastMessage": "hi"}))).await
        }
        "chats.streamMessages" => {
            let chat_id = req.data.as_str().unwrap_or_default().to_owned();
            for n in 0..2 {
                send(socket, &req.item(message(&chat_id, n))).await?;
            }
            send(socket, &req.done(serde_json::Value::Null)).await
        }
        "chats.getUnreadCount" => send(socket, &req.done(json!({"count": 3}))).await,
        "chats.hasChats" => send(socket, &req.done(json!(req.data.as_str() != Some("lonely")))).await,
        _ => send(socket, &req.error("E_NOT_FOUND", "unknown chat route")).await,
    }
}

async fn send(
    socket: &mut WebSocketStream<DuplexStream>,
    frame: &Frame,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    socket.send(Message::Binary(frames::encode_frame(frame).into())).await
}

/// Connect a channel to a fresh fake backend.
pub(crate) async fn connected_channel(options: &ChannelOptions) -> (StreamChannel, BackendHandle) {
    let (client, server) = ws_pair().await;
    let backend = spawn_backend(server);
    (StreamChannel::spawn(client, options), backend)
}

// =============================================================================
// CONNECTOR
// =============================================================================

/// Connector that builds in-memory channels and can be told to refuse.
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    pub attempts: Arc<AtomicUsize>,
    /// Attempt timestamps, for asserting reconnect pacing.
    pub attempt_times: Arc<Mutex<Vec<tokio::time::Instant>>>,
    /// Refuse this many upcoming attempts.
    pub refuse_next: Arc<AtomicUsize>,
    pub backends: Arc<Mutex<Vec<BackendHandle>>>,
}

impl FakeConnector {
    pub fn refuse(&self, attempts: usize) {
        self.refuse_next.store(attempts, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn latest_backend(&self) -> BackendHandle {
        self.backends.lock().expect("backends lock").last().cloned().expect("at least one backend")
    }

    pub fn attempt_times(&self) -> Vec<tokio::time::Instant> {
        self.attempt_times.lock().expect("times lock").clone()
    }
}

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn connect(&self, endpoint: &str, options: &ChannelOptions) -> Result<StreamChannel, SdkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempt_times.lock().expect("times lock").push(tokio::time::Instant::now());

        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SdkError::connection(endpoint, "connection refused"));
        }

        let (channel, backend) = connected_channel(options).await;
        self.backends.lock().expect("backends lock").push(backend);
        Ok(channel)
    }
}
