use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use tracing::{debug, trace, warn};
use url::Url;

use super::{RoomEvent, SignalingChannel, SignalingConnection, SignalingMessage};
use crate::error::SignalingError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayClientMessage {
    Hello { channel: String },
    Subscribe { room: String },
    Unsubscribe { room: String },
    Publish { room: String, message: Value },
    Ping,
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayServerMessage {
    Welcome { client_id: String },
    Members { room: String, members: Vec<String> },
    MemberJoined { room: String, member: String },
    MemberLeft { room: String, member: String },
    Data { room: String, sender: String, message: Value },
    Error { message: String },
    Pong,
}

type RoomSinks = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<RoomEvent>>>>;

/// Relay client speaking JSON frames over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketSignaling {
    url: Url,
}

impl WebSocketSignaling {
    pub fn new(relay_url: &str) -> Result<Self, SignalingError> {
        let url = derive_websocket_url(relay_url)?;
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    async fn connect(&self, channel_id: &str) -> Result<Arc<dyn SignalingConnection>, SignalingError> {
        let connection = WebSocketConnection::connect(&self.url, channel_id).await?;
        Ok(connection)
    }
}

struct WebSocketConnection {
    client_id: String,
    send_tx: Mutex<Option<mpsc::UnboundedSender<RelayClientMessage>>>,
    rooms: RoomSinks,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebSocketConnection {
    async fn connect(url: &Url, channel_id: &str) -> Result<Arc<Self>, SignalingError> {
        let connect_err = |reason: String| SignalingError::Connect {
            channel: channel_id.to_string(),
            reason,
        };
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| connect_err(format!("websocket connect failed: {err}")))?;
        debug!(target: "call::signaling", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<RelayClientMessage>();
        let rooms: RoomSinks = Arc::new(Mutex::new(HashMap::new()));
        let (welcome_tx, welcome_rx) = oneshot::channel::<String>();

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if let Ok(text) = serde_json::to_string(&message) {
                    if ws_write.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        let reader_rooms = Arc::clone(&rooms);
        let reader_handle = tokio::spawn(async move {
            let mut welcome = Some(welcome_tx);
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target: "call::signaling", "relay websocket closed: {err}");
                            }
                            _ => warn!(target: "call::signaling", "relay websocket error: {err}"),
                        }
                        break;
                    }
                };
                trace!(target: "call::signaling", event = "ws_in", len = text.len());
                match serde_json::from_str::<RelayServerMessage>(&text) {
                    Ok(message) => route_server_message(&reader_rooms, message, &mut welcome),
                    Err(err) => {
                        warn!(target: "call::signaling", error = %err, "unrecognised relay frame")
                    }
                }
            }
            for (_, sink) in reader_rooms.lock().drain() {
                let _ = sink.send(RoomEvent::Closed);
            }
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(RelayClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let abort_all = || {
            writer_handle.abort();
            reader_handle.abort();
            heartbeat_handle.abort();
        };

        if send_tx
            .send(RelayClientMessage::Hello {
                channel: channel_id.to_string(),
            })
            .is_err()
        {
            abort_all();
            return Err(SignalingError::Closed);
        }

        let client_id = match welcome_rx.await {
            Ok(id) => id,
            Err(_) => {
                abort_all();
                return Err(connect_err("relay closed before welcome".into()));
            }
        };
        debug!(target: "call::signaling", client = %client_id, channel = channel_id, "relay welcome received");

        Ok(Arc::new(Self {
            client_id,
            send_tx: Mutex::new(Some(send_tx)),
            rooms,
            tasks: Mutex::new(vec![writer_handle, reader_handle, heartbeat_handle]),
            closed: AtomicBool::new(false),
        }))
    }

    fn send(&self, message: RelayClientMessage) -> Result<(), SignalingError> {
        let guard = self.send_tx.lock();
        let sender = guard.as_ref().ok_or(SignalingError::Closed)?;
        sender.send(message).map_err(|_| SignalingError::Closed)
    }
}

fn route_server_message(
    rooms: &RoomSinks,
    message: RelayServerMessage,
    welcome: &mut Option<oneshot::Sender<String>>,
) {
    let deliver = |room: &str, event: RoomEvent| {
        if let Some(sink) = rooms.lock().get(room) {
            let _ = sink.send(event);
        }
    };
    match message {
        RelayServerMessage::Welcome { client_id } => {
            if let Some(tx) = welcome.take() {
                let _ = tx.send(client_id);
            }
        }
        RelayServerMessage::Members { room, members } => deliver(&room, RoomEvent::Members(members)),
        RelayServerMessage::MemberJoined { room, member } => {
            deliver(&room, RoomEvent::MemberJoined(member))
        }
        RelayServerMessage::MemberLeft { room, member } => deliver(&room, RoomEvent::MemberLeft(member)),
        RelayServerMessage::Data {
            room,
            sender,
            message,
        } => match serde_json::from_value::<SignalingMessage>(message) {
            Ok(message) => deliver(&room, RoomEvent::Data { message, sender }),
            Err(err) => {
                warn!(target: "call::signaling", %room, %sender, error = %err, "dropping undecodable message")
            }
        },
        RelayServerMessage::Error { message } => {
            warn!(target: "call::signaling", %message, "relay reported error")
        }
        RelayServerMessage::Pong => trace!(target: "call::signaling", "pong"),
    }
}

#[async_trait]
impl SignalingConnection for WebSocketConnection {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    async fn subscribe(&self, room: &str) -> Result<mpsc::UnboundedReceiver<RoomEvent>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RoomEvent::Opened);
        self.rooms.lock().insert(room.to_string(), tx);
        if let Err(err) = self.send(RelayClientMessage::Subscribe {
            room: room.to_string(),
        }) {
            self.rooms.lock().remove(room);
            return Err(SignalingError::Subscribe {
                room: room.to_string(),
                reason: err.to_string(),
            });
        }
        Ok(rx)
    }

    async fn publish(&self, room: &str, message: &SignalingMessage) -> Result<(), SignalingError> {
        let message =
            serde_json::to_value(message).map_err(|err| SignalingError::Protocol(err.to_string()))?;
        self.send(RelayClientMessage::Publish {
            room: room.to_string(),
            message,
        })
    }

    async fn unsubscribe(&self, room: &str) {
        self.rooms.lock().remove(room);
        let _ = self.send(RelayClientMessage::Unsubscribe {
            room: room.to_string(),
        });
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the last sender lets the writer flush and send a close frame.
        self.send_tx.lock().take();
        let mut tasks = self.tasks.lock();
        for (index, handle) in tasks.drain(..).enumerate() {
            if index > 0 {
                handle.abort();
            }
        }
        self.rooms.lock().clear();
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Accepts `ws(s)://` URLs as is and maps `http(s)://` to the matching
/// WebSocket scheme.
pub fn derive_websocket_url(relay_url: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::Connect {
        channel: relay_url.to_string(),
        reason,
    };
    let mut url =
        Url::parse(relay_url).map_err(|err| invalid(format!("invalid relay url: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported relay url scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}
