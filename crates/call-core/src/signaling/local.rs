use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_bus::{LocalRelay, Relay, RelayEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{RoomEvent, SignalingChannel, SignalingConnection, SignalingMessage};
use crate::error::SignalingError;

/// In-process signaling over a shared [`LocalRelay`].
#[derive(Clone, Default)]
pub struct LocalSignaling {
    relay: Arc<LocalRelay>,
}

impl LocalSignaling {
    pub fn new(relay: Arc<LocalRelay>) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Arc<LocalRelay> {
        &self.relay
    }
}

#[async_trait]
impl SignalingChannel for LocalSignaling {
    async fn connect(&self, channel_id: &str) -> Result<Arc<dyn SignalingConnection>, SignalingError> {
        if channel_id.trim().is_empty() {
            return Err(SignalingError::Connect {
                channel: channel_id.to_string(),
                reason: "empty channel id".into(),
            });
        }
        let client_id = self.relay.register();
        debug!(target: "call::signaling", channel = channel_id, client = %client_id, "local relay connected");
        Ok(Arc::new(LocalConnection {
            relay: Arc::clone(&self.relay),
            client_id,
            forwarders: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LocalConnection {
    relay: Arc<LocalRelay>,
    client_id: String,
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl SignalingConnection for LocalConnection {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    async fn subscribe(&self, room: &str) -> Result<mpsc::UnboundedReceiver<RoomEvent>, SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let mut relay_rx = self
            .relay
            .subscribe(&self.client_id, room)
            .map_err(|err| SignalingError::Subscribe {
                room: room.to_string(),
                reason: err.to_string(),
            })?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RoomEvent::Opened);
        let room_name = room.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = relay_rx.recv().await {
                let mapped = match event {
                    RelayEvent::Members(members) => RoomEvent::Members(members),
                    RelayEvent::MemberJoined(id) => RoomEvent::MemberJoined(id),
                    RelayEvent::MemberLeft(id) => RoomEvent::MemberLeft(id),
                    RelayEvent::Data { sender, payload } => match SignalingMessage::decode(&payload) {
                        Ok(message) => RoomEvent::Data { message, sender },
                        Err(err) => {
                            warn!(target: "call::signaling", room = %room_name, %sender, error = %err, "dropping undecodable message");
                            continue;
                        }
                    },
                };
                if tx.send(mapped).is_err() {
                    return;
                }
            }
            let _ = tx.send(RoomEvent::Closed);
        });
        if let Some(previous) = self.forwarders.lock().insert(room.to_string(), forwarder) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn publish(&self, room: &str, message: &SignalingMessage) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let payload = Bytes::from(message.encode()?);
        self.relay
            .publish(&self.client_id, room, payload)
            .map_err(|err| SignalingError::Publish {
                room: room.to_string(),
                reason: err.to_string(),
            })
    }

    async fn unsubscribe(&self, room: &str) {
        self.relay.unsubscribe(&self.client_id, room);
        if let Some(forwarder) = self.forwarders.lock().remove(room) {
            forwarder.abort();
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.relay.disconnect(&self.client_id);
        for (_, forwarder) in self.forwarders.lock().drain() {
            forwarder.abort();
        }
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.relay.disconnect(&self.client_id);
        }
        for (_, forwarder) in self.forwarders.get_mut().drain() {
            forwarder.abort();
        }
    }
}
