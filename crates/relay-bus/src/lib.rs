use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Rooms with this prefix report membership to their subscribers.
pub const OBSERVABLE_PREFIX: &str = "observable-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Current occupancy, delivered once right after subscribing.
    Members(Vec<String>),
    MemberJoined(String),
    MemberLeft(String),
    Data { sender: String, payload: Bytes },
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay client {0} is not connected")]
    UnknownClient(String),
    #[error("client {client} is not subscribed to {room}")]
    NotSubscribed { client: String, room: String },
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Pub/sub relay surface: clients register, subscribe to named rooms and
/// publish payloads that fan out to every subscriber, the sender included.
pub trait Relay: Send + Sync {
    fn register(&self) -> String;
    fn subscribe(&self, client: &str, room: &str) -> RelayResult<mpsc::UnboundedReceiver<RelayEvent>>;
    fn unsubscribe(&self, client: &str, room: &str);
    fn publish(&self, client: &str, room: &str, payload: Bytes) -> RelayResult<()>;
    fn disconnect(&self, client: &str);
}

struct Subscriber {
    client: String,
    sender: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Default)]
struct Room {
    subscribers: Vec<Subscriber>,
}

impl Room {
    fn member_ids(&self) -> Vec<String> {
        self.subscribers.iter().map(|s| s.client.clone()).collect()
    }

    fn broadcast(&self, event: &RelayEvent) {
        for subscriber in &self.subscribers {
            let _ = subscriber.sender.send(event.clone());
        }
    }
}

/// In-memory relay for tests and the loopback demo.
#[derive(Default)]
pub struct LocalRelay {
    clients: RwLock<Vec<String>>,
    rooms: RwLock<HashMap<String, Room>>,
    next_client: AtomicU64,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self, room: &str) -> Vec<String> {
        self.rooms
            .read()
            .get(room)
            .map(Room::member_ids)
            .unwrap_or_default()
    }

    fn is_registered(&self, client: &str) -> bool {
        self.clients.read().iter().any(|id| id == client)
    }

    fn leave(&self, client: &str, room: &str) {
        let mut rooms = self.rooms.write();
        let Some(entry) = rooms.get_mut(room) else {
            return;
        };
        let before = entry.subscribers.len();
        entry.subscribers.retain(|s| s.client != client);
        if entry.subscribers.len() == before {
            return;
        }
        debug!(target: "relay", client, room, "member left");
        if room.starts_with(OBSERVABLE_PREFIX) {
            entry.broadcast(&RelayEvent::MemberLeft(client.to_string()));
        }
        if entry.subscribers.is_empty() {
            rooms.remove(room);
        }
    }
}

impl Relay for LocalRelay {
    fn register(&self) -> String {
        let id = format!("client-{}", self.next_client.fetch_add(1, Ordering::SeqCst) + 1);
        self.clients.write().push(id.clone());
        id
    }

    fn subscribe(&self, client: &str, room: &str) -> RelayResult<mpsc::UnboundedReceiver<RelayEvent>> {
        if !self.is_registered(client) {
            return Err(RelayError::UnknownClient(client.to_string()));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write();
        let entry = rooms.entry(room.to_string()).or_default();
        entry.subscribers.retain(|s| s.client != client);
        let observable = room.starts_with(OBSERVABLE_PREFIX);
        if observable {
            entry.broadcast(&RelayEvent::MemberJoined(client.to_string()));
        }
        entry.subscribers.push(Subscriber {
            client: client.to_string(),
            sender: sender.clone(),
        });
        if observable {
            let _ = sender.send(RelayEvent::Members(entry.member_ids()));
        }
        debug!(target: "relay", client, room, members = entry.subscribers.len(), "member joined");
        Ok(receiver)
    }

    fn unsubscribe(&self, client: &str, room: &str) {
        self.leave(client, room);
    }

    fn publish(&self, client: &str, room: &str, payload: Bytes) -> RelayResult<()> {
        let rooms = self.rooms.read();
        let entry = rooms.get(room).ok_or_else(|| RelayError::NotSubscribed {
            client: client.to_string(),
            room: room.to_string(),
        })?;
        if !entry.subscribers.iter().any(|s| s.client == client) {
            return Err(RelayError::NotSubscribed {
                client: client.to_string(),
                room: room.to_string(),
            });
        }
        trace!(target: "relay", client, room, len = payload.len(), "publish");
        entry.broadcast(&RelayEvent::Data {
            sender: client.to_string(),
            payload,
        });
        Ok(())
    }

    fn disconnect(&self, client: &str) {
        let joined: Vec<String> = self
            .rooms
            .read()
            .iter()
            .filter(|(_, room)| room.subscribers.iter().any(|s| s.client == client))
            .map(|(name, _)| name.clone())
            .collect();
        for room in joined {
            self.leave(client, &room);
        }
        self.clients.write().retain(|id| id != client);
    }
}
