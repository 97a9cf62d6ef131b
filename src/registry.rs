//! Live room membership for connected sessions.
//!
//! A room is keyed by project id and holds the connection ids bound to it.
//! The outer maps are only locked to find, insert or drop entries; joins and
//! leaves take the single room's write lock and broadcasts its read lock, so
//! traffic in one project never waits on another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::messages::ServerMessage;

pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

#[derive(Default)]
struct RoomMembers {
    connections: HashSet<String>,
    // Set once the last connection leaves; the entry is then unlinked and
    // must not be joined again.
    closed: bool,
}

struct ConnectionEntry {
    outbound: Outbound,
    rooms: Mutex<HashSet<String>>,
}

type Rooms = RwLock<HashMap<String, Arc<RwLock<RoomMembers>>>>;
type Connections = RwLock<HashMap<String, Arc<ConnectionEntry>>>;

#[derive(Default)]
pub struct RoomRegistry {
    rooms: Rooms,
    connections: Connections,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connection_id` a delivery target. Must precede `join`.
    pub async fn register(&self, connection_id: &str, outbound: Outbound) {
        let mut connections = self.connections.write().await;
        connections.insert(
            connection_id.to_string(),
            Arc::new(ConnectionEntry {
                outbound,
                rooms: Mutex::new(HashSet::new()),
            }),
        );
    }

    /// Leaves every room and drops the delivery endpoint.
    pub async fn unregister(&self, connection_id: &str) -> Vec<String> {
        let left = self.leave_all(connection_id).await;
        self.connections.write().await.remove(connection_id);
        left
    }

    /// Binds a connection to a room. Returns `Some(false)` if it was already
    /// bound and `None` if the connection is not registered.
    pub async fn join(&self, room_id: &str, connection_id: &str) -> Option<bool> {
        let Some(entry) = self.connection(connection_id).await else {
            warn!("join for unregistered connection {}", connection_id);
            return None;
        };
        let mut rooms_of = entry.rooms.lock().await;

        loop {
            let room = self.room_or_insert(room_id).await;
            let mut members = room.write().await;
            if members.closed {
                // Lost a race with the last leaver; pick up the fresh entry.
                drop(members);
                tokio::task::yield_now().await;
                continue;
            }
            let inserted = members.connections.insert(connection_id.to_string());
            rooms_of.insert(room_id.to_string());
            if inserted {
                debug!("{} joined room {}", connection_id, room_id);
            }
            return Some(inserted);
        }
    }

    /// Unbinds a connection from a room. Returns `false` if it was not bound.
    pub async fn leave(&self, room_id: &str, connection_id: &str) -> bool {
        if let Some(entry) = self.connection(connection_id).await {
            entry.rooms.lock().await.remove(room_id);
        }
        self.detach(room_id, connection_id).await
    }

    /// Unbinds a connection from every room it joined.
    pub async fn leave_all(&self, connection_id: &str) -> Vec<String> {
        let Some(entry) = self.connection(connection_id).await else {
            return Vec::new();
        };
        let joined: Vec<String> = entry.rooms.lock().await.drain().collect();
        for room_id in &joined {
            self.detach(room_id, connection_id).await;
        }
        joined
    }

    /// Delivers `payload` to every connection in the room, sender included.
    /// Returns how many connections accepted it.
    pub async fn broadcast(&self, room_id: &str, payload: &ServerMessage) -> usize {
        let Some(room) = self.rooms.read().await.get(room_id).cloned() else {
            return 0;
        };
        let members = room.read().await;
        let connections = self.connections.read().await;

        let mut delivered = 0;
        for connection_id in &members.connections {
            if let Some(entry) = connections.get(connection_id) {
                if entry.outbound.send(payload.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Delivers to a single connection regardless of rooms.
    pub async fn send_to(&self, connection_id: &str, payload: ServerMessage) -> bool {
        match self.connection(connection_id).await {
            Some(entry) => entry.outbound.send(payload).is_ok(),
            None => false,
        }
    }

    pub async fn is_joined(&self, room_id: &str, connection_id: &str) -> bool {
        let room = self.rooms.read().await.get(room_id).cloned();
        match room {
            Some(room) => room.read().await.connections.contains(connection_id),
            None => false,
        }
    }

    pub async fn rooms_of(&self, connection_id: &str) -> HashSet<String> {
        match self.connection(connection_id).await {
            Some(entry) => entry.rooms.lock().await.clone(),
            None => HashSet::new(),
        }
    }

    pub async fn members_of(&self, room_id: &str) -> HashSet<String> {
        let room = self.rooms.read().await.get(room_id).cloned();
        match room {
            Some(room) => room.read().await.connections.clone(),
            None => HashSet::new(),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Drops every room and connection, closing all outbound channels.
    pub async fn clear(&self) {
        self.connections.write().await.clear();
        self.rooms.write().await.clear();
    }

    async fn connection(&self, connection_id: &str) -> Option<Arc<ConnectionEntry>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    async fn room_or_insert(&self, room_id: &str) -> Arc<RwLock<RoomMembers>> {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return Arc::clone(room);
        }
        let mut rooms = self.rooms.write().await;
        Arc::clone(rooms.entry(room_id.to_string()).or_default())
    }

    async fn detach(&self, room_id: &str, connection_id: &str) -> bool {
        let Some(room) = self.rooms.read().await.get(room_id).cloned() else {
            return false;
        };

        let (removed, emptied) = {
            let mut members = room.write().await;
            let removed = members.connections.remove(connection_id);
            let emptied = members.connections.is_empty() && !members.closed;
            if emptied {
                members.closed = true;
            }
            (removed, emptied)
        };

        if emptied {
            let mut rooms = self.rooms.write().await;
            if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, &room)) {
                rooms.remove(room_id);
                debug!("room {} freed", room_id);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ServerMessage;

    fn ping(room: &str) -> ServerMessage {
        ServerMessage::RoomJoined {
            project_id: room.to_string(),
        }
    }

    async fn connect(
        registry: &RoomRegistry,
        id: &str,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id, tx).await;
        rx
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let registry = RoomRegistry::new();
        let _rx = connect(&registry, "c1").await;

        assert_eq!(registry.join("p1", "c1").await, Some(true));
        assert_eq!(registry.join("p1", "c1").await, Some(false));
        assert_eq!(registry.members_of("p1").await.len(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_joined_connection_including_sender() {
        let registry = RoomRegistry::new();
        let mut rx1 = connect(&registry, "c1").await;
        let mut rx2 = connect(&registry, "c2").await;
        let mut rx3 = connect(&registry, "c3").await;
        registry.join("p1", "c1").await;
        registry.join("p1", "c2").await;
        registry.join("p2", "c3").await;

        assert_eq!(registry.broadcast("p1", &ping("p1")).await, 2);
        assert_eq!(rx1.try_recv().unwrap(), ping("p1"));
        assert_eq!(rx2.try_recv().unwrap(), ping("p1"));
        assert!(rx3.try_recv().is_err());
        assert_eq!(registry.broadcast("nobody", &ping("nobody")).await, 0);
    }

    #[tokio::test]
    async fn last_leave_frees_the_room() {
        let registry = RoomRegistry::new();
        let _rx1 = connect(&registry, "c1").await;
        let _rx2 = connect(&registry, "c2").await;
        registry.join("p1", "c1").await;
        registry.join("p1", "c2").await;

        assert!(registry.leave("p1", "c1").await);
        assert_eq!(registry.room_count().await, 1);
        assert!(registry.leave("p1", "c2").await);
        assert_eq!(registry.room_count().await, 0);
        assert!(!registry.leave("p1", "c2").await);

        // A freed room can be joined again.
        assert_eq!(registry.join("p1", "c1").await, Some(true));
        assert!(registry.is_joined("p1", "c1").await);
    }

    #[tokio::test]
    async fn leave_all_clears_every_binding() {
        let registry = RoomRegistry::new();
        let mut rx1 = connect(&registry, "c1").await;
        let _rx2 = connect(&registry, "c2").await;
        registry.join("p1", "c1").await;
        registry.join("p2", "c1").await;
        registry.join("p2", "c2").await;

        let mut left = registry.leave_all("c1").await;
        left.sort();
        assert_eq!(left, ["p1", "p2"]);
        assert!(registry.rooms_of("c1").await.is_empty());
        assert_eq!(registry.room_count().await, 1);

        assert_eq!(registry.broadcast("p2", &ping("p2")).await, 1);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_drops_connection_and_rooms() {
        let registry = RoomRegistry::new();
        let _rx = connect(&registry, "c1").await;
        registry.join("p1", "c1").await;

        registry.unregister("c1").await;
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.room_count().await, 0);
        assert_eq!(registry.join("p1", "c1").await, None);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_join_and_leave_leave_no_orphans() {
        let registry = Arc::new(RoomRegistry::new());
        let mut receivers = Vec::new();
        for i in 0..16 {
            receivers.push(connect(&registry, &format!("c{i}")).await);
        }

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let id = format!("c{i}");
                    for _ in 0..25 {
                        registry.join("p1", &id).await;
                        registry.leave("p1", &id).await;
                    }
                    if i % 2 == 0 {
                        registry.join("p1", &id).await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.members_of("p1").await.len(), 8);
        assert_eq!(registry.broadcast("p1", &ping("p1")).await, 8);
    }
}
