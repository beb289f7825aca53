//! In-process bookkeeping of live connections: which user each connection
//! belongs to and which rooms it has joined. Mutated only by connection
//! lifecycle events; delivery routing reads it.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use solace_types::events::ServerEvent;

pub type ConnId = Uuid;

/// A broadcast group: a conversation, or a user's personal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Conversation(Uuid),
    User(Uuid),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "{}", id),
            Self::User(id) => write!(f, "user:{}", id),
        }
    }
}

struct LiveConnection {
    user_id: Option<Uuid>,
    rooms: HashSet<Room>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// What a `register` call changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Registration {
    /// The user had no live connection before this one.
    pub came_online: bool,
    /// The connection previously belonged to this user, who has no other
    /// live connection left.
    pub displaced_offline: Option<Uuid>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnId, LiveConnection>,
    rooms: HashMap<Room, HashSet<ConnId>>,
    users: HashMap<Uuid, HashSet<ConnId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a freshly opened connection. It belongs to no user until
    /// `register` is called.
    pub fn connect(&mut self, tx: mpsc::UnboundedSender<ServerEvent>) -> ConnId {
        let conn_id = Uuid::new_v4();
        self.connections.insert(
            conn_id,
            LiveConnection {
                user_id: None,
                rooms: HashSet::new(),
                tx,
            },
        );
        conn_id
    }

    /// Binds `conn_id` to `user_id` and joins the user's personal room.
    /// Returns `None` for an unknown connection.
    pub fn register(&mut self, conn_id: ConnId, user_id: Uuid) -> Option<Registration> {
        let previous = match self.connections.get(&conn_id) {
            Some(conn) => conn.user_id,
            None => {
                warn!("register for unknown connection {}", conn_id);
                return None;
            }
        };

        if previous == Some(user_id) {
            return Some(Registration::default());
        }

        let mut registration = Registration::default();
        if let Some(old_user) = previous {
            self.leave_room(conn_id, Room::User(old_user));
            if self.detach_user(conn_id, old_user) {
                registration.displaced_offline = Some(old_user);
            }
        }

        let conns = self.users.entry(user_id).or_default();
        registration.came_online = conns.is_empty();
        conns.insert(conn_id);

        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.user_id = Some(user_id);
        }
        self.join_room(conn_id, Room::User(user_id));

        debug!("Connection {} registered as {}", conn_id, user_id);
        Some(registration)
    }

    pub fn user_of(&self, conn_id: ConnId) -> Option<Uuid> {
        self.connections.get(&conn_id).and_then(|c| c.user_id)
    }

    /// Returns false for an unknown connection.
    pub fn join_room(&mut self, conn_id: ConnId, room: Room) -> bool {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        conn.rooms.insert(room);
        self.rooms.entry(room).or_default().insert(conn_id);
        true
    }

    pub fn leave_room(&mut self, conn_id: ConnId, room: Room) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.rooms.remove(&room);
        }
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.rooms.remove(&room);
            }
        }
    }

    pub fn is_connection_in_room(&self, conn_id: ConnId, room: Room) -> bool {
        self.rooms
            .get(&room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    pub fn is_user_in_room(&self, user_id: Uuid, room: Room) -> bool {
        let (Some(conns), Some(members)) = (self.users.get(&user_id), self.rooms.get(&room)) else {
            return false;
        };
        conns.iter().any(|conn_id| members.contains(conn_id))
    }

    /// Drops the connection from every room and from its user. Returns the
    /// user when this was their last live connection. Safe to call twice.
    pub fn disconnect(&mut self, conn_id: ConnId) -> Option<Uuid> {
        let conn = self.connections.remove(&conn_id)?;

        for room in &conn.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }

        let user_id = conn.user_id?;
        self.detach_user(conn_id, user_id).then_some(user_id)
    }

    /// Users with at least one live registered connection, sorted.
    pub fn online_users(&self) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self.users.keys().copied().collect();
        users.sort();
        users
    }

    pub fn room_connections(&self, room: Room) -> Vec<ConnId> {
        self.rooms
            .get(&room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn user_connections(&self, user_id: Uuid) -> Vec<ConnId> {
        self.users
            .get(&user_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_size(&self, room: Room) -> usize {
        self.rooms.get(&room).map_or(0, HashSet::len)
    }

    /// Queues `event` on every connection in `room` except `except`. Returns
    /// how many connections accepted it; closed connections are skipped.
    pub fn emit_to_room(&self, room: Room, event: &ServerEvent, except: Option<ConnId>) -> usize {
        let Some(members) = self.rooms.get(&room) else {
            return 0;
        };
        members
            .iter()
            .filter(|conn_id| Some(**conn_id) != except)
            .filter(|conn_id| self.send(**conn_id, event.clone()))
            .count()
    }

    pub fn emit_to_all(&self, event: &ServerEvent) -> usize {
        self.connections
            .keys()
            .filter(|conn_id| self.send(**conn_id, event.clone()))
            .count()
    }

    pub fn send(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        match self.connections.get(&conn_id) {
            Some(conn) => conn.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Removes `conn_id` from the user's set; true when the set became empty.
    fn detach_user(&mut self, conn_id: ConnId, user_id: Uuid) -> bool {
        let Some(conns) = self.users.get_mut(&user_id) else {
            return false;
        };
        conns.remove(&conn_id);
        if conns.is_empty() {
            self.users.remove(&user_id);
            true
        } else {
            false
        }
    }
}
