use std::sync::Arc;

use tokio::sync::{OwnedMutexGuard, RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use solace_types::events::ServerEvent;

use crate::ordering::{KeyedLocks, Turn, TurnQueue};
use crate::presence::{self, Transition};
use crate::registry::{ConnId, ConnectionRegistry, Registration, Room};

/// Owns the connection registry and routes events to live connections.
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: RwLock<ConnectionRegistry>,

    /// Held per conversation from commit until the room broadcast is queued,
    /// so room order matches storage order.
    send_order: KeyedLocks<Uuid>,

    /// Absent-member delivery per conversation, in commit order.
    fanout: TurnQueue<Uuid>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry: RwLock::new(ConnectionRegistry::new()),
                send_order: KeyedLocks::new(),
                fanout: TurnQueue::new(),
            }),
        }
    }

    /// Opens a connection entry. Events for it arrive on the returned receiver.
    pub async fn connect(&self) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = self.inner.registry.write().await.connect(tx);
        debug!("Connection {} opened", conn_id);
        (conn_id, rx)
    }

    /// Binds the connection to a user. Presence is broadcast when the user
    /// comes online; otherwise only this connection gets the current snapshot.
    pub async fn register(&self, conn_id: ConnId, user_id: Uuid) -> Option<Registration> {
        let mut registry = self.inner.registry.write().await;
        let registration = registry.register(conn_id, user_id)?;

        let transitions = Transition::from_registration(user_id, &registration);
        if transitions.is_empty() {
            let snapshot = presence::snapshot(&registry);
            registry.send(conn_id, snapshot);
        } else {
            presence::publish(&registry, &transitions);
        }
        Some(registration)
    }

    pub async fn user_of(&self, conn_id: ConnId) -> Option<Uuid> {
        self.inner.registry.read().await.user_of(conn_id)
    }

    pub async fn join_room(&self, conn_id: ConnId, room: Room) -> bool {
        self.inner.registry.write().await.join_room(conn_id, room)
    }

    pub async fn leave_room(&self, conn_id: ConnId, room: Room) {
        self.inner.registry.write().await.leave_room(conn_id, room);
    }

    pub async fn is_connection_in_room(&self, conn_id: ConnId, room: Room) -> bool {
        self.inner.registry.read().await.is_connection_in_room(conn_id, room)
    }

    pub async fn is_user_in_room(&self, user_id: Uuid, room: Room) -> bool {
        self.inner.registry.read().await.is_user_in_room(user_id, room)
    }

    /// Removes the connection everywhere; broadcasts presence when its user
    /// has no live connection left.
    pub async fn disconnect(&self, conn_id: ConnId) -> Option<Uuid> {
        let mut registry = self.inner.registry.write().await;
        let offline = registry.disconnect(conn_id);
        if let Some(user_id) = offline {
            presence::publish(&registry, &[Transition::Offline(user_id)]);
        }
        debug!("Connection {} closed", conn_id);
        offline
    }

    pub async fn online_users(&self) -> Vec<Uuid> {
        self.inner.registry.read().await.online_users()
    }

    pub async fn emit_to_room(&self, room: Room, event: ServerEvent) -> usize {
        self.inner.registry.read().await.emit_to_room(room, &event, None)
    }

    pub async fn emit_to_room_except(&self, room: Room, except: ConnId, event: ServerEvent) -> usize {
        self.inner
            .registry
            .read()
            .await
            .emit_to_room(room, &event, Some(except))
    }

    /// Sends to every live connection of `user_id`. Nothing happens when the
    /// user has none.
    pub async fn emit_to_user(&self, user_id: Uuid, event: ServerEvent) -> usize {
        self.emit_to_room(Room::User(user_id), event).await
    }

    pub async fn emit_to_connection(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        self.inner.registry.read().await.send(conn_id, event)
    }

    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        self.inner.registry.read().await.emit_to_all(&event)
    }

    pub async fn lock_send_order(&self, conversation_id: Uuid) -> OwnedMutexGuard<()> {
        self.inner.send_order.lock(conversation_id).await
    }

    /// Take while holding the send-order lock; the turn then follows every
    /// earlier message of the conversation.
    pub fn fanout_turn(&self, conversation_id: Uuid) -> Turn {
        self.inner.fanout.next(conversation_id)
    }
}
