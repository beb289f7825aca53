//! Online/offline tracking derived from registry transitions.
//!
//! Every transition broadcasts the full sorted snapshot rather than a delta,
//! so a client that missed an event is corrected by the next one.

use tracing::info;
use uuid::Uuid;

use solace_types::events::ServerEvent;

use crate::registry::{ConnectionRegistry, Registration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Online(Uuid),
    Offline(Uuid),
}

impl Transition {
    /// Transitions caused by binding a connection to `user_id`.
    pub fn from_registration(user_id: Uuid, registration: &Registration) -> Vec<Transition> {
        let mut out = Vec::new();
        if let Some(previous) = registration.displaced_offline {
            out.push(Transition::Offline(previous));
        }
        if registration.came_online {
            out.push(Transition::Online(user_id));
        }
        out
    }
}

pub fn snapshot(registry: &ConnectionRegistry) -> ServerEvent {
    ServerEvent::OnlineUsers(registry.online_users())
}

/// Broadcasts the snapshot to every live connection when anything changed.
/// Returns the number of connections reached.
pub fn publish(registry: &ConnectionRegistry, transitions: &[Transition]) -> usize {
    if transitions.is_empty() {
        return 0;
    }
    for transition in transitions {
        match transition {
            Transition::Online(user_id) => info!("User {} is online", user_id),
            Transition::Offline(user_id) => info!("User {} went offline", user_id),
        }
    }
    registry.emit_to_all(&snapshot(registry))
}
