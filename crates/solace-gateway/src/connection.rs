use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use solace_types::events::{ClientCommand, ServerEvent};

use crate::dispatcher::Dispatcher;
use crate::registry::{ConnId, Room};
use crate::unread::{UnreadCounter, UnreadError};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Runs one WebSocket connection until either side closes it.
///
/// `principal` is the user proven by a token on the upgrade request, if any.
/// Such a connection is registered immediately and may not register as
/// anyone else.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    unread: UnreadCounter,
    principal: Option<Uuid>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut events) = dispatcher.connect().await;

    match principal {
        Some(user_id) => {
            info!("Connection {} opened for {}", conn_id, user_id);
            dispatcher.register(conn_id, user_id).await;
        }
        None => info!("Connection {} opened", conn_id),
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {} event: {}", event.name(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let session = Session::new(conn_id, principal, dispatcher.clone(), unread);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => session.handle_text(text.as_str()).await,
                Message::Pong(_) => pong_flag_recv.store(true, Ordering::Release),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.disconnect(conn_id).await;
    info!("Connection {} closed", conn_id);
}

/// Command handling for one connection. Failures are answered with an
/// `error` event on this connection; they never close it.
pub struct Session {
    conn_id: ConnId,
    principal: Option<Uuid>,
    dispatcher: Dispatcher,
    unread: UnreadCounter,
}

impl Session {
    pub fn new(conn_id: ConnId, principal: Option<Uuid>, dispatcher: Dispatcher, unread: UnreadCounter) -> Self {
        Self {
            conn_id,
            principal,
            dispatcher,
            unread,
        }
    }

    pub async fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ClientCommand>(text) {
            Ok(cmd) => self.handle_command(cmd).await,
            Err(e) => {
                let raw: String = text.chars().take(200).collect();
                warn!("Connection {} bad command: {} -- raw: {}", self.conn_id, e, raw);
                self.reply_error("Malformed event").await;
            }
        }
    }

    pub async fn handle_command(&self, cmd: ClientCommand) {
        trace!("Connection {} command: {:?}", self.conn_id, cmd);
        match cmd {
            ClientCommand::Register(raw) => self.register(raw.as_deref()).await,
            ClientCommand::JoinConversation {
                user_id,
                conversation_id,
            } => self.join_conversation(user_id, conversation_id).await,
            ClientCommand::Leave(Some(conversation_id)) => {
                self.dispatcher
                    .leave_room(self.conn_id, Room::Conversation(conversation_id))
                    .await;
            }
            ClientCommand::Leave(None) => self.reply_error("conversationId is required").await,
            ClientCommand::Typing {
                conversation_id,
                user_id,
            } => self.relay_typing(conversation_id, user_id, true).await,
            ClientCommand::StopTyping {
                conversation_id,
                user_id,
            } => self.relay_typing(conversation_id, user_id, false).await,
        }
    }

    async fn register(&self, raw: Option<&str>) {
        let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
            warn!("Connection {} sent register without a user id", self.conn_id);
            return;
        };
        let Ok(user_id) = raw.trim().parse::<Uuid>() else {
            warn!("Connection {} tried to register with invalid user id {:?}", self.conn_id, raw);
            return self.reply_error("Invalid user id").await;
        };
        if self.principal.is_some_and(|p| p != user_id) {
            warn!("Connection {} tried to register as {}", self.conn_id, user_id);
            return self.reply_error("Cannot register as another user").await;
        }
        self.dispatcher.register(self.conn_id, user_id).await;
    }

    async fn join_conversation(&self, user_id: Option<Uuid>, conversation_id: Option<Uuid>) {
        let (Some(claimed), Some(conversation_id)) = (user_id, conversation_id) else {
            return self.reply_error("userId and conversationId are required").await;
        };
        let Some(user_id) = self.acting_user(claimed).await else {
            return;
        };

        match self.unread.is_member(user_id, conversation_id).await {
            Ok(true) => {}
            Ok(false) => return self.reply_error("Not a member of this conversation").await,
            Err(e) => {
                warn!("Membership check for {} in {} failed: {}", user_id, conversation_id, e);
                return self.reply_error("Failed to join conversation").await;
            }
        }

        // Join before resetting so a message sent in between is seen live
        // rather than counted as unread.
        let room = Room::Conversation(conversation_id);
        self.dispatcher.join_room(self.conn_id, room).await;

        match self.unread.reset_on_join(user_id, conversation_id).await {
            Ok(prior) => debug!("{} joined {} ({} unread cleared)", user_id, conversation_id, prior),
            Err(UnreadError::NotMember) => {
                self.dispatcher.leave_room(self.conn_id, room).await;
                self.reply_error("Not a member of this conversation").await;
            }
            Err(UnreadError::Storage(e)) => {
                warn!("Failed to reset unread for {} in {}: {}", user_id, conversation_id, e);
                self.reply_error("Failed to update unread count").await;
            }
        }
    }

    /// The user this connection acts for. An unregistered connection adopts
    /// the claimed id, subject to the upgrade token.
    async fn acting_user(&self, claimed: Uuid) -> Option<Uuid> {
        match self.dispatcher.user_of(self.conn_id).await {
            Some(current) if current == claimed => Some(current),
            Some(_) => {
                self.reply_error("userId does not match this connection").await;
                None
            }
            None if self.principal.is_some_and(|p| p != claimed) => {
                self.reply_error("Cannot act as another user").await;
                None
            }
            None => {
                self.dispatcher.register(self.conn_id, claimed).await;
                Some(claimed)
            }
        }
    }

    async fn relay_typing(&self, conversation_id: Option<Uuid>, user_id: Option<Uuid>, started: bool) {
        let Some(conversation_id) = conversation_id else {
            return self.reply_error("conversationId is required").await;
        };
        let Some(user_id) = self.dispatcher.user_of(self.conn_id).await.or(user_id) else {
            return self.reply_error("userId is required").await;
        };

        let room = Room::Conversation(conversation_id);
        if !self.dispatcher.is_connection_in_room(self.conn_id, room).await {
            debug!("Connection {} typing in {} without joining, ignored", self.conn_id, conversation_id);
            return;
        }

        let event = if started {
            ServerEvent::Typing { user_id }
        } else {
            ServerEvent::StopTyping { user_id }
        };
        self.dispatcher.emit_to_room_except(room, self.conn_id, event).await;
    }

    async fn reply_error(&self, message: &str) {
        self.dispatcher
            .emit_to_connection(self.conn_id, ServerEvent::error(message))
            .await;
    }
}
