use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{MessageResponse, NotificationResponse};

/// Events sent over the realtime gateway, framed as
/// `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Full snapshot of online user ids, sent on every presence transition
    OnlineUsers(Vec<Uuid>),

    /// A message was posted to a conversation
    NewMessage(MessageResponse),

    /// Sum of the user's per-conversation unread counters
    UnreadTotalUpdated { total: i64 },

    /// Another member started typing in a conversation
    Typing {
        #[serde(rename = "userId")]
        user_id: Uuid,
    },

    /// Another member stopped typing
    StopTyping {
        #[serde(rename = "userId")]
        user_id: Uuid,
    },

    /// A notification was created for this user
    NewNotification(NotificationResponse),

    /// Unread notification count for the general feed
    NotificationUnreadTotalUpdated { total: i64 },

    /// A command could not be honoured; the connection stays open
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OnlineUsers(_) => "onlineUsers",
            Self::NewMessage(_) => "newMessage",
            Self::UnreadTotalUpdated { .. } => "unreadTotalUpdated",
            Self::Typing { .. } => "typing",
            Self::StopTyping { .. } => "stopTyping",
            Self::NewNotification(_) => "newNotification",
            Self::NotificationUnreadTotalUpdated { .. } => "notificationUnreadTotalUpdated",
            Self::Error { .. } => "error",
        }
    }
}

/// Commands sent FROM client TO server over the gateway.
///
/// Ids are optional on the wire so a frame with a missing id still parses and
/// can be answered with an `error` event instead of being dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Bind this connection to a user id. A null or absent id is ignored.
    Register(#[serde(default)] Option<String>),

    /// Enter a conversation room; resets the user's unread counter for it
    JoinConversation {
        #[serde(rename = "userId", default)]
        user_id: Option<Uuid>,
        #[serde(rename = "conversationId", default)]
        conversation_id: Option<Uuid>,
    },

    /// Leave a conversation room
    Leave(Option<Uuid>),

    Typing {
        #[serde(rename = "conversationId", default)]
        conversation_id: Option<Uuid>,
        #[serde(rename = "userId", default)]
        user_id: Option<Uuid>,
    },

    StopTyping {
        #[serde(rename = "conversationId", default)]
        conversation_id: Option<Uuid>,
        #[serde(rename = "userId", default)]
        user_id: Option<Uuid>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_event_wire_shape() {
        let json = serde_json::to_value(ServerEvent::UnreadTotalUpdated { total: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"event": "unreadTotalUpdated", "data": {"total": 3}}));

        let user_id = Uuid::nil();
        let json = serde_json::to_value(ServerEvent::Typing { user_id }).unwrap();
        assert_eq!(json["event"], "typing");
        assert_eq!(json["data"]["userId"], user_id.to_string());
    }

    #[test]
    fn client_commands_parse() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"event":"joinConversation","data":{"userId":"00000000-0000-0000-0000-000000000001"}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::JoinConversation {
                user_id: Some(Uuid::from_u128(1)),
                conversation_id: None,
            }
        );

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"event":"register","data":"abc"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::Register(Some("abc".into())));

        for frame in [r#"{"event":"register","data":null}"#, r#"{"event":"register"}"#] {
            let cmd: ClientCommand = serde_json::from_str(frame).unwrap();
            assert_eq!(cmd, ClientCommand::Register(None));
        }

        let cmd: ClientCommand = serde_json::from_str(r#"{"event":"leave","data":null}"#).unwrap();
        assert_eq!(cmd, ClientCommand::Leave(None));

        assert!(serde_json::from_str::<ClientCommand>(r#"{"event":"explode","data":1}"#).is_err());
    }
}
