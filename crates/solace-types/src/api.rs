use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationKind, NotificationKind, UserSummary};

// -- JWT Claims --

/// The authenticated principal. Tokens are issued by the identity service;
/// this core only validates them. Shared by the REST middleware and the
/// gateway upgrade so both agree on the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Paging --

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub search: Option<String>,
    pub tab: Option<String>,
}

impl PageQuery {
    pub const MAX_LIMIT: u32 = 100;

    /// Returns (limit, offset) for a 1-based page.
    pub fn window(&self, default_limit: u32) -> (u32, u32) {
        let limit = self.limit.filter(|l| *l > 0).unwrap_or(default_limit).min(Self::MAX_LIMIT);
        let page = self.page.filter(|p| *p > 0).unwrap_or(1);
        (limit, (page - 1).saturating_mul(limit))
    }
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub members: Vec<Uuid>,
    #[serde(rename = "type", default = "default_conversation_kind")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar_group: Option<String>,
}

fn default_conversation_kind() -> ConversationKind {
    ConversationKind::Direct
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    /// Group name, or the other participant's name for direct conversations.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub avatar_group: Option<String>,
    /// Preview of the last message; "[image]" for image-only messages.
    pub last_message: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub unread_count: i64,
    pub other_user: Option<UserSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<Uuid>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    pub conversation: ConversationResponse,
    pub message: String,
    pub is_new: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationResponse>,
    pub total: i64,
}

// -- Messages --

/// Attachment input: clients send either one URL or an ordered list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImageInput {
    One(String),
    Many(Vec<String>),
}

impl ImageInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(url) => vec![url],
            Self::Many(urls) => urls,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Legacy single-image field.
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_urls: Option<ImageInput>,
    #[serde(default)]
    pub reply_to_message_id: Option<Uuid>,
}

impl SendMessageRequest {
    /// Ordered, non-empty attachment URLs. `image_urls` wins over the legacy
    /// `image_url` field when both are present.
    pub fn attachment_urls(&mut self) -> Vec<String> {
        let urls = match (self.image_urls.take(), self.image_url.take()) {
            (Some(input), _) => input.into_vec(),
            (None, Some(url)) => vec![url],
            (None, None) => Vec::new(),
        };
        urls.into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: Uuid,
    pub content: Option<String>,
    pub sender_name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub image_urls: Vec<String>,
    pub reply_to_message_id: Option<Uuid>,
    pub reply_to: Option<ReplyPreview>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadTotalResponse {
    pub total: i64,
}

// -- Notifications --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSender {
    pub id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub related_type: Option<String>,
    pub related_id: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub sender: Option<NotificationSender>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationListResponse {
    pub notifications: Vec<NotificationResponse>,
    pub has_more: bool,
    pub total: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}
