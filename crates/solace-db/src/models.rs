/// Database row types. These map directly to SQLite rows.
/// Distinct from solace-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: String,
}

pub struct ConversationRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub avatar_group: Option<String>,
    pub last_message_id: Option<String>,
    pub last_message_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A conversation as seen by one member: their unread counter, the last
/// message preview and, for direct conversations, the other participant.
pub struct ConversationSummaryRow {
    pub conversation: ConversationRow,
    pub unread_count: i64,
    pub last_message_content: Option<String>,
    pub last_message_image_urls: Vec<String>,
    pub other_user: Option<UserRow>,
}

/// Message joined with sender display info and the replied-to message, if it
/// still exists in the same conversation.
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_first_name: Option<String>,
    pub sender_last_name: Option<String>,
    pub sender_avatar: Option<String>,
    pub content: Option<String>,
    pub kind: String,
    pub image_urls: Vec<String>,
    pub reply_to_message_id: Option<String>,
    pub reply: Option<ReplyRow>,
    pub created_at: String,
}

pub struct ReplyRow {
    pub id: String,
    pub content: Option<String>,
    pub kind: String,
    pub sender_first_name: Option<String>,
    pub sender_last_name: Option<String>,
}

pub struct NewMessage<'a> {
    pub id: &'a str,
    pub conversation_id: &'a str,
    pub sender_id: &'a str,
    pub content: Option<&'a str>,
    pub kind: &'a str,
    pub image_urls: &'a [String],
    pub reply_to_message_id: Option<&'a str>,
}

pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub sender_id: Option<String>,
    pub title: String,
    pub content: String,
    pub kind: String,
    pub related_type: Option<String>,
    pub related_id: Option<String>,
    pub is_read: bool,
    pub created_at: String,
    pub sender: Option<UserRow>,
}

pub struct NewNotification<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub sender_id: Option<&'a str>,
    pub title: &'a str,
    pub content: &'a str,
    pub kind: &'a str,
    pub related_type: Option<&'a str>,
    pub related_id: Option<&'a str>,
}
