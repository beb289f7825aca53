use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            other => Err(format!("unknown conversation type '{}'", other)),
        }
    }
}

/// Notification taxonomy. `PostApproval` and `ReportNew` are addressed to
/// admins and only show up in the admin listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
    System,
    NewPost,
    PostApproval,
    ReportNew,
}

impl NotificationKind {
    pub const ADMIN_ONLY: [NotificationKind; 2] = [Self::PostApproval, Self::ReportNew];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Follow => "follow",
            Self::System => "system",
            Self::NewPost => "new_post",
            Self::PostApproval => "post_approval",
            Self::ReportNew => "report_new",
        }
    }

    pub fn is_admin_only(&self) -> bool {
        Self::ADMIN_ONLY.contains(self)
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "like" => Ok(Self::Like),
            "comment" => Ok(Self::Comment),
            "follow" => Ok(Self::Follow),
            "system" => Ok(Self::System),
            "new_post" => Ok(Self::NewPost),
            "post_approval" => Ok(Self::PostApproval),
            "report_new" => Ok(Self::ReportNew),
            other => Err(format!("unknown notification type '{}'", other)),
        }
    }
}

/// Which slice of the notifications table a listing reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationView {
    /// Everything except admin-only types.
    Feed,
    /// Admin-only types.
    Admin,
}

/// Display info for the other participant of a direct conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub name: String,
    pub avatar: String,
}

/// Joins name parts the way they are shown in the UI: "first last", with
/// missing parts dropped.
pub fn display_name(first_name: Option<&str>, last_name: Option<&str>) -> String {
    [first_name, last_name]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
