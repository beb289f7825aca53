//! Notification fan-out: producers called by the rest of the backend, the
//! user's feed endpoints and the admin listing.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use anyhow::anyhow;
use tracing::{debug, warn};
use uuid::Uuid;

use solace_db::models::{NewNotification, NotificationRow};
use solace_db::notifications::{DeleteOutcome, NotificationTab};
use solace_db::parse_timestamp;
use solace_types::api::{
    Claims, NotificationListResponse, NotificationResponse, NotificationSender, PageQuery,
    SuccessResponse, UnreadTotalResponse,
};
use solace_types::events::ServerEvent;
use solace_types::models::{NotificationKind, NotificationView, display_name};

use crate::error::{ApiError, ApiResult};
use crate::{AppState, AppStateInner, blocking};

const FEED_PAGE_SIZE: u32 = 10;
const ADMIN_PAGE_SIZE: u32 = 20;

const COMMENT_EXCERPT_CHARS: usize = 50;
const POST_EXCERPT_CHARS: usize = 100;

const RELATED_POST: &str = "post";
const RELATED_REPORT: &str = "report";

#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub recipient: Uuid,
    pub sender: Option<Uuid>,
    pub title: String,
    pub content: String,
    pub kind: NotificationKind,
    pub related_type: Option<String>,
    pub related_id: Option<String>,
}

impl NotificationDraft {
    fn new(recipient: Uuid, kind: NotificationKind, title: &str, content: impl Into<String>) -> Self {
        Self {
            recipient,
            sender: None,
            title: title.to_string(),
            content: content.into(),
            kind,
            related_type: None,
            related_id: None,
        }
    }

    fn from_sender(mut self, sender: Uuid) -> Self {
        self.sender = Some(sender);
        self
    }

    fn about(mut self, related_type: &str, related_id: &str) -> Self {
        self.related_type = Some(related_type.to_string());
        self.related_id = Some(related_id.to_string());
        self
    }
}

/// Stores the notification and pushes it to the recipient's personal room.
/// Returns `None` when the sender is the recipient; nobody is notified about
/// their own actions.
pub async fn create_notification(
    state: &AppStateInner,
    draft: NotificationDraft,
) -> ApiResult<Option<NotificationResponse>> {
    if draft.sender == Some(draft.recipient) {
        debug!("Skipping {} notification to its own sender {}", draft.kind, draft.recipient);
        return Ok(None);
    }

    let recipient = draft.recipient;
    let kind = draft.kind;
    let row = blocking(state, move |db| {
        let id = Uuid::new_v4().to_string();
        let user_id = draft.recipient.to_string();
        let sender_id = draft.sender.map(|s| s.to_string());
        db.insert_notification(&NewNotification {
            id: &id,
            user_id: &user_id,
            sender_id: sender_id.as_deref(),
            title: &draft.title,
            content: &draft.content,
            kind: draft.kind.as_str(),
            related_type: draft.related_type.as_deref(),
            related_id: draft.related_id.as_deref(),
        })
    })
    .await?;
    let notification = notification_response(row)?;

    state
        .dispatcher
        .emit_to_user(recipient, ServerEvent::NewNotification(notification.clone()))
        .await;
    if !kind.is_admin_only() {
        publish_feed_unread_total(state, recipient).await;
    }

    Ok(Some(notification))
}

/// Creates one notification per recipient. A failure for one recipient is
/// logged and does not stop the others. Returns how many were created.
async fn notify_each(state: &AppStateInner, recipients: Vec<Uuid>, draft: NotificationDraft) -> usize {
    let mut created = 0;
    for recipient in recipients {
        let draft = NotificationDraft {
            recipient,
            ..draft.clone()
        };
        match create_notification(state, draft).await {
            Ok(Some(_)) => created += 1,
            Ok(None) => {}
            Err(e) => warn!("Failed to notify {}: {}", recipient, e),
        }
    }
    created
}

pub async fn notify_like(state: &AppStateInner, post_id: &str, liker: Uuid, post_owner: Uuid) -> ApiResult<()> {
    let draft = NotificationDraft::new(post_owner, NotificationKind::Like, "New like", "liked your post")
        .from_sender(liker)
        .about(RELATED_POST, post_id);
    create_notification(state, draft).await?;
    Ok(())
}

pub async fn notify_comment(
    state: &AppStateInner,
    post_id: &str,
    commenter: Uuid,
    post_owner: Uuid,
    comment: &str,
) -> ApiResult<()> {
    let content = format!(
        "commented on your post: \"{}\"",
        excerpt(comment, COMMENT_EXCERPT_CHARS)
    );
    let draft = NotificationDraft::new(post_owner, NotificationKind::Comment, "New comment", content)
        .from_sender(commenter)
        .about(RELATED_POST, post_id);
    create_notification(state, draft).await?;
    Ok(())
}

pub async fn notify_follow(state: &AppStateInner, follower: Uuid, followed: Uuid) -> ApiResult<()> {
    let draft = NotificationDraft::new(followed, NotificationKind::Follow, "New follower", "started following you")
        .from_sender(follower);
    create_notification(state, draft).await?;
    Ok(())
}

pub async fn notify_post_approved(state: &AppStateInner, post_id: &str, author: Uuid) -> ApiResult<()> {
    let draft = NotificationDraft::new(
        author,
        NotificationKind::System,
        "Your post was approved",
        "An administrator approved your post and it is now public.",
    )
    .about(RELATED_POST, post_id);
    create_notification(state, draft).await?;
    Ok(())
}

/// A post entered moderation: every admin gets a review request, the author
/// gets a confirmation.
pub async fn notify_post_submitted(
    state: &AppStateInner,
    post_id: &str,
    author: Uuid,
    post_content: &str,
) -> ApiResult<()> {
    let admins = admin_ids(state).await?;
    let review = NotificationDraft::new(
        Uuid::nil(),
        NotificationKind::PostApproval,
        "New post awaiting review",
        format!(
            "A post by user {} needs review: \"{}\"",
            author,
            excerpt(post_content, POST_EXCERPT_CHARS)
        ),
    )
    .from_sender(author)
    .about(RELATED_POST, post_id);
    notify_each(state, admins, review).await;

    let pending = NotificationDraft::new(
        author,
        NotificationKind::System,
        "Your post is awaiting review",
        "Your post was submitted and is waiting for an administrator to review it.",
    )
    .about(RELATED_POST, post_id);
    create_notification(state, pending).await?;
    Ok(())
}

/// Tells every follower of `author` about a newly published post. Returns how
/// many followers were notified.
pub async fn notify_followers_of_new_post(state: &AppStateInner, post_id: &str, author: Uuid) -> ApiResult<usize> {
    let author_id = author.to_string();
    let (author_row, followers) = blocking(state, move |db| {
        Ok((db.get_user_by_id(&author_id)?, db.follower_ids(&author_id)?))
    })
    .await?;

    let Some(author_row) = author_row else {
        warn!("Author {} of post {} not found, followers not notified", author, post_id);
        return Ok(0);
    };
    let name = display_name(author_row.first_name.as_deref(), author_row.last_name.as_deref());

    let followers = parse_ids(followers)?;
    let draft = NotificationDraft::new(
        Uuid::nil(),
        NotificationKind::NewPost,
        "New post from someone you follow",
        format!("{} published a new post.", name),
    )
    .from_sender(author)
    .about(RELATED_POST, post_id);
    Ok(notify_each(state, followers, draft).await)
}

pub async fn notify_report_to_admins(
    state: &AppStateInner,
    post_id: &str,
    reporter: Uuid,
    reported_user: Uuid,
    reason: &str,
) -> ApiResult<usize> {
    let (reporter_id, reported_id) = (reporter.to_string(), reported_user.to_string());
    let (reporter_row, reported_row) = blocking(state, move |db| {
        Ok((db.get_user_by_id(&reporter_id)?, db.get_user_by_id(&reported_id)?))
    })
    .await?;
    let name_of = |row: Option<solace_db::models::UserRow>| {
        row.map(|u| display_name(u.first_name.as_deref(), u.last_name.as_deref()))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Unknown user".to_string())
    };

    let admins = admin_ids(state).await?;
    let draft = NotificationDraft::new(
        Uuid::nil(),
        NotificationKind::ReportNew,
        "New report to review",
        format!(
            "Post {} by {} was reported by {}: \"{}\"",
            post_id,
            name_of(reported_row),
            name_of(reporter_row),
            reason
        ),
    )
    .from_sender(reporter)
    .about(RELATED_POST, post_id);
    Ok(notify_each(state, admins, draft).await)
}

pub async fn notify_report_processed(
    state: &AppStateInner,
    reporter: Uuid,
    report_id: &str,
    post_id: &str,
    status: &str,
) -> ApiResult<()> {
    let draft = NotificationDraft::new(
        reporter,
        NotificationKind::System,
        "Your report was handled",
        format!(
            "Your report about post {} was resolved with status \"{}\". Thank you for helping out!",
            post_id, status
        ),
    )
    .about(RELATED_REPORT, report_id);
    create_notification(state, draft).await?;
    Ok(())
}

// -- feed and admin views --

pub async fn list_notifications(
    state: &AppStateInner,
    user_id: Uuid,
    view: NotificationView,
    query: &PageQuery,
) -> ApiResult<NotificationListResponse> {
    let tab = parse_tab(view, query.tab.as_deref())?;
    let default_limit = match view {
        NotificationView::Feed => FEED_PAGE_SIZE,
        NotificationView::Admin => ADMIN_PAGE_SIZE,
    };
    let (limit, offset) = query.window(default_limit);
    let uid = user_id.to_string();

    let (rows, total) = blocking(state, move |db| db.list_notifications(&uid, view, tab, limit, offset)).await?;
    let has_more = i64::from(offset) + (rows.len() as i64) < total;
    let notifications = rows
        .into_iter()
        .map(notification_response)
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(NotificationListResponse {
        notifications,
        has_more,
        total,
    })
}

pub async fn unread_total(state: &AppStateInner, user_id: Uuid, view: NotificationView) -> ApiResult<i64> {
    let uid = user_id.to_string();
    blocking(state, move |db| db.unread_notification_count(&uid, view)).await
}

pub async fn mark_read(state: &AppStateInner, user_id: Uuid, notification_id: Uuid) -> ApiResult<()> {
    let (uid, nid) = (user_id.to_string(), notification_id.to_string());
    if !blocking(state, move |db| db.mark_notification_read(&uid, &nid)).await? {
        return Err(ApiError::not_found("Notification not found"));
    }
    publish_feed_unread_total(state, user_id).await;
    Ok(())
}

pub async fn mark_all_read(state: &AppStateInner, user_id: Uuid) -> ApiResult<usize> {
    let uid = user_id.to_string();
    let changed = blocking(state, move |db| db.mark_all_notifications_read(&uid)).await?;
    publish_feed_unread_total(state, user_id).await;
    Ok(changed)
}

pub async fn delete_one(state: &AppStateInner, user_id: Uuid, notification_id: Uuid) -> ApiResult<()> {
    let (uid, nid) = (user_id.to_string(), notification_id.to_string());
    match blocking(state, move |db| db.delete_notification(&uid, &nid)).await? {
        DeleteOutcome::NotFound => Err(ApiError::not_found("Notification not found")),
        DeleteOutcome::Deleted { was_unread } => {
            if was_unread {
                publish_feed_unread_total(state, user_id).await;
            }
            Ok(())
        }
    }
}

pub async fn delete_all(state: &AppStateInner, user_id: Uuid) -> ApiResult<usize> {
    let uid = user_id.to_string();
    let deleted = blocking(state, move |db| db.delete_all_notifications(&uid)).await?;
    publish_feed_unread_total(state, user_id).await;
    Ok(deleted)
}

/// Pushes the feed's unread count to the user. Best effort.
async fn publish_feed_unread_total(state: &AppStateInner, user_id: Uuid) {
    match unread_total(state, user_id, NotificationView::Feed).await {
        Ok(total) => {
            state
                .dispatcher
                .emit_to_user(user_id, ServerEvent::NotificationUnreadTotalUpdated { total })
                .await;
        }
        Err(e) => warn!("Failed to compute notification total for {}: {}", user_id, e),
    }
}

async fn admin_ids(state: &AppStateInner) -> ApiResult<Vec<Uuid>> {
    let ids = blocking(state, |db| db.admin_ids()).await?;
    Ok(parse_ids(ids)?)
}

fn parse_ids(ids: Vec<String>) -> anyhow::Result<Vec<Uuid>> {
    ids.iter()
        .map(|id| id.parse::<Uuid>().map_err(|e| anyhow!("bad user id {}: {}", id, e)))
        .collect()
}

fn parse_tab(view: NotificationView, tab: Option<&str>) -> ApiResult<NotificationTab> {
    match (view, tab.unwrap_or("all")) {
        (_, "all") => Ok(NotificationTab::All),
        (_, "unread") => Ok(NotificationTab::Unread),
        (NotificationView::Feed, "system") => Ok(NotificationTab::System),
        (_, other) => Err(ApiError::validation(format!("Unknown tab '{}'", other))),
    }
}

/// First `max` characters of `text`, with an ellipsis when cut.
fn excerpt(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

pub(crate) fn notification_response(row: NotificationRow) -> anyhow::Result<NotificationResponse> {
    let sender = match row.sender {
        Some(user) => Some(NotificationSender {
            id: user.id.parse()?,
            first_name: user.first_name,
            last_name: user.last_name,
            avatar_url: user.avatar_url,
        }),
        None => None,
    };

    Ok(NotificationResponse {
        id: row.id.parse()?,
        user_id: row.user_id.parse()?,
        title: row.title,
        content: row.content,
        kind: row.kind.parse().map_err(|e: String| anyhow!(e))?,
        related_type: row.related_type,
        related_id: row.related_id,
        is_read: row.is_read,
        created_at: parse_timestamp(&row.created_at)?,
        sender,
    })
}

// -- handlers --

pub async fn feed(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<NotificationListResponse>> {
    Ok(Json(list_notifications(&state, claims.sub, NotificationView::Feed, &query).await?))
}

pub async fn feed_unread_total(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<UnreadTotalResponse>> {
    let total = unread_total(&state, claims.sub, NotificationView::Feed).await?;
    Ok(Json(UnreadTotalResponse { total }))
}

pub async fn read_one(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(notification_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse>> {
    mark_read(&state, claims.sub, notification_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn read_all(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<SuccessResponse>> {
    mark_all_read(&state, claims.sub).await?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn remove_one(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(notification_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse>> {
    delete_one(&state, claims.sub, notification_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn remove_all(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<SuccessResponse>> {
    delete_all(&state, claims.sub).await?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn admin_feed(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<NotificationListResponse>> {
    Ok(Json(list_notifications(&state, claims.sub, NotificationView::Admin, &query).await?))
}

pub async fn admin_unread_total(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<UnreadTotalResponse>> {
    let total = unread_total(&state, claims.sub, NotificationView::Admin).await?;
    Ok(Json(UnreadTotalResponse { total }))
}
