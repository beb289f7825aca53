use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, warn};
use uuid::Uuid;

use solace_db::conversations::Membership;
use solace_db::messages::SendOutcome;
use solace_db::models::{MessageRow, NewMessage};
use solace_db::parse_timestamp;
use solace_gateway::ordering::Turn;
use solace_gateway::registry::Room;
use solace_types::api::{Claims, MessageResponse, PageQuery, ReplyPreview, SendMessageRequest};
use solace_types::events::ServerEvent;
use solace_types::models::display_name;

use crate::error::{ApiError, ApiResult};
use crate::{AppState, AppStateInner, blocking};

const DEFAULT_PAGE_SIZE: u32 = 20;

const TEXT_KIND: &str = "text";
const IMAGE_KIND: &str = "image";

/// A stored message plus its place in the conversation's delivery order.
pub struct SentMessage {
    pub message: MessageResponse,
    turn: Turn,
}

/// Stores a message and queues `newMessage` on the conversation room.
///
/// The conversation's send-order lock is held from before the commit until the
/// room event is queued, so every live member sees messages in storage order.
/// Members who are not in the room are handled by
/// [`deliver_to_absent_members`], which must be given the returned value.
pub async fn send_message(
    state: &AppStateInner,
    conversation_id: Uuid,
    sender_id: Uuid,
    mut req: SendMessageRequest,
) -> ApiResult<SentMessage> {
    let image_urls = req.attachment_urls();
    let content = req
        .content
        .take()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    if content.is_none() && image_urls.is_empty() {
        return Err(ApiError::validation("Message must have content or images"));
    }

    let kind = if image_urls.is_empty() {
        req.kind
            .take()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| TEXT_KIND.to_string())
    } else {
        IMAGE_KIND.to_string()
    };

    let message_id = Uuid::new_v4().to_string();
    let (cid, sid) = (conversation_id.to_string(), sender_id.to_string());
    let reply_to = req.reply_to_message_id.map(|id| id.to_string());

    let order = state.dispatcher.lock_send_order(conversation_id).await;

    let outcome = blocking(state, move |db| {
        db.send_message(&NewMessage {
            id: &message_id,
            conversation_id: &cid,
            sender_id: &sid,
            content: content.as_deref(),
            kind: &kind,
            image_urls: &image_urls,
            reply_to_message_id: reply_to.as_deref(),
        })
    })
    .await?;

    let message = match outcome {
        SendOutcome::Sent(row) => message_response(row)?,
        SendOutcome::NoConversation => return Err(ApiError::not_found("Conversation not found")),
        SendOutcome::NotMember => {
            warn!("{} tried to post in {} without membership", sender_id, conversation_id);
            return Err(ApiError::forbidden("You are not a member of this conversation"));
        }
    };

    let live = state
        .dispatcher
        .emit_to_room(Room::Conversation(conversation_id), ServerEvent::NewMessage(message.clone()))
        .await;
    debug!("Message {} delivered live to {} connections", message.id, live);

    let turn = state.dispatcher.fanout_turn(conversation_id);
    drop(order);

    Ok(SentMessage { message, turn })
}

/// For every other member without a connection in the room: bump their
/// unread counter and push the message plus the new total to their personal
/// room. Runs after every earlier message of the conversation has been
/// delivered. Best effort; failures are logged and never undo the send.
pub async fn deliver_to_absent_members(state: AppState, sent: SentMessage) {
    let SentMessage { message, mut turn } = sent;
    turn.wait().await;

    let conversation_id = message.conversation_id;
    let cid = conversation_id.to_string();
    let members = match blocking(&state, move |db| db.member_ids(&cid)).await {
        Ok(members) => members,
        Err(e) => {
            warn!("Fan-out for message {} could not load members: {}", message.id, e);
            return;
        }
    };

    let room = Room::Conversation(conversation_id);
    for member in members {
        let Ok(member_id) = member.parse::<Uuid>() else {
            warn!("Skipping malformed member id {} in {}", member, conversation_id);
            continue;
        };
        if member_id == message.sender_id || state.dispatcher.is_user_in_room(member_id, room).await {
            continue;
        }

        state
            .dispatcher
            .emit_to_user(member_id, ServerEvent::NewMessage(message.clone()))
            .await;
        if let Err(e) = state.unread.increment(member_id, conversation_id).await {
            warn!("Failed to bump unread for {} in {}: {}", member_id, conversation_id, e);
        }
    }
}

/// Newest first. Only members may read.
pub async fn list_messages(
    state: &AppStateInner,
    conversation_id: Uuid,
    user_id: Uuid,
    query: &PageQuery,
) -> ApiResult<Vec<MessageResponse>> {
    let (limit, offset) = query.window(DEFAULT_PAGE_SIZE);
    let (cid, uid) = (conversation_id.to_string(), user_id.to_string());

    let rows = blocking(state, move |db| match db.membership(&cid, &uid)? {
        Membership::Member => db.get_messages(&cid, limit, offset).map(Ok),
        other => Ok(Err(other)),
    })
    .await?;

    match rows {
        Ok(rows) => Ok(rows
            .into_iter()
            .map(message_response)
            .collect::<anyhow::Result<Vec<_>>>()?),
        Err(Membership::NoConversation) => Err(ApiError::not_found("Conversation not found")),
        Err(_) => Err(ApiError::forbidden("You are not a member of this conversation")),
    }
}

pub(crate) fn message_response(row: MessageRow) -> anyhow::Result<MessageResponse> {
    let reply_to = match row.reply {
        Some(reply) => Some(ReplyPreview {
            id: reply.id.parse()?,
            content: reply.content,
            sender_name: display_name(reply.sender_first_name.as_deref(), reply.sender_last_name.as_deref()),
            kind: reply.kind,
        }),
        None => None,
    };

    Ok(MessageResponse {
        id: row.id.parse()?,
        conversation_id: row.conversation_id.parse()?,
        sender_id: row.sender_id.parse()?,
        sender_name: display_name(row.sender_first_name.as_deref(), row.sender_last_name.as_deref()),
        sender_avatar: row.sender_avatar,
        content: row.content,
        kind: row.kind,
        image_urls: row.image_urls,
        reply_to_message_id: row.reply_to_message_id.as_deref().map(str::parse::<Uuid>).transpose()?,
        reply_to,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

// -- handlers --

pub async fn send(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let sent = send_message(&state, conversation_id, claims.sub, req).await?;
    let message = sent.message.clone();
    tokio::spawn(deliver_to_absent_members(state.clone(), sent));
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<MessageResponse>>> {
    Ok(Json(list_messages(&state, conversation_id, claims.sub, &query).await?))
}
