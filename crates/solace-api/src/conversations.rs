use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use anyhow::anyhow;
use tracing::info;
use uuid::Uuid;

use solace_db::conversations::{CreateOutcome, Membership};
use solace_db::models::ConversationSummaryRow;
use solace_db::parse_timestamp;
use solace_types::api::{
    Claims, ConversationListResponse, ConversationResponse, CreateConversationRequest,
    CreateConversationResponse, PageQuery,
};
use solace_types::models::{ConversationKind, UserSummary, display_name};

use crate::error::{ApiError, ApiResult};
use crate::{AppState, AppStateInner, blocking};

const DEFAULT_PAGE_SIZE: u32 = 20;

/// Preview shown for a last message that carries images.
const IMAGE_PREVIEW: &str = "[image]";

/// Creates a conversation, or returns the existing direct one for the pair.
pub async fn create_conversation(
    state: &AppStateInner,
    creator: Uuid,
    req: CreateConversationRequest,
) -> ApiResult<CreateConversationResponse> {
    if req.members.is_empty() {
        return Err(ApiError::validation("members is required"));
    }

    let mut others: Vec<Uuid> = Vec::with_capacity(req.members.len());
    for id in req.members {
        if id != creator && !others.contains(&id) {
            others.push(id);
        }
    }

    let creator_id = creator.to_string();
    let outcome = match req.kind {
        ConversationKind::Direct => {
            let other = match others.as_slice() {
                [] => return Err(ApiError::validation("Cannot start a conversation with yourself")),
                [other] => other.to_string(),
                _ => return Err(ApiError::validation("A direct conversation has exactly one other member")),
            };
            let a = creator_id.clone();
            blocking(state, move |db| db.create_or_get_direct(&a, &other)).await?
        }
        ConversationKind::Group => {
            let name = req.name.trim().to_string();
            if name.is_empty() {
                return Err(ApiError::validation("Group name is required"));
            }
            if others.is_empty() {
                return Err(ApiError::validation("A group needs at least one other member"));
            }
            let member_ids: Vec<String> = std::iter::once(creator)
                .chain(others)
                .map(|id| id.to_string())
                .collect();
            let avatar = req.avatar_group.filter(|a| !a.trim().is_empty());
            blocking(state, move |db| db.create_group(&name, avatar.as_deref(), &member_ids)).await?
        }
    };

    let (row, is_new) = match outcome {
        CreateOutcome::Created(row) => (row, true),
        CreateOutcome::Existing(row) => (row, false),
        CreateOutcome::UnknownUsers(missing) => {
            return Err(ApiError::not_found(format!("User not found: {}", missing.join(", "))));
        }
    };
    if is_new {
        info!("{} created {} conversation {}", creator, row.kind, row.id);
    }

    let conversation_id = row.id.clone();
    let (summary, members) = blocking(state, move |db| {
        let summary = db.conversation_summary(&creator_id, &conversation_id)?;
        Ok((summary, db.member_ids(&conversation_id)?))
    })
    .await?;
    let summary = summary.ok_or_else(|| anyhow!("conversation {} vanished after create", row.id))?;

    let mut conversation = conversation_response(summary)?;
    conversation.members = Some(
        members
            .iter()
            .map(|id| id.parse())
            .collect::<Result<Vec<Uuid>, _>>()
            .map_err(anyhow::Error::from)?,
    );

    Ok(CreateConversationResponse {
        conversation,
        message: if is_new {
            "Conversation created".to_string()
        } else {
            "Conversation already exists".to_string()
        },
        is_new,
    })
}

pub async fn list_conversations(
    state: &AppStateInner,
    user_id: Uuid,
    query: &PageQuery,
) -> ApiResult<ConversationListResponse> {
    let (limit, offset) = query.window(DEFAULT_PAGE_SIZE);
    let search = query.search.clone();
    let uid = user_id.to_string();

    let (rows, total) =
        blocking(state, move |db| db.list_conversations(&uid, search.as_deref(), limit, offset)).await?;

    let conversations = rows
        .into_iter()
        .map(conversation_response)
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(ConversationListResponse { conversations, total })
}

pub async fn conversation_detail(
    state: &AppStateInner,
    user_id: Uuid,
    conversation_id: Uuid,
) -> ApiResult<ConversationResponse> {
    let (uid, cid) = (user_id.to_string(), conversation_id.to_string());
    let summary = blocking(state, move |db| match db.membership(&cid, &uid)? {
        Membership::Member => db.conversation_summary(&uid, &cid).map(Ok),
        other => Ok(Err(other)),
    })
    .await?;

    match summary {
        Ok(Some(row)) => Ok(conversation_response(row)?),
        Ok(None) | Err(Membership::NoConversation) => Err(ApiError::not_found("Conversation not found")),
        Err(_) => Err(ApiError::forbidden("You are not a member of this conversation")),
    }
}

/// Maps a per-member summary row to the wire shape. Direct conversations
/// are named after the other participant.
pub(crate) fn conversation_response(row: ConversationSummaryRow) -> anyhow::Result<ConversationResponse> {
    let convo = row.conversation;
    let kind: ConversationKind = convo.kind.parse().map_err(|e: String| anyhow!(e))?;

    let other_user = match row.other_user {
        Some(user) => Some(UserSummary {
            id: user.id.parse()?,
            name: display_name(user.first_name.as_deref(), user.last_name.as_deref()),
            avatar: user.avatar_url.unwrap_or_default(),
        }),
        None => None,
    };

    let name = match (&kind, &other_user) {
        (ConversationKind::Direct, Some(other)) => other.name.clone(),
        _ => convo.name,
    };

    let last_message = if !row.last_message_image_urls.is_empty() {
        IMAGE_PREVIEW.to_string()
    } else {
        row.last_message_content.unwrap_or_default()
    };

    Ok(ConversationResponse {
        id: convo.id.parse()?,
        name,
        kind,
        avatar_group: convo.avatar_group,
        last_message,
        last_message_at: convo.last_message_at.as_deref().map(parse_timestamp).transpose()?,
        updated_at: parse_timestamp(&convo.updated_at)?,
        unread_count: row.unread_count,
        other_user,
        members: None,
    })
}

// -- handlers --

pub async fn create(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    let created = create_conversation(&state, claims.sub, req).await?;
    let status = if created.is_new { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(created)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<ConversationListResponse>> {
    Ok(Json(list_conversations(&state, claims.sub, &query).await?))
}

pub async fn detail(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<ConversationResponse>> {
    Ok(Json(conversation_detail(&state, claims.sub, conversation_id).await?))
}
