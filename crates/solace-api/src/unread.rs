use axum::{Extension, Json, extract::State};

use solace_types::api::{Claims, UnreadTotalResponse};

use crate::AppState;
use crate::error::ApiResult;

/// Sum of the caller's unread counters across all conversations.
pub async fn total(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<UnreadTotalResponse>> {
    let total = state.unread.total(claims.sub).await?;
    Ok(Json(UnreadTotalResponse { total }))
}
