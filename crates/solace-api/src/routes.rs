use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

use crate::middleware::require_auth;
use crate::{AppState, conversations, messages, notifications, unread};

/// Every REST route. All of them require a bearer token.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/messages", get(conversations::list).post(conversations::create))
        .route("/api/messages/unread-total", get(unread::total))
        .route("/api/messages/conversation/{conversation_id}", get(conversations::detail))
        .route("/api/messages/{conversation_id}", get(messages::list).post(messages::send))
        .route("/api/notifications", get(notifications::feed))
        .route("/api/notifications/unread-total", get(notifications::feed_unread_total))
        .route("/api/notifications/read-all", post(notifications::read_all))
        .route("/api/notifications/all", delete(notifications::remove_all))
        .route("/api/notifications/{notification_id}", delete(notifications::remove_one))
        .route("/api/notifications/{notification_id}/read", post(notifications::read_one))
        .route("/api/admin/notifications", get(notifications::admin_feed))
        .route("/api/admin/notifications/unread-total", get(notifications::admin_unread_total))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}
