pub mod config;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use solace_api::middleware::decode_token;
use solace_api::{AppState, AppStateInner, routes};
use solace_db::Database;
use solace_gateway::connection;

use crate::config::Config;

/// REST routes plus the `/socket` event channel, with CORS and tracing.
pub fn build_app(state: AppState, cors: CorsLayer) -> Router {
    let ws_route = Router::new()
        .route("/socket", get(ws_upgrade))
        .with_state(state.clone());

    Router::new()
        .merge(routes::router(state))
        .merge(ws_route)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|o| HeaderValue::from_str(o).with_context(|| format!("invalid CORS origin {}", o)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true))
}

/// Opens the database and serves until the listener fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let db = Arc::new(Database::open(&config.db_path)?);
    let state = AppStateInner::new(db, config.jwt_secret.clone());
    let app = build_app(state, cors_layer(&config.cors_origins)?);

    let addr = config.addr()?;
    info!("Solace server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct SocketQuery {
    token: Option<String>,
}

/// A token on the upgrade pins the connection to its user. Without one the
/// client identifies itself with `register`.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let principal = match query.token.as_deref() {
        Some(token) => match decode_token(&state.jwt_secret, token) {
            Some(claims) => Some(claims.sub),
            None => {
                warn!("Rejected socket upgrade with an invalid token");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        },
        None => None,
    };

    let dispatcher = state.dispatcher.clone();
    let unread = state.unread.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, unread, principal))
}
