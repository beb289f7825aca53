pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod routes;
pub mod unread;

use std::sync::Arc;

use anyhow::anyhow;

use solace_db::Database;
use solace_gateway::dispatcher::Dispatcher;
use solace_gateway::unread::UnreadCounter;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub unread: UnreadCounter,
    pub jwt_secret: String,
}

impl AppStateInner {
    /// Wires the services around one database and a fresh dispatcher.
    pub fn new(db: Arc<Database>, jwt_secret: impl Into<String>) -> AppState {
        let dispatcher = Dispatcher::new();
        Arc::new(Self {
            unread: UnreadCounter::new(db.clone(), dispatcher.clone()),
            db,
            dispatcher,
            jwt_secret: jwt_secret.into(),
        })
    }
}

/// Runs a blocking DB call off the async runtime.
pub(crate) async fn blocking<T, F>(state: &AppStateInner, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    let out = tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| anyhow!("spawn_blocking join error: {}", e))??;
    Ok(out)
}
