use std::sync::Arc;

use anyhow::anyhow;
use tracing::debug;
use uuid::Uuid;

use solace_db::Database;
use solace_types::events::ServerEvent;

use crate::dispatcher::Dispatcher;
use crate::ordering::KeyedLocks;

#[derive(Debug, thiserror::Error)]
pub enum UnreadError {
    #[error("user is not a member of this conversation")]
    NotMember,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Per-member unread counters backed by storage. Every change pushes the
/// recomputed total to the user's personal room.
///
/// Changes for one user are serialized from the write through the push, so
/// the last total a client sees is the stored one.
#[derive(Clone)]
pub struct UnreadCounter {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    per_user: Arc<KeyedLocks<Uuid>>,
}

impl UnreadCounter {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self {
            db,
            dispatcher,
            per_user: Arc::new(KeyedLocks::new()),
        }
    }

    /// Adds one unread message for `user_id` and returns the new total.
    pub async fn increment(&self, user_id: Uuid, conversation_id: Uuid) -> Result<i64, UnreadError> {
        let (uid, cid) = (user_id.to_string(), conversation_id.to_string());
        let _user = self.per_user.lock(user_id).await;
        let total = self
            .blocking(move |db| {
                if !db.increment_unread(&uid, &cid)? {
                    return Ok(None);
                }
                db.unread_total(&uid).map(Some)
            })
            .await?
            .ok_or(UnreadError::NotMember)?;

        self.publish(user_id, total).await;
        Ok(total)
    }

    /// Zeroes the counter when the user opens the conversation. Returns the
    /// count it held. Calling it again is harmless.
    pub async fn reset_on_join(&self, user_id: Uuid, conversation_id: Uuid) -> Result<i64, UnreadError> {
        let (uid, cid) = (user_id.to_string(), conversation_id.to_string());
        let _user = self.per_user.lock(user_id).await;
        let (prior, total) = self
            .blocking(move |db| {
                let Some(prior) = db.reset_unread(&uid, &cid)? else {
                    return Ok(None);
                };
                Ok(Some((prior, db.unread_total(&uid)?)))
            })
            .await?
            .ok_or(UnreadError::NotMember)?;

        debug!("Reset {} unread for {} in {}", prior, user_id, conversation_id);
        self.publish(user_id, total).await;
        Ok(prior)
    }

    pub async fn total(&self, user_id: Uuid) -> anyhow::Result<i64> {
        let uid = user_id.to_string();
        self.blocking(move |db| db.unread_total(&uid)).await
    }

    pub async fn is_member(&self, user_id: Uuid, conversation_id: Uuid) -> anyhow::Result<bool> {
        let (uid, cid) = (user_id.to_string(), conversation_id.to_string());
        self.blocking(move |db| Ok(db.unread_count(&uid, &cid)?.is_some()))
            .await
    }

    async fn publish(&self, user_id: Uuid, total: i64) {
        self.dispatcher
            .emit_to_user(user_id, ServerEvent::UnreadTotalUpdated { total })
            .await;
    }

    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?
    }
}
