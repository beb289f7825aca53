//! Per-member unread counters. Every mutation is a single statement so
//! concurrent senders cannot lose updates; totals are always summed from the
//! rows, never cached.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

use crate::Database;

impl Database {
    /// Adds one to the member's counter. Returns false when the member row
    /// does not exist.
    pub fn increment_unread(&self, user_id: &str, conversation_id: &str) -> Result<bool> {
        self.with_conn_mut(|tx| {
            let changed = tx.execute(
                "UPDATE conversation_members
                 SET unread_count = unread_count + 1
                 WHERE user_id = ?1 AND conversation_id = ?2",
                (user_id, conversation_id),
            )?;
            Ok(changed == 1)
        })
    }

    /// Zeroes the member's counter and returns the value it held, or `None`
    /// when the user is not a member of the conversation.
    pub fn reset_unread(&self, user_id: &str, conversation_id: &str) -> Result<Option<i64>> {
        // Read and write share one IMMEDIATE transaction, so no increment can
        // land between them.
        self.with_conn_mut(|tx| {
            let prior: Option<i64> = tx
                .query_row(
                    "SELECT unread_count FROM conversation_members WHERE user_id = ?1 AND conversation_id = ?2",
                    (user_id, conversation_id),
                    |row| row.get(0),
                )
                .optional()?;

            if prior.is_some() {
                tx.execute(
                    "UPDATE conversation_members SET unread_count = 0 WHERE user_id = ?1 AND conversation_id = ?2",
                    (user_id, conversation_id),
                )?;
            }
            Ok(prior)
        })
    }

    pub fn unread_total(&self, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| query_unread_total(conn, user_id))
    }

    pub fn unread_count(&self, user_id: &str, conversation_id: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT unread_count FROM conversation_members WHERE user_id = ?1 AND conversation_id = ?2",
                    (user_id, conversation_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count)
        })
    }
}

pub(crate) fn query_unread_total(conn: &Connection, user_id: &str) -> Result<i64> {
    let total = conn.query_row(
        "SELECT COALESCE(SUM(unread_count), 0)
         FROM conversation_members
         WHERE user_id = ?1 AND unread_count > 0",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(total)
}
