use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{ConversationRow, ConversationSummaryRow};
use crate::users::{missing_users, user_from_row};
use crate::{Database, image_urls, is_unique_violation, now_timestamp};

/// Result of a create call. Unknown users are reported instead of failing on
/// the foreign key so callers can answer with a not-found.
pub enum CreateOutcome {
    Created(ConversationRow),
    Existing(ConversationRow),
    UnknownUsers(Vec<String>),
}

/// How a user relates to a conversation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    NoConversation,
    NotMember,
    Member,
}

const CONVERSATION_COLUMNS: &str = "c.id, c.name, c.type, c.avatar_group, c.last_message_id, \
     c.last_message_at, c.created_at, c.updated_at";

/// Per-member view of a conversation. `?1` is the viewing user.
const SUMMARY_FROM: &str = "
    FROM conversations c
    JOIN conversation_members cm
        ON cm.conversation_id = c.id AND cm.user_id = ?1
    LEFT JOIN messages m
        ON m.id = c.last_message_id
    LEFT JOIN users u
        ON c.type = 'direct' AND u.id = (
            SELECT cm2.user_id FROM conversation_members cm2
            WHERE cm2.conversation_id = c.id AND cm2.user_id != ?1
            LIMIT 1
        )";

/// `?2` is a lowercase LIKE pattern or NULL for no filter.
const SEARCH_FILTER: &str = "
    WHERE ?2 IS NULL
       OR (c.type = 'group' AND LOWER(c.name) LIKE ?2 ESCAPE '\\')
       OR (c.type = 'direct' AND (
              LOWER(TRIM(COALESCE(u.first_name, '') || ' ' || COALESCE(u.last_name, ''))) LIKE ?2 ESCAPE '\\'
           OR LOWER(COALESCE(m.content, '')) LIKE ?2 ESCAPE '\\'
       ))";

/// Uniqueness key for the direct conversation between two users, independent
/// of argument order.
pub fn direct_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

impl Database {
    /// Returns the direct conversation between `a` and `b`, creating it if
    /// needed. Two callers racing past the lookup both try to insert; the
    /// UNIQUE `direct_key` lets exactly one win and the loser reads the
    /// winner's row.
    pub fn create_or_get_direct(&self, a: &str, b: &str) -> Result<CreateOutcome> {
        if let Some(existing) = self.with_conn(|conn| find_direct(conn, a, b))? {
            return Ok(CreateOutcome::Existing(existing));
        }

        match self.with_conn_mut(|tx| insert_direct(tx, a, b)) {
            Ok(outcome) => Ok(outcome),
            Err(e) if is_unique_violation(&e) => {
                debug!("Direct conversation {} created concurrently, reading it back", direct_key(a, b));
                self.with_conn(|conn| find_direct(conn, a, b))?
                    .map(CreateOutcome::Existing)
                    .ok_or_else(|| anyhow!("direct conversation {} missing after conflict", direct_key(a, b)))
            }
            Err(e) => Err(e),
        }
    }

    /// Inserts a group conversation and one member row per id, atomically.
    /// `member_ids` must already be deduplicated and include the creator.
    pub fn create_group(
        &self,
        name: &str,
        avatar_group: Option<&str>,
        member_ids: &[String],
    ) -> Result<CreateOutcome> {
        self.with_conn_mut(|tx| {
            let missing = missing_users(tx, member_ids)?;
            if !missing.is_empty() {
                return Ok(CreateOutcome::UnknownUsers(missing));
            }

            let id = Uuid::new_v4().to_string();
            let now = now_timestamp();
            tx.execute(
                "INSERT INTO conversations (id, name, type, avatar_group, created_at, updated_at)
                 VALUES (?1, ?2, 'group', ?3, ?4, ?4)",
                rusqlite::params![id, name, avatar_group, now],
            )?;
            insert_members(tx, &id, member_ids)?;

            info!("Created group conversation {} with {} members", id, member_ids.len());
            Ok(CreateOutcome::Created(query_conversation(tx, &id)?.ok_or_else(|| anyhow!("conversation {} vanished", id))?))
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    pub fn membership(&self, conversation_id: &str, user_id: &str) -> Result<Membership> {
        self.with_conn(|conn| query_membership(conn, conversation_id, user_id))
    }

    pub fn member_ids(&self, conversation_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM conversation_members WHERE conversation_id = ?1 ORDER BY rowid",
            )?;
            let ids = stmt
                .query_map([conversation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    /// Conversations `user_id` belongs to, most recently active first, plus the
    /// total number matching `search`.
    pub fn list_conversations(
        &self,
        user_id: &str,
        search: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<ConversationSummaryRow>, i64)> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern);

        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) {SUMMARY_FROM} {SEARCH_FILTER}"),
                rusqlite::params![user_id, pattern],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS}, cm.unread_count, m.content, m.image_url,
                        u.id, u.first_name, u.last_name, u.avatar_url, u.role
                 {SUMMARY_FROM} {SEARCH_FILTER}
                 ORDER BY c.updated_at DESC, c.rowid DESC
                 LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, pattern, limit, offset], summary_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok((rows, total))
        })
    }

    /// One conversation as seen by `user_id`; `None` when the user is not a
    /// member or the conversation does not exist.
    pub fn conversation_summary(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationSummaryRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {CONVERSATION_COLUMNS}, cm.unread_count, m.content, m.image_url,
                                u.id, u.first_name, u.last_name, u.avatar_url, u.role
                         {SUMMARY_FROM}
                         WHERE c.id = ?2"
                    ),
                    (user_id, conversation_id),
                    summary_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }
}

fn find_direct(conn: &Connection, a: &str, b: &str) -> Result<Option<ConversationRow>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {CONVERSATION_COLUMNS}
                 FROM conversations c
                 WHERE c.type = 'direct' AND (
                     c.direct_key = ?3
                     OR (EXISTS (SELECT 1 FROM conversation_members m
                                 WHERE m.conversation_id = c.id AND m.user_id = ?1)
                         AND EXISTS (SELECT 1 FROM conversation_members m
                                     WHERE m.conversation_id = c.id AND m.user_id = ?2))
                 )
                 ORDER BY c.created_at
                 LIMIT 1"
            ),
            (a, b, direct_key(a, b)),
            |row| conversation_from_row(row, 0),
        )
        .optional()?;

    Ok(row)
}

pub(crate) fn insert_direct(tx: &Transaction<'_>, a: &str, b: &str) -> Result<CreateOutcome> {
    let members = [a.to_string(), b.to_string()];
    let missing = missing_users(tx, &members)?;
    if !missing.is_empty() {
        return Ok(CreateOutcome::UnknownUsers(missing));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_timestamp();
    tx.execute(
        "INSERT INTO conversations (id, name, type, direct_key, created_at, updated_at)
         VALUES (?1, '', 'direct', ?2, ?3, ?3)",
        (&id, direct_key(a, b), &now),
    )?;
    insert_members(tx, &id, &members)?;

    info!("Created direct conversation {} for {}", id, direct_key(a, b));
    let row = query_conversation(tx, &id)?.ok_or_else(|| anyhow!("conversation {} vanished", id))?;
    Ok(CreateOutcome::Created(row))
}

fn insert_members(tx: &Transaction<'_>, conversation_id: &str, member_ids: &[String]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO conversation_members (conversation_id, user_id, unread_count) VALUES (?1, ?2, 0)",
    )?;
    for user_id in member_ids {
        stmt.execute((conversation_id, user_id))?;
    }
    Ok(())
}

pub(crate) fn query_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
            [id],
            |row| conversation_from_row(row, 0),
        )
        .optional()?;

    Ok(row)
}

pub(crate) fn query_membership(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<Membership> {
    let exists = conn
        .prepare_cached("SELECT 1 FROM conversations WHERE id = ?1")?
        .exists([conversation_id])?;
    if !exists {
        return Ok(Membership::NoConversation);
    }

    let member = conn
        .prepare_cached("SELECT 1 FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2")?
        .exists((conversation_id, user_id))?;

    Ok(if member { Membership::Member } else { Membership::NotMember })
}

fn conversation_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        kind: row.get(offset + 2)?,
        avatar_group: row.get(offset + 3)?,
        last_message_id: row.get(offset + 4)?,
        last_message_at: row.get(offset + 5)?,
        created_at: row.get(offset + 6)?,
        updated_at: row.get(offset + 7)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationSummaryRow> {
    let raw_images: Option<String> = row.get(10)?;
    let other_user = match row.get::<_, Option<String>>(11)? {
        Some(_) => Some(user_from_row(row, 11)?),
        None => None,
    };

    Ok(ConversationSummaryRow {
        conversation: conversation_from_row(row, 0)?,
        unread_count: row.get(8)?,
        last_message_content: row.get(9)?,
        last_message_image_urls: image_urls::decode(raw_images.as_deref()),
        other_user,
    })
}

/// Lowercased substring pattern with LIKE wildcards escaped.
fn like_pattern(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len() + 2);
    escaped.push('%');
    for ch in search.to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}
