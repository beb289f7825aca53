use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::debug;

use crate::conversations::{Membership, query_membership};
use crate::models::{MessageRow, NewMessage, ReplyRow};
use crate::{Database, image_urls, now_timestamp};

pub enum SendOutcome {
    Sent(MessageRow),
    NoConversation,
    NotMember,
}

/// Message joined with its sender and, when it lives in the same
/// conversation, the message it replies to.
const MESSAGE_SELECT: &str = "
    SELECT m.id, m.conversation_id, m.sender_id, u.first_name, u.last_name, u.avatar_url,
           m.content, m.type, m.image_url, m.reply_to_message_id, m.created_at,
           rm.id, rm.content, rm.type, ru.first_name, ru.last_name
    FROM messages m
    LEFT JOIN users u ON u.id = m.sender_id
    LEFT JOIN messages rm
        ON rm.id = m.reply_to_message_id AND rm.conversation_id = m.conversation_id
    LEFT JOIN users ru ON ru.id = rm.sender_id";

impl Database {
    /// Authorizes the sender, inserts the message and moves the conversation's
    /// last-message pointer, all in one transaction. Nothing is written unless
    /// the sender is a member.
    pub fn send_message(&self, msg: &NewMessage<'_>) -> Result<SendOutcome> {
        self.with_conn_mut(|tx| {
            match query_membership(tx, msg.conversation_id, msg.sender_id)? {
                Membership::NoConversation => return Ok(SendOutcome::NoConversation),
                Membership::NotMember => return Ok(SendOutcome::NotMember),
                Membership::Member => {}
            }

            // Keep created_at monotonic within the conversation even if the
            // wall clock steps back.
            let last_at: Option<String> = tx.query_row(
                "SELECT last_message_at FROM conversations WHERE id = ?1",
                [msg.conversation_id],
                |row| row.get(0),
            )?;
            let now = now_timestamp();
            let created_at = match last_at {
                Some(last) if last > now => last,
                _ => now,
            };

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, type, image_url, reply_to_message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    msg.id,
                    msg.conversation_id,
                    msg.sender_id,
                    msg.content,
                    msg.kind,
                    image_urls::encode(msg.image_urls),
                    msg.reply_to_message_id,
                    created_at,
                ],
            )?;

            tx.execute(
                "UPDATE conversations
                 SET last_message_id = ?1,
                     last_message_at = ?2,
                     updated_at = MAX(updated_at, ?2)
                 WHERE id = ?3",
                (msg.id, &created_at, msg.conversation_id),
            )?;

            debug!("Stored message {} in {}", msg.id, msg.conversation_id);
            let row = query_message(tx, msg.id)?.ok_or_else(|| anyhow!("message {} vanished", msg.id))?;
            Ok(SendOutcome::Sent(row))
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Newest first. Messages sharing a timestamp come back in reverse
    /// insertion order.
    pub fn get_messages(&self, conversation_id: &str, limit: u32, offset: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit, offset], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let row = conn
        .query_row(&format!("{MESSAGE_SELECT} WHERE m.id = ?1"), [id], message_from_row)
        .optional()?;
    Ok(row)
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let raw_images: Option<String> = row.get(8)?;
    let reply = match row.get::<_, Option<String>>(11)? {
        Some(id) => Some(ReplyRow {
            id,
            content: row.get(12)?,
            kind: row.get(13)?,
            sender_first_name: row.get(14)?,
            sender_last_name: row.get(15)?,
        }),
        None => None,
    };

    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_first_name: row.get(3)?,
        sender_last_name: row.get(4)?,
        sender_avatar: row.get(5)?,
        content: row.get(6)?,
        kind: row.get(7)?,
        image_urls: image_urls::decode(raw_images.as_deref()),
        reply_to_message_id: row.get(9)?,
        reply,
        created_at: row.get(10)?,
    })
}
