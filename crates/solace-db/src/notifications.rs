//! Notifications table. The general feed and the admin listing are two
//! disjoint views over the same rows, split by type.

use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row};
use solace_types::models::{NotificationKind, NotificationView};

use crate::models::{NewNotification, NotificationRow};
use crate::users::user_from_row;
use crate::{Database, now_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationTab {
    All,
    Unread,
    /// Only `system` notifications (feed view).
    System,
}

pub enum DeleteOutcome {
    NotFound,
    Deleted { was_unread: bool },
}

const NOTIFICATION_SELECT: &str = "
    SELECT n.id, n.user_id, n.sender_id, n.title, n.content, n.type, n.related_type,
           n.related_id, n.is_read, n.created_at,
           u.id, u.first_name, u.last_name, u.avatar_url, u.role
    FROM notifications n
    LEFT JOIN users u ON u.id = n.sender_id";

/// SQL predicate selecting the rows of `view` for table alias `n`.
fn view_filter(view: NotificationView) -> String {
    let admin_types = NotificationKind::ADMIN_ONLY
        .iter()
        .map(|k| format!("'{}'", k.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    match view {
        NotificationView::Feed => format!("n.type NOT IN ({admin_types})"),
        NotificationView::Admin => format!("n.type IN ({admin_types})"),
    }
}

fn tab_filter(tab: NotificationTab) -> String {
    match tab {
        NotificationTab::All => String::new(),
        NotificationTab::Unread => " AND n.is_read = 0".to_string(),
        NotificationTab::System => format!(" AND n.type = '{}'", NotificationKind::System.as_str()),
    }
}

impl Database {
    pub fn insert_notification(&self, new: &NewNotification<'_>) -> Result<NotificationRow> {
        self.with_conn_mut(|tx| {
            tx.execute(
                "INSERT INTO notifications (id, user_id, sender_id, title, content, type, related_type, related_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    new.id,
                    new.user_id,
                    new.sender_id,
                    new.title,
                    new.content,
                    new.kind,
                    new.related_type,
                    new.related_id,
                    now_timestamp(),
                ],
            )?;
            query_notification(tx, new.id)?.ok_or_else(|| anyhow!("notification {} vanished", new.id))
        })
    }

    /// Newest first, with the total row count for the same filter.
    pub fn list_notifications(
        &self,
        user_id: &str,
        view: NotificationView,
        tab: NotificationTab,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<NotificationRow>, i64)> {
        let filter = format!("n.user_id = ?1 AND {}{}", view_filter(view), tab_filter(tab));

        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM notifications n WHERE {filter}"),
                [user_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "{NOTIFICATION_SELECT}
                 WHERE {filter}
                 ORDER BY n.created_at DESC, n.rowid DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit, offset], notification_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok((rows, total))
        })
    }

    pub fn unread_notification_count(&self, user_id: &str, view: NotificationView) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM notifications n
                     WHERE n.user_id = ?1 AND n.is_read = 0 AND {}",
                    view_filter(view)
                ),
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Marks one feed notification read. Returns false when it does not
    /// belong to `user_id` or is admin-only.
    pub fn mark_notification_read(&self, user_id: &str, id: &str) -> Result<bool> {
        self.with_conn_mut(|tx| {
            let changed = tx.execute(
                &format!(
                    "UPDATE notifications AS n SET is_read = 1
                     WHERE n.id = ?1 AND n.user_id = ?2 AND {}",
                    view_filter(NotificationView::Feed)
                ),
                (id, user_id),
            )?;
            Ok(changed == 1)
        })
    }

    /// Marks every feed notification read. Admin-only rows are untouched.
    pub fn mark_all_notifications_read(&self, user_id: &str) -> Result<usize> {
        self.with_conn_mut(|tx| {
            let changed = tx.execute(
                &format!(
                    "UPDATE notifications AS n SET is_read = 1
                     WHERE n.user_id = ?1 AND n.is_read = 0 AND {}",
                    view_filter(NotificationView::Feed)
                ),
                [user_id],
            )?;
            Ok(changed)
        })
    }

    pub fn delete_notification(&self, user_id: &str, id: &str) -> Result<DeleteOutcome> {
        let feed = view_filter(NotificationView::Feed);
        self.with_conn_mut(|tx| {
            let is_read: Option<bool> = tx
                .query_row(
                    &format!("SELECT n.is_read FROM notifications n WHERE n.id = ?1 AND n.user_id = ?2 AND {feed}"),
                    (id, user_id),
                    |row| row.get(0),
                )
                .optional()?;

            let Some(is_read) = is_read else {
                return Ok(DeleteOutcome::NotFound);
            };

            tx.execute("DELETE FROM notifications WHERE id = ?1 AND user_id = ?2", (id, user_id))?;
            Ok(DeleteOutcome::Deleted { was_unread: !is_read })
        })
    }

    /// Deletes every feed notification of `user_id`.
    pub fn delete_all_notifications(&self, user_id: &str) -> Result<usize> {
        self.with_conn_mut(|tx| {
            let deleted = tx.execute(
                &format!(
                    "DELETE FROM notifications AS n WHERE n.user_id = ?1 AND {}",
                    view_filter(NotificationView::Feed)
                ),
                [user_id],
            )?;
            Ok(deleted)
        })
    }
}

fn query_notification(conn: &Connection, id: &str) -> Result<Option<NotificationRow>> {
    let row = conn
        .query_row(&format!("{NOTIFICATION_SELECT} WHERE n.id = ?1"), [id], notification_from_row)
        .optional()?;
    Ok(row)
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationRow> {
    let sender = match row.get::<_, Option<String>>(10)? {
        Some(_) => Some(user_from_row(row, 10)?),
        None => None,
    };

    Ok(NotificationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        sender_id: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        kind: row.get(5)?,
        related_type: row.get(6)?,
        related_id: row.get(7)?,
        is_read: row.get(8)?,
        created_at: row.get(9)?,
        sender,
    })
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::test_support;

    fn notify(db: &Database, to: &str, from: Option<&str>, kind: NotificationKind) -> String {
        let id = Uuid::new_v4().to_string();
        db.insert_notification(&NewNotification {
            id: &id,
            user_id: to,
            sender_id: from,
            title: "title",
            content: "content",
            kind: kind.as_str(),
            related_type: Some("post"),
            related_id: Some("42"),
        })
        .unwrap();
        id
    }

    #[test]
    fn insert_resolves_sender() {
        let db = test_support::db();
        let owner = test_support::user(&db, "An", "Tran").to_string();
        let fan = test_support::user(&db, "Binh", "Le").to_string();

        let id = Uuid::new_v4().to_string();
        let row = db
            .insert_notification(&NewNotification {
                id: &id,
                user_id: &owner,
                sender_id: Some(&fan),
                title: "New like",
                content: "liked your post",
                kind: "like",
                related_type: Some("post"),
                related_id: Some("7"),
            })
            .unwrap();
        assert!(!row.is_read);
        assert_eq!(row.sender.unwrap().first_name.as_deref(), Some("Binh"));
    }

    #[test]
    fn feed_and_admin_views_are_disjoint() {
        let db = test_support::db();
        let admin = test_support::admin(&db, "Root").to_string();
        let author = test_support::user(&db, "An", "Tran").to_string();

        notify(&db, &admin, Some(&author), NotificationKind::PostApproval);
        notify(&db, &admin, Some(&author), NotificationKind::ReportNew);
        notify(&db, &admin, None, NotificationKind::System);
        notify(&db, &admin, Some(&author), NotificationKind::Follow);

        let (feed, feed_total) = db
            .list_notifications(&admin, NotificationView::Feed, NotificationTab::All, 10, 0)
            .unwrap();
        let (admin_rows, admin_total) = db
            .list_notifications(&admin, NotificationView::Admin, NotificationTab::All, 10, 0)
            .unwrap();
        assert_eq!((feed.len(), feed_total), (2, 2));
        assert_eq!((admin_rows.len(), admin_total), (2, 2));
        assert!(feed.iter().all(|n| n.kind != "post_approval" && n.kind != "report_new"));
        assert!(admin_rows.iter().all(|n| n.kind == "post_approval" || n.kind == "report_new"));

        let (system, _) = db
            .list_notifications(&admin, NotificationView::Feed, NotificationTab::System, 10, 0)
            .unwrap();
        assert_eq!(system.len(), 1);
        assert!(system[0].sender.is_none());

        assert_eq!(db.unread_notification_count(&admin, NotificationView::Feed).unwrap(), 2);
        assert_eq!(db.unread_notification_count(&admin, NotificationView::Admin).unwrap(), 2);

        // Feed operations leave admin rows alone
        let review = notify(&db, &admin, Some(&author), NotificationKind::PostApproval);
        assert!(!db.mark_notification_read(&admin, &review).unwrap());
        assert!(matches!(db.delete_notification(&admin, &review).unwrap(), DeleteOutcome::NotFound));
        assert_eq!(db.unread_notification_count(&admin, NotificationView::Admin).unwrap(), 3);
        let (rows, _) = db
            .list_notifications(&admin, NotificationView::Admin, NotificationTab::Unread, 10, 0)
            .unwrap();
        assert!(rows.iter().any(|n| n.id == review));

        assert_eq!(db.mark_all_notifications_read(&admin).unwrap(), 2);
        assert_eq!(db.unread_notification_count(&admin, NotificationView::Admin).unwrap(), 3);
        assert_eq!(db.delete_all_notifications(&admin).unwrap(), 2);
        let (_, admin_total) = db
            .list_notifications(&admin, NotificationView::Admin, NotificationTab::All, 10, 0)
            .unwrap();
        assert_eq!(admin_total, 3);
    }

    #[test]
    fn read_state_and_deletion_are_owner_scoped() {
        let db = test_support::db();
        let owner = test_support::user(&db, "An", "Tran").to_string();
        let other = test_support::user(&db, "Binh", "Le").to_string();
        let first = notify(&db, &owner, Some(&other), NotificationKind::Like);
        let second = notify(&db, &owner, Some(&other), NotificationKind::Comment);

        assert!(!db.mark_notification_read(&other, &first).unwrap());
        assert!(db.mark_notification_read(&owner, &first).unwrap());

        let (unread, total) = db
            .list_notifications(&owner, NotificationView::Feed, NotificationTab::Unread, 10, 0)
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(unread[0].id, second);

        assert!(matches!(db.delete_notification(&other, &second).unwrap(), DeleteOutcome::NotFound));
        assert!(matches!(
            db.delete_notification(&owner, &second).unwrap(),
            DeleteOutcome::Deleted { was_unread: true }
        ));
        assert!(matches!(
            db.delete_notification(&owner, &first).unwrap(),
            DeleteOutcome::Deleted { was_unread: false }
        ));
        assert!(matches!(db.delete_notification(&owner, &first).unwrap(), DeleteOutcome::NotFound));
    }
}
