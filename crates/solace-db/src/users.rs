//! Read access to identity rows. Users are owned by the identity service;
//! `create_user` and `add_follower` exist for provisioning and fixtures.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row};

use crate::Database;
use crate::models::UserRow;

impl Database {
    pub fn create_user(
        &self,
        id: &str,
        first_name: &str,
        last_name: &str,
        avatar_url: Option<&str>,
        role: &str,
    ) -> Result<()> {
        self.with_conn_mut(|tx| {
            tx.execute(
                "INSERT INTO users (id, first_name, last_name, avatar_url, role) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, first_name, last_name, avatar_url, role],
            )?;
            Ok(())
        })
    }

    pub fn add_follower(&self, follower_id: &str, user_id: &str) -> Result<()> {
        self.with_conn_mut(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO user_relationships (follower_id, user_id) VALUES (?1, ?2)",
                (follower_id, user_id),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    pub fn admin_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM users WHERE role = 'admin' ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    pub fn follower_ids(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT follower_id FROM user_relationships WHERE user_id = ?1 ORDER BY follower_id",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }
}

pub(crate) fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let row = conn
        .query_row(
            "SELECT id, first_name, last_name, avatar_url, role FROM users WHERE id = ?1",
            [id],
            |row| user_from_row(row, 0),
        )
        .optional()?;

    Ok(row)
}

/// Returns the ids from `ids` that have no user row.
pub(crate) fn missing_users(conn: &Connection, ids: &[String]) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT 1 FROM users WHERE id = ?1")?;
    let mut missing = Vec::new();
    for id in ids {
        if !stmt.exists([id])? {
            missing.push(id.clone());
        }
    }
    Ok(missing)
}

/// Maps five consecutive columns (id, first_name, last_name, avatar_url, role)
/// starting at `offset`.
pub(crate) fn user_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(offset)?,
        first_name: row.get(offset + 1)?,
        last_name: row.get(offset + 2)?,
        avatar_url: row.get(offset + 3)?,
        role: row.get(offset + 4)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::test_support;

    #[test]
    fn admins_and_followers() {
        let db = test_support::db();
        let author = test_support::user(&db, "An", "Tran");
        let fan = test_support::user(&db, "Binh", "Le");
        let admin = test_support::admin(&db, "Root");

        db.add_follower(&fan.to_string(), &author.to_string()).unwrap();
        db.add_follower(&fan.to_string(), &author.to_string()).unwrap();

        assert_eq!(db.admin_ids().unwrap(), vec![admin.to_string()]);
        assert_eq!(db.follower_ids(&author.to_string()).unwrap(), vec![fan.to_string()]);
        assert!(db.follower_ids(&fan.to_string()).unwrap().is_empty());
    }
}
