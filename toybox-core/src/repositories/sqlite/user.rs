// src/repositories/sqlite/user.rs

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

use toybox_common::models::{User, UserUpdate};
use toybox_common::traits::PointsLedger;

use crate::utils::time::{current_epoch, from_epoch};
use crate::Error;

const USER_COLUMNS: &str =
    "user_id, display_name, points, points_spent, banned, first_seen, last_seen";

/// Points ledger on top of the embedded database.
///
/// Balances only ever change through `points = points + ?`, inside the same
/// transaction as the usage counter, so concurrent updates to one user
/// cannot lose each other.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: Pool<Sqlite>,
}

impl SqliteLedger {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn usage_count(&self, user_id: &str, command: &str) -> Result<i64, Error> {
        let row = sqlx::query("SELECT uses FROM command_usage WHERE user_id = ? AND command = ?")
            .bind(user_id)
            .bind(command)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(r.try_get::<i64, _>("uses")?),
            None => Ok(0),
        }
    }

    pub async fn last_stream(&self, user_id: &str) -> Result<Option<String>, Error> {
        let row = sqlx::query("SELECT last_stream FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(r.try_get::<Option<String>, _>("last_stream")?),
            None => Ok(None),
        }
    }

    async fn set_banned(&self, id: &str, banned: bool) -> Result<(), Error> {
        let result = sqlx::query("UPDATE users SET banned = ? WHERE user_id = ?")
            .bind(banned)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user '{id}'")));
        }
        Ok(())
    }
}

fn row_to_user(r: &SqliteRow) -> Result<User, Error> {
    Ok(User {
        id: r.try_get("user_id")?,
        display_name: r.try_get("display_name")?,
        points: r.try_get("points")?,
        points_spent: r.try_get("points_spent")?,
        banned: r.try_get::<i64, _>("banned")? != 0,
        first_seen: from_epoch(r.try_get::<i64, _>("first_seen")?),
        last_seen: from_epoch(r.try_get::<i64, _>("last_seen")?),
    })
}

#[async_trait]
impl PointsLedger for SqliteLedger {
    async fn get_user(&self, id: &str) -> Result<Option<User>, Error> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn update_user(&self, id: &str, update: &UserUpdate) -> Result<(), Error> {
        let now = current_epoch();
        let delta = update.relative_points.unwrap_or(0);
        let spent = update.spent();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO users (user_id, display_name, points, points_spent, banned, last_stream, first_seen, last_seen)
            VALUES (?1, COALESCE(?2, ?1), ?3, ?4, 0, ?5, ?6, ?6)
            ON CONFLICT(user_id) DO UPDATE SET
                display_name = COALESCE(?2, users.display_name),
                points = users.points + ?3,
                points_spent = users.points_spent + ?4,
                last_stream = COALESCE(?5, users.last_stream),
                last_seen = ?6
            "#,
        )
        .bind(id)
        .bind(update.display_name.as_deref())
        .bind(delta)
        .bind(spent)
        .bind(update.stream_id.as_deref())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if let Some(command) = &update.command {
            sqlx::query(
                r#"
                INSERT INTO command_usage (user_id, command, uses, last_used)
                VALUES (?, ?, 1, ?)
                ON CONFLICT(user_id, command) DO UPDATE SET
                    uses = command_usage.uses + 1,
                    last_used = excluded.last_used
                "#,
            )
            .bind(id)
            .bind(command)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn ban(&self, id: &str) -> Result<(), Error> {
        self.set_banned(id, true).await
    }

    async fn unban(&self, id: &str) -> Result<(), Error> {
        self.set_banned(id, false).await
    }

    async fn find_by_display_name(&self, name: &str) -> Result<Vec<User>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE display_name = ? ORDER BY last_seen DESC"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_user).collect()
    }

    async fn top_users(&self, limit: i64) -> Result<Vec<User>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY points DESC, user_id ASC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_user).collect()
    }
}
