/// Disciplinary engine: strikes, suspensions and bans
///
/// Strikes accumulate per account; the first matching threshold for the
/// new count applies on that call and nothing else does. Thresholds are
/// not cumulative, so a count that is already past a threshold does not
/// re-apply it.
use crate::error::{CoreError, CoreResult};
use crate::ledger::{account_from_row, parse_timestamp};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

const SUSPENSION_FIRST_DAYS: i64 = 7;
const SUSPENSION_SECOND_DAYS: i64 = 30;

/// What a strike led to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consequence {
    None,
    Suspended { until: DateTime<Utc> },
    PermanentBan,
}

/// Result of issuing one strike
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrikeOutcome {
    pub account_id: String,
    pub strike_count: i64,
    pub consequence: Consequence,
}

/// Append-only strike history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrikeRecord {
    pub id: i64,
    pub account_id: String,
    pub reason: String,
    pub moderator: String,
    pub created_at: DateTime<Utc>,
}

/// Disciplinary engine
#[derive(Clone)]
pub struct Discipline {
    db: SqlitePool,
}

impl Discipline {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Issue a strike against an account
    pub async fn strike(
        &self,
        account_id: &str,
        reason: &str,
        moderator: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<StrikeOutcome> {
        sqlx::query("INSERT OR IGNORE INTO account (id, created_at) VALUES (?, ?)")
            .bind(account_id)
            .bind(now.to_rfc3339())
            .execute(&self.db)
            .await?;

        sqlx::query("UPDATE account SET strike_count = strike_count + 1 WHERE id = ?")
            .bind(account_id)
            .execute(&self.db)
            .await?;

        let row = sqlx::query("SELECT strike_count FROM account WHERE id = ?")
            .bind(account_id)
            .fetch_one(&self.db)
            .await?;
        let strike_count: i64 = row.try_get("strike_count")?;

        // First matching threshold only
        let consequence = if strike_count == 3 {
            let until = now + Duration::days(SUSPENSION_FIRST_DAYS);
            self.set_suspension(account_id, until).await?;
            Consequence::Suspended { until }
        } else if strike_count == 6 {
            let until = now + Duration::days(SUSPENSION_SECOND_DAYS);
            self.set_suspension(account_id, until).await?;
            Consequence::Suspended { until }
        } else if strike_count >= 9 {
            sqlx::query("UPDATE account SET perm_banned = 1 WHERE id = ?")
                .bind(account_id)
                .execute(&self.db)
                .await?;
            Consequence::PermanentBan
        } else {
            Consequence::None
        };

        sqlx::query(
            "INSERT INTO strike_history (account_id, reason, moderator, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(reason)
        .bind(moderator)
        .bind(now.to_rfc3339())
        .execute(&self.db)
        .await?;

        Ok(StrikeOutcome {
            account_id: account_id.to_string(),
            strike_count,
            consequence,
        })
    }

    async fn set_suspension(&self, account_id: &str, until: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE account SET suspended_until = ? WHERE id = ?")
            .bind(until.to_rfc3339())
            .bind(account_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Manual service ban for a fixed number of days; the strike counter
    /// is left untouched
    pub async fn ban(
        &self,
        account_id: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> CoreResult<DateTime<Utc>> {
        if days <= 0 {
            return Err(CoreError::Validation("Ban duration must be positive".to_string()));
        }

        sqlx::query("INSERT OR IGNORE INTO account (id, created_at) VALUES (?, ?)")
            .bind(account_id)
            .bind(now.to_rfc3339())
            .execute(&self.db)
            .await?;

        let until = now + Duration::days(days);
        self.set_suspension(account_id, until).await?;

        Ok(until)
    }

    /// Lift a ban or suspension and reset the strike counter
    pub async fn unban(&self, account_id: &str) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE account SET strike_count = 0, suspended_until = NULL, perm_banned = 0 \
             WHERE id = ?",
        )
        .bind(account_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Account {}", account_id)));
        }

        Ok(())
    }

    /// Full strike history for an account, newest first
    pub async fn history(&self, account_id: &str) -> CoreResult<Vec<StrikeRecord>> {
        let rows = sqlx::query(
            "SELECT id, account_id, reason, moderator, created_at \
             FROM strike_history WHERE account_id = ? ORDER BY id DESC",
        )
        .bind(account_id)
        .fetch_all(&self.db)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(StrikeRecord {
                id: row.try_get("id")?,
                account_id: row.try_get("account_id")?,
                reason: row.try_get("reason")?,
                moderator: row.try_get("moderator")?,
                created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            });
        }

        Ok(records)
    }

    /// Whether an account may use the service at all
    pub async fn is_restricted(&self, account_id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let row = sqlx::query("SELECT * FROM account WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            None => Ok(false),
            Some(row) => Ok(account_from_row(&row)?.is_blocked(now)),
        }
    }
}
