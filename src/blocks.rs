/// Server-context blocks
///
/// A blocked origin context cannot create orders. Blocks are upserted by
/// the owner, optionally expire, and expired rows are swept by a job.
use crate::error::CoreResult;
use crate::ledger::parse_timestamp;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Server block record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerBlock {
    pub context_id: String,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_by: String,
    pub created_at: DateTime<Utc>,
}

/// Server block manager
#[derive(Clone)]
pub struct ServerBlocks {
    db: SqlitePool,
}

impl ServerBlocks {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Upsert a block for a context
    pub async fn block(
        &self,
        context_id: &str,
        reason: &str,
        duration_days: Option<i64>,
        issued_by: &str,
    ) -> CoreResult<ServerBlock> {
        let now = Utc::now();
        let expires_at = duration_days.map(|d| now + Duration::days(d));

        sqlx::query(
            r#"
            INSERT INTO server_block (context_id, reason, expires_at, issued_by, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (context_id) DO UPDATE SET
                reason = excluded.reason,
                expires_at = excluded.expires_at,
                issued_by = excluded.issued_by,
                created_at = excluded.created_at
            "#,
        )
        .bind(context_id)
        .bind(reason)
        .bind(expires_at.map(|dt| dt.to_rfc3339()))
        .bind(issued_by)
        .bind(now.to_rfc3339())
        .execute(&self.db)
        .await?;

        Ok(ServerBlock {
            context_id: context_id.to_string(),
            reason: reason.to_string(),
            expires_at,
            issued_by: issued_by.to_string(),
            created_at: now,
        })
    }

    /// Remove a block
    pub async fn unblock(&self, context_id: &str) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM server_block WHERE context_id = ?")
            .bind(context_id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Whether a context is blocked right now
    pub async fn is_blocked(&self, context_id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let row = sqlx::query("SELECT expires_at FROM server_block WHERE context_id = ?")
            .bind(context_id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            None => Ok(false),
            Some(row) => {
                let expires_at = row
                    .try_get::<Option<String>, _>("expires_at")?
                    .map(|s| parse_timestamp(&s))
                    .transpose()?;
                Ok(expires_at.map_or(true, |exp| now < exp))
            }
        }
    }

    /// Delete expired blocks, returning how many were removed
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        let result =
            sqlx::query("DELETE FROM server_block WHERE expires_at IS NOT NULL AND expires_at < ?")
                .bind(now.to_rfc3339())
                .execute(&self.db)
                .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_block_and_unblock() {
        let blocks = ServerBlocks::new(test_pool().await);
        let now = Utc::now();

        assert!(!blocks.is_blocked("ctx-1", now).await.unwrap());

        blocks.block("ctx-1", "spam", None, "owner-1").await.unwrap();
        assert!(blocks.is_blocked("ctx-1", now).await.unwrap());

        assert!(blocks.unblock("ctx-1").await.unwrap());
        assert!(!blocks.is_blocked("ctx-1", now).await.unwrap());
        assert!(!blocks.unblock("ctx-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expiry_honored_and_swept() {
        let blocks = ServerBlocks::new(test_pool().await);
        let now = Utc::now();

        blocks.block("ctx-1", "cooldown", Some(7), "owner-1").await.unwrap();
        assert!(blocks.is_blocked("ctx-1", now).await.unwrap());
        assert!(!blocks
            .is_blocked("ctx-1", now + Duration::days(8))
            .await
            .unwrap());

        let removed = blocks.cleanup_expired(now + Duration::days(8)).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_reblock_overwrites() {
        let blocks = ServerBlocks::new(test_pool().await);
        let now = Utc::now();

        blocks.block("ctx-1", "first", Some(1), "owner-1").await.unwrap();
        blocks.block("ctx-1", "second", None, "owner-1").await.unwrap();

        // Permanent after the upsert
        assert!(blocks
            .is_blocked("ctx-1", now + Duration::days(30))
            .await
            .unwrap());
    }
}
