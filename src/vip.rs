/// VIP membership codes
///
/// Codes are minted in batches by the owner and consumed exactly once:
/// redemption flips `used` with a conditional update, so two concurrent
/// redemptions of the same code resolve to one winner.
use crate::error::{CoreError, CoreResult};
use crate::ledger::Ledger;
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use sqlx::SqlitePool;

/// VIP code manager
#[derive(Clone)]
pub struct VipCodes {
    db: SqlitePool,
}

impl VipCodes {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Generate a single code string
    pub fn generate_code() -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();

        format!("vip-{}", suffix.to_lowercase())
    }

    /// Mint a batch of unique codes
    pub async fn generate_batch(&self, amount: u32) -> CoreResult<Vec<String>> {
        if amount == 0 || amount > 100 {
            return Err(CoreError::Validation(
                "Code batch size must be between 1 and 100".to_string(),
            ));
        }

        let now = Utc::now().to_rfc3339();
        let mut codes = Vec::with_capacity(amount as usize);

        while codes.len() < amount as usize {
            let code = Self::generate_code();
            let inserted =
                sqlx::query("INSERT OR IGNORE INTO vip_code (code, created_at) VALUES (?, ?)")
                    .bind(&code)
                    .bind(&now)
                    .execute(&self.db)
                    .await?;
            // Collision: roll again
            if inserted.rows_affected() > 0 {
                codes.push(code);
            }
        }

        Ok(codes)
    }

    /// Redeem a code for the given account, extending VIP by 30 days.
    /// Returns the new VIP expiry.
    pub async fn redeem(
        &self,
        code: &str,
        account_id: &str,
        ledger: &Ledger,
        now: DateTime<Utc>,
    ) -> CoreResult<DateTime<Utc>> {
        let result = sqlx::query("UPDATE vip_code SET used = 1 WHERE code = ? AND used = 0")
            .bind(code)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound("VIP code invalid or already used".to_string()));
        }

        ledger.extend_vip(account_id, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Duration;

    #[tokio::test]
    async fn test_batch_generation_is_unique() {
        let codes = VipCodes::new(test_pool().await);

        let batch = codes.generate_batch(20).await.unwrap();
        assert_eq!(batch.len(), 20);
        let unique: std::collections::HashSet<_> = batch.iter().collect();
        assert_eq!(unique.len(), 20);
        assert!(batch.iter().all(|c| c.starts_with("vip-")));
    }

    #[tokio::test]
    async fn test_batch_size_bounds() {
        let codes = VipCodes::new(test_pool().await);
        assert!(codes.generate_batch(0).await.is_err());
        assert!(codes.generate_batch(101).await.is_err());
    }

    #[tokio::test]
    async fn test_redeem_is_one_way() {
        let pool = test_pool().await;
        let codes = VipCodes::new(pool.clone());
        let ledger = Ledger::new(pool);
        let now = Utc::now();

        let batch = codes.generate_batch(1).await.unwrap();
        let code = &batch[0];

        let until = codes.redeem(code, "user-1", &ledger, now).await.unwrap();
        assert_eq!(until, now + Duration::days(30));
        assert!(ledger.get("user-1").await.unwrap().is_vip(now));

        // Second redemption fails even for another account
        let err = codes.redeem(code, "user-2", &ledger, now).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_redeem_stacks_on_active_membership() {
        let pool = test_pool().await;
        let codes = VipCodes::new(pool.clone());
        let ledger = Ledger::new(pool);
        let now = Utc::now();

        let batch = codes.generate_batch(2).await.unwrap();
        codes.redeem(&batch[0], "user-1", &ledger, now).await.unwrap();
        let until = codes.redeem(&batch[1], "user-1", &ledger, now).await.unwrap();

        assert_eq!(until, now + Duration::days(60));
    }

    #[tokio::test]
    async fn test_unknown_code_rejected() {
        let pool = test_pool().await;
        let codes = VipCodes::new(pool.clone());
        let ledger = Ledger::new(pool);

        let err = codes
            .redeem("vip-nope", "user-1", &ledger, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
