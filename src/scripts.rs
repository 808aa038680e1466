/// Personalized delivery scripts
///
/// Couriers may store one greeting each; it overrides the default message
/// at delivery time.
use crate::error::CoreResult;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

/// Delivery script manager
#[derive(Clone)]
pub struct DeliveryScripts {
    db: SqlitePool,
}

impl DeliveryScripts {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Upsert the script for an owner
    pub async fn set(&self, owner_id: &str, script: &str) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_script (owner_id, script, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (owner_id) DO UPDATE SET
                script = excluded.script,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(owner_id)
        .bind(script)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Fetch the script for an owner, if set
    pub async fn get(&self, owner_id: &str) -> CoreResult<Option<String>> {
        let row = sqlx::query("SELECT script FROM delivery_script WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_optional(&self.db)
            .await?;

        Ok(row.map(|r| r.try_get("script")).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_set_and_overwrite() {
        let scripts = DeliveryScripts::new(test_pool().await);

        assert_eq!(scripts.get("courier-1").await.unwrap(), None);

        scripts.set("courier-1", "Enjoy!").await.unwrap();
        assert_eq!(
            scripts.get("courier-1").await.unwrap().as_deref(),
            Some("Enjoy!")
        );

        scripts.set("courier-1", "Bon appetit.").await.unwrap();
        assert_eq!(
            scripts.get("courier-1").await.unwrap().as_deref(),
            Some("Bon appetit.")
        );
    }
}
