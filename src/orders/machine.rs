/// Order lifecycle state machine
///
/// Every status change is a conditional update: the row transitions only
/// if it is still in the expected pre-state, and a zero-row update means
/// someone else got there first. That one discipline covers the claim
/// race, the prep timer firing after a cancellation, and the failsafe
/// sweep overlapping an in-flight delivery.
use crate::blocks::ServerBlocks;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{parse_timestamp, Account, Ledger, OrderKind};
use crate::notify::{notify_best_effort, NotificationSink, NotifyTarget, OrderArchive};
use crate::orders::{
    generate_order_id, order_from_row, Order, OrderStatus, OriginContext, PriceTier,
    SYSTEM_FAILSAFE,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

/// Delay between prep start and the order becoming ready
pub const PREP_DURATION_SECS: i64 = 180;
/// A ready order older than this is force-delivered by the sweep
pub const READY_STALE_MINUTES: i64 = 20;

const TERMINAL_STATUSES: &str = "('delivered', 'cancelled_unprepped', 'cancelled_predelivery', 'refunded')";

/// Order state machine and store
#[derive(Clone)]
pub struct OrderMachine {
    db: SqlitePool,
    ledger: Ledger,
    blocks: ServerBlocks,
    notifier: Arc<dyn NotificationSink>,
    archive: Arc<dyn OrderArchive>,
}

impl OrderMachine {
    pub fn new(
        db: SqlitePool,
        ledger: Ledger,
        blocks: ServerBlocks,
        notifier: Arc<dyn NotificationSink>,
        archive: Arc<dyn OrderArchive>,
    ) -> Self {
        Self {
            db,
            ledger,
            blocks,
            notifier,
            archive,
        }
    }

    /// Fetch an order by id
    pub async fn get(&self, order_id: &str) -> CoreResult<Order> {
        let row = sqlx::query("SELECT * FROM orders WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Order {}", order_id)))?;

        order_from_row(&row)
    }

    /// The requester's non-terminal order, if any
    pub async fn active_for(&self, requester_id: &str) -> CoreResult<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM orders WHERE requester_id = ? AND status NOT IN {} LIMIT 1",
            TERMINAL_STATUSES
        ))
        .bind(requester_id)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(order_from_row).transpose()
    }

    /// Create a new order in `pending`, debiting the price up front.
    ///
    /// The one-active-order rule is enforced inside the INSERT itself, so
    /// two concurrent creations cannot both land; the loser's debit is
    /// compensated.
    pub async fn create(
        &self,
        requester: &Account,
        origin: OriginContext,
        item: &str,
        kind: OrderKind,
        now: DateTime<Utc>,
    ) -> CoreResult<Order> {
        if item.trim().is_empty() {
            return Err(CoreError::Validation("Item cannot be empty".to_string()));
        }
        if self.blocks.is_blocked(&origin.context, now).await? {
            return Err(CoreError::Unauthorized(format!(
                "Origin context {} is blocked",
                origin.context
            )));
        }

        let is_vip = requester.is_vip(now);
        let price = self.ledger.price_for(kind, is_vip)?;
        let tier = match kind {
            OrderKind::Super => PriceTier::Priority,
            OrderKind::Standard if is_vip => PriceTier::Discount,
            OrderKind::Standard => PriceTier::Standard,
        };

        self.ledger.charge(&requester.id, price).await?;

        let order_id = match self.insert_pending(requester, &origin, item, tier, price, now).await {
            Ok(order_id) => order_id,
            Err(e) => {
                // Compensate the debit; the order never existed
                self.ledger.credit(&requester.id, price).await?;
                return Err(e);
            }
        };

        self.sync_archive(&order_id).await;
        let alert = match tier {
            PriceTier::Priority => format!("PRIORITY request {}: {}", order_id, item),
            _ => format!("New request {}: {}", order_id, item),
        };
        notify_best_effort(&self.notifier, NotifyTarget::Staff, &alert).await;

        self.get(&order_id).await
    }

    async fn insert_pending(
        &self,
        requester: &Account,
        origin: &OriginContext,
        item: &str,
        tier: PriceTier,
        price: i64,
        now: DateTime<Utc>,
    ) -> CoreResult<String> {
        // Retry a handful of times on order-id collisions
        for _ in 0..5 {
            let order_id = generate_order_id();

            let result = sqlx::query(&format!(
                "INSERT INTO orders \
                 (order_id, requester_id, origin_context, origin_channel, status, item, \
                  price_tier, price_paid, created_at) \
                 SELECT ?, ?, ?, ?, 'pending', ?, ?, ?, ? \
                 WHERE NOT EXISTS \
                   (SELECT 1 FROM orders WHERE requester_id = ? AND status NOT IN {})",
                TERMINAL_STATUSES
            ))
            .bind(&order_id)
            .bind(&requester.id)
            .bind(&origin.context)
            .bind(&origin.channel)
            .bind(item)
            .bind(tier.as_str())
            .bind(price)
            .bind(now.to_rfc3339())
            .bind(&requester.id)
            .execute(&self.db)
            .await;

            match result {
                Ok(done) if done.rows_affected() == 0 => {
                    return Err(CoreError::DuplicateActive(format!(
                        "Account {} already has an active order",
                        requester.id
                    )));
                }
                Ok(_) => return Ok(order_id),
                // Unique violation on the generated id: roll a new one
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(CoreError::Internal("Order id space exhausted".to_string()))
    }

    /// Claim a pending order for a cook. At most one claimant wins.
    pub async fn claim(
        &self,
        order_id: &str,
        cook_id: &str,
        cook_label: &str,
    ) -> CoreResult<Order> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'claimed', cook_id = ?, cook_label = ? \
             WHERE order_id = ? AND status = 'pending'",
        )
        .bind(cook_id)
        .bind(cook_label)
        .bind(order_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a lost race from a bad id
            let current = self.get(order_id).await?;
            return Err(CoreError::InvalidState(format!(
                "Order {} is no longer available ({})",
                order_id,
                current.status.as_str()
            )));
        }

        self.sync_archive(order_id).await;
        self.get(order_id).await
    }

    /// Start preparation: store evidence and enqueue the delayed
    /// preparing-to-ready transition.
    pub async fn prepare(
        &self,
        order_id: &str,
        cook_id: &str,
        evidence: Vec<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<Order> {
        if evidence.is_empty() {
            return Err(CoreError::Validation(
                "At least one evidence asset is required".to_string(),
            ));
        }

        let evidence_json = serde_json::to_string(&evidence)
            .map_err(|e| CoreError::Internal(format!("Evidence encoding failed: {}", e)))?;

        let result = sqlx::query(
            "UPDATE orders SET status = 'preparing', evidence = ? \
             WHERE order_id = ? AND status = 'claimed' AND cook_id = ?",
        )
        .bind(&evidence_json)
        .bind(order_id)
        .bind(cook_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get(order_id).await?;
            if current.status != OrderStatus::Claimed {
                return Err(CoreError::InvalidState(format!(
                    "Order {} is not claimed ({})",
                    order_id,
                    current.status.as_str()
                )));
            }
            return Err(CoreError::InvalidState(format!(
                "Order {} is claimed by another cook",
                order_id
            )));
        }

        let fire_at = now + Duration::seconds(PREP_DURATION_SECS);
        sqlx::query("INSERT INTO scheduled_transition (order_id, fire_at) VALUES (?, ?)")
            .bind(order_id)
            .bind(fire_at.to_rfc3339())
            .execute(&self.db)
            .await?;

        self.sync_archive(order_id).await;
        self.get(order_id).await
    }

    /// Complete preparation. Fired by the scheduled-transition runner; a
    /// no-op when the order has left `preparing` in the meantime.
    pub async fn finish_prep(&self, order_id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'ready', ready_at = ? \
             WHERE order_id = ? AND status = 'preparing'",
        )
        .bind(now.to_rfc3339())
        .bind(order_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let order = self.get(order_id).await?;
        if let Some(cook_id) = &order.cook_id {
            self.ledger.settle_cook_completion(cook_id, now).await?;
        }

        self.sync_archive(order_id).await;
        notify_best_effort(
            &self.notifier,
            NotifyTarget::Staff,
            &format!("Order {} is ready for delivery", order_id),
        )
        .await;

        Ok(true)
    }

    /// Deliver a ready order as a human courier
    pub async fn deliver(
        &self,
        order_id: &str,
        courier_id: &str,
        script: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<Order> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'delivered', courier_id = ? \
             WHERE order_id = ? AND status = 'ready'",
        )
        .bind(courier_id)
        .bind(order_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get(order_id).await?;
            return Err(CoreError::InvalidState(format!(
                "Order {} is not ready ({})",
                order_id,
                current.status.as_str()
            )));
        }

        self.ledger.settle_courier_delivery(courier_id, now).await?;

        let order = self.get(order_id).await?;
        let message = script.unwrap_or_else(|| "Your order has been delivered. Enjoy!".to_string());
        notify_best_effort(
            &self.notifier,
            NotifyTarget::Origin(order.origin.clone()),
            &message,
        )
        .await;
        self.sync_archive(order_id).await;

        Ok(order)
    }

    /// Cancel an order that has not entered preparation
    pub async fn cancel_unprepped(&self, order_id: &str) -> CoreResult<Order> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'cancelled_unprepped' \
             WHERE order_id = ? AND status IN ('pending', 'claimed')",
        )
        .bind(order_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get(order_id).await?;
            return Err(CoreError::InvalidState(format!(
                "Order {} cannot be cancelled unprepped ({})",
                order_id,
                current.status.as_str()
            )));
        }

        self.sync_archive(order_id).await;
        self.get(order_id).await
    }

    /// Manager force-cancel of any order that has not been delivered
    pub async fn cancel_predelivery(&self, order_id: &str) -> CoreResult<Order> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'cancelled_predelivery' \
             WHERE order_id = ? AND status IN ('pending', 'claimed', 'preparing', 'ready')",
        )
        .bind(order_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get(order_id).await?;
            return Err(CoreError::InvalidState(format!(
                "Order {} is already terminal ({})",
                order_id,
                current.status.as_str()
            )));
        }

        self.sync_archive(order_id).await;
        self.get(order_id).await
    }

    /// Refund an order, restoring the exact price paid. An already
    /// refunded order is rejected and the balance untouched.
    pub async fn refund(&self, order_id: &str) -> CoreResult<Order> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'refunded' \
             WHERE order_id = ? AND status != 'refunded'",
        )
        .bind(order_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            // Missing row and already-refunded row both land here
            self.get(order_id).await?;
            return Err(CoreError::InvalidState(format!(
                "Order {} is already refunded",
                order_id
            )));
        }

        let order = self.get(order_id).await?;
        self.ledger.credit(&order.requester_id, order.price_paid).await?;

        self.sync_archive(order_id).await;
        Ok(order)
    }

    /// Force-deliver ready orders that have sat past the staleness
    /// threshold. Each order is its own conditional update, so a delivery
    /// that lands mid-sweep simply makes the sweep miss it, and one
    /// failing order never aborts the batch.
    pub async fn failsafe_sweep(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        let limit = now - Duration::minutes(READY_STALE_MINUTES);

        let rows = sqlx::query(
            "SELECT order_id FROM orders WHERE status = 'ready' AND ready_at < ?",
        )
        .bind(limit.to_rfc3339())
        .fetch_all(&self.db)
        .await?;

        let mut swept = 0;
        for row in rows {
            let order_id: String = row.try_get("order_id")?;
            match self.force_deliver(&order_id, limit).await {
                Ok(true) => swept += 1,
                Ok(false) => {}
                Err(e) => tracing::error!("Failsafe dispatch failed for {}: {}", order_id, e),
            }
        }

        Ok(swept)
    }

    async fn force_deliver(&self, order_id: &str, limit: DateTime<Utc>) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'delivered', courier_id = ? \
             WHERE order_id = ? AND status = 'ready' AND ready_at < ?",
        )
        .bind(SYSTEM_FAILSAFE)
        .bind(order_id)
        .bind(limit.to_rfc3339())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let order = self.get(order_id).await?;
        notify_best_effort(
            &self.notifier,
            NotifyTarget::Account(order.requester_id.clone()),
            &format!("Your order {} has been finalized and dispatched.", order_id),
        )
        .await;
        self.sync_archive(order_id).await;

        Ok(true)
    }

    /// Fire due scheduled prep transitions. Rows are marked applied with a
    /// conditional update first so a crash between marking and firing
    /// leaves at worst an unfired row for the next poll, never a double
    /// settlement.
    pub async fn run_due_transitions(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        let rows = sqlx::query(
            "SELECT id, order_id FROM scheduled_transition \
             WHERE applied = 0 AND fire_at <= ? ORDER BY fire_at",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.db)
        .await?;

        let mut fired = 0;
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let order_id: String = row.try_get("order_id")?;

            let claimed =
                sqlx::query("UPDATE scheduled_transition SET applied = 1 WHERE id = ? AND applied = 0")
                    .bind(id)
                    .execute(&self.db)
                    .await?;
            if claimed.rows_affected() == 0 {
                continue;
            }

            match self.finish_prep(&order_id, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {
                    tracing::debug!("Prep transition for {} was superseded", order_id);
                }
                Err(e) => tracing::error!("Prep transition failed for {}: {}", order_id, e),
            }
        }

        Ok(fired)
    }

    /// Search retained orders by id prefix or requester, newest first
    pub async fn search(&self, query: &str, limit: i64) -> CoreResult<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE order_id LIKE ? OR requester_id = ? \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(format!("{}%", query))
        .bind(query)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    /// Count orders created within the trailing window
    pub async fn volume_since(&self, since: DateTime<Utc>) -> CoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM orders WHERE created_at >= ?")
            .bind(since.to_rfc3339())
            .fetch_one(&self.db)
            .await?;

        Ok(row.try_get("n")?)
    }

    /// Re-sync the external archive record for an order. Failures are
    /// logged and swallowed; the transition that triggered the sync has
    /// already committed.
    async fn sync_archive(&self, order_id: &str) {
        let order = match self.get(order_id).await {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!("Archive sync skipped for {}: {}", order_id, e);
                return;
            }
        };

        match self.archive.sync(&order).await {
            Ok(archive_ref) => {
                if order.archive_ref.is_none() {
                    let stored = sqlx::query(
                        "UPDATE orders SET archive_ref = ? \
                         WHERE order_id = ? AND archive_ref IS NULL",
                    )
                    .bind(&archive_ref)
                    .bind(order_id)
                    .execute(&self.db)
                    .await;
                    if let Err(e) = stored {
                        tracing::warn!("Archive ref store failed for {}: {}", order_id, e);
                    }
                }
            }
            Err(e) => tracing::warn!("Archive sync failed for {}: {}", order_id, e),
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_transitions(&self) -> CoreResult<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM scheduled_transition WHERE applied = 0")
                .fetch_one(&self.db)
                .await?;
        Ok(row.try_get("n")?)
    }
}
