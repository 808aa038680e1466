/// Weekly quota and leaderboard engine
///
/// The audit runs at most once per weekly window, guarded by a job
/// marker that is written last so a crash mid-run is retried on the next
/// tick. Per-account failures are isolated; one bad row never aborts the
/// batch.
use crate::error::{CoreError, CoreResult};
use crate::ledger::account_from_row;
use crate::notify::{notify_best_effort, NotificationSink, NotifyTarget};
use crate::perms::{RoleDirectory, StaffDimension};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

const QUOTA_JOB_KEY: &str = "weekly_quota";
const TARGET_CAP: i64 = 30;
const QUOTA_STRIKE_LIMIT: i64 = 2;
/// Re-run guard inside one eligible window
const RERUN_GUARD_HOURS: i64 = 12;

/// Compute the weekly per-staff target.
///
/// Nobody is expected to have processed more than one order's worth each
/// when volume is below head count, so the target collapses to zero.
pub fn quota_target(volume: i64, total_staff: i64) -> i64 {
    if volume < total_staff {
        return 0;
    }
    (volume / total_staff.max(1)).min(TARGET_CAP)
}

/// Whether `now` falls in the weekly audit window (Sunday 23:00 UTC)
pub fn is_audit_window(now: DateTime<Utc>) -> bool {
    now.weekday() == chrono::Weekday::Sun && now.hour() == 23
}

/// One leaderboard row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub account_id: String,
    pub count: i64,
}

/// Summary of one audit run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaReport {
    pub target: i64,
    pub volume: i64,
    pub total_staff: i64,
    pub evaluated: u64,
    pub failed: u64,
    pub top_cooks: Vec<LeaderboardEntry>,
    pub top_couriers: Vec<LeaderboardEntry>,
}

/// Quota engine
pub struct QuotaEngine {
    db: SqlitePool,
    directory: Arc<dyn RoleDirectory>,
    notifier: Arc<dyn NotificationSink>,
}

impl QuotaEngine {
    pub fn new(
        db: SqlitePool,
        directory: Arc<dyn RoleDirectory>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            db,
            directory,
            notifier,
        }
    }

    /// Run the audit if the window is open and it has not already run in
    /// this window. Returns the report when it actually ran.
    pub async fn run_if_due(&self, now: DateTime<Utc>) -> CoreResult<Option<QuotaReport>> {
        if !is_audit_window(now) {
            return Ok(None);
        }
        if self.ran_recently(now).await? {
            return Ok(None);
        }

        let report = self.run_audit(now).await?;
        Ok(Some(report))
    }

    async fn ran_recently(&self, now: DateTime<Utc>) -> CoreResult<bool> {
        let row = sqlx::query("SELECT last_run_at FROM job_marker WHERE job_key = ?")
            .bind(QUOTA_JOB_KEY)
            .fetch_optional(&self.db)
            .await?;

        match row {
            None => Ok(false),
            Some(row) => {
                let last_run =
                    crate::ledger::parse_timestamp(&row.try_get::<String, _>("last_run_at")?)?;
                Ok(now - last_run <= Duration::hours(RERUN_GUARD_HOURS))
            }
        }
    }

    /// Execute the full weekly audit unconditionally
    pub async fn run_audit(&self, now: DateTime<Utc>) -> CoreResult<QuotaReport> {
        let since = now - Duration::days(7);
        let volume: i64 = sqlx::query("SELECT COUNT(*) AS n FROM orders WHERE created_at >= ?")
            .bind(since.to_rfc3339())
            .fetch_one(&self.db)
            .await?
            .try_get("n")?;

        let (cooks, couriers) = self
            .directory
            .role_counts()
            .await
            .map_err(|e| CoreError::Internal(format!("Role counts unavailable: {}", e)))?;
        let total_staff = (cooks + couriers) as i64;
        let target = quota_target(volume, total_staff);

        let top_cooks = self.leaderboard("weekly_cook_count").await?;
        let top_couriers = self.leaderboard("weekly_courier_count").await?;

        let rows = sqlx::query(
            "SELECT * FROM account WHERE weekly_cook_count > 0 OR weekly_courier_count > 0",
        )
        .fetch_all(&self.db)
        .await?;

        let mut evaluated = 0;
        let mut failed = 0;
        for row in rows {
            let account = account_from_row(&row)?;
            match self.evaluate_account(&account.id, target).await {
                Ok(Some(passed)) => {
                    evaluated += 1;
                    if !passed {
                        failed += 1;
                    }
                }
                Ok(None) => {} // exempt
                Err(e) => {
                    tracing::error!("Quota evaluation failed for {}: {}", account.id, e);
                }
            }
        }

        let board = format!(
            "Weekly results: target {} on volume {}. Top cooks: {}. Top couriers: {}.",
            target,
            volume,
            format_board(&top_cooks),
            format_board(&top_couriers)
        );
        notify_best_effort(&self.notifier, NotifyTarget::Staff, &board).await;

        sqlx::query("UPDATE account SET weekly_cook_count = 0, weekly_courier_count = 0")
            .execute(&self.db)
            .await?;

        // Marker last, so a failure above retries on the next tick
        sqlx::query(
            "INSERT INTO job_marker (job_key, last_run_at) VALUES (?, ?) \
             ON CONFLICT (job_key) DO UPDATE SET last_run_at = excluded.last_run_at",
        )
        .bind(QUOTA_JOB_KEY)
        .bind(now.to_rfc3339())
        .execute(&self.db)
        .await?;

        Ok(QuotaReport {
            target,
            volume,
            total_staff,
            evaluated,
            failed,
            top_cooks,
            top_couriers,
        })
    }

    /// Evaluate one staff account. Returns None for quota-exempt
    /// accounts, otherwise whether they passed.
    async fn evaluate_account(&self, account_id: &str, target: i64) -> CoreResult<Option<bool>> {
        let roles = self
            .directory
            .lookup_roles(account_id)
            .await
            .map_err(|e| CoreError::Internal(format!("Directory lookup failed: {}", e)))?;
        if roles.quota_exempt {
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM account WHERE id = ?")
            .bind(account_id)
            .fetch_one(&self.db)
            .await?;
        let account = account_from_row(&row)?;

        let passed = target == 0
            || (account.weekly_cook_count >= target && account.weekly_courier_count >= target);

        if passed {
            sqlx::query(
                "UPDATE account SET cook_quota_strikes = 0, courier_quota_strikes = 0 \
                 WHERE id = ?",
            )
            .bind(account_id)
            .execute(&self.db)
            .await?;
        } else {
            if account.weekly_cook_count > 0 && account.weekly_cook_count < target {
                self.strike_dimension(&account.id, StaffDimension::Cook, account.cook_quota_strikes)
                    .await?;
            }
            if account.weekly_courier_count > 0 && account.weekly_courier_count < target {
                self.strike_dimension(
                    &account.id,
                    StaffDimension::Courier,
                    account.courier_quota_strikes,
                )
                .await?;
            }
        }

        let verdict = if passed { "passed" } else { "missed" };
        notify_best_effort(
            &self.notifier,
            NotifyTarget::Account(account_id.to_string()),
            &format!("Weekly quota {}: the target was {} tasks.", verdict, target),
        )
        .await;

        Ok(Some(passed))
    }

    async fn strike_dimension(
        &self,
        account_id: &str,
        dimension: StaffDimension,
        current_strikes: i64,
    ) -> CoreResult<()> {
        let column = match dimension {
            StaffDimension::Cook => "cook_quota_strikes",
            StaffDimension::Courier => "courier_quota_strikes",
        };

        let new_strikes = current_strikes + 1;
        if new_strikes >= QUOTA_STRIKE_LIMIT {
            // Two consecutive misses: the role goes, the counter resets
            if let Err(e) = self.directory.remove_role(account_id, dimension).await {
                tracing::warn!("Role removal failed for {}: {}", account_id, e);
            }
            sqlx::query(&format!("UPDATE account SET {} = 0 WHERE id = ?", column))
                .bind(account_id)
                .execute(&self.db)
                .await?;
            tracing::info!(
                "Removed {:?} role from {} after repeated quota misses",
                dimension,
                account_id
            );
        } else {
            sqlx::query(&format!("UPDATE account SET {} = ? WHERE id = ?", column))
                .bind(new_strikes)
                .bind(account_id)
                .execute(&self.db)
                .await?;
        }

        Ok(())
    }

    async fn leaderboard(&self, column: &str) -> CoreResult<Vec<LeaderboardEntry>> {
        // Ties resolve by account creation order, keeping the sort stable
        let rows = sqlx::query(&format!(
            "SELECT id, {col} AS count FROM account WHERE {col} > 0 \
             ORDER BY {col} DESC, created_at ASC, id ASC LIMIT 10",
            col = column
        ))
        .fetch_all(&self.db)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(LeaderboardEntry {
                account_id: row.try_get("id")?,
                count: row.try_get("count")?,
            });
        }

        Ok(entries)
    }
}

fn format_board(entries: &[LeaderboardEntry]) -> String {
    if entries.is_empty() {
        return "none".to_string();
    }
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. {} ({})", i + 1, e.account_id, e.count))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;
    use crate::db::test_pool;
    use crate::ledger::Ledger;
    use crate::notify::LogSink;
    use crate::perms::StaticDirectory;
    use chrono::TimeZone;

    #[test]
    fn test_target_formula() {
        assert_eq!(quota_target(45, 10), 4);
        assert_eq!(quota_target(3, 10), 0);
        assert_eq!(quota_target(1000, 10), 30);
        assert_eq!(quota_target(0, 0), 0);
        assert_eq!(quota_target(5, 0), 5);
        assert_eq!(quota_target(10, 10), 1);
    }

    #[test]
    fn test_audit_window() {
        // Sunday 2025-01-05 23:30 UTC
        let open = Utc.with_ymd_and_hms(2025, 1, 5, 23, 30, 0).unwrap();
        assert!(is_audit_window(open));
        // Sunday but wrong hour
        let closed = Utc.with_ymd_and_hms(2025, 1, 5, 22, 30, 0).unwrap();
        assert!(!is_audit_window(closed));
        // Monday 23:00
        let monday = Utc.with_ymd_and_hms(2025, 1, 6, 23, 0, 0).unwrap();
        assert!(!is_audit_window(monday));
    }

    fn staff_directory() -> Arc<StaticDirectory> {
        Arc::new(StaticDirectory::new(&DirectoryConfig {
            cooks: vec!["cook-1".into(), "cook-2".into()],
            couriers: vec!["courier-1".into(), "courier-2".into()],
            managers: vec![],
            quota_exempt: vec!["cook-2".into()],
        }))
    }

    async fn seed(pool: &SqlitePool, id: &str, cook: i64, courier: i64) {
        Ledger::new(pool.clone()).get_or_create(id).await.unwrap();
        sqlx::query(
            "UPDATE account SET weekly_cook_count = ?, weekly_courier_count = ? WHERE id = ?",
        )
        .bind(cook)
        .bind(courier)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn seed_orders(pool: &SqlitePool, n: usize, now: DateTime<Utc>) {
        for i in 0..n {
            sqlx::query(
                "INSERT INTO orders (order_id, requester_id, origin_context, origin_channel, \
                 status, item, price_tier, price_paid, created_at) \
                 VALUES (?, ?, 'ctx', 'chan', 'delivered', 'donut', 'standard', 100, ?)",
            )
            .bind(format!("VOL{:03}", i))
            .bind(format!("user-{}", i))
            .bind(now.to_rfc3339())
            .execute(pool)
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_audit_passes_and_resets_counters() {
        let pool = test_pool().await;
        let directory = staff_directory();
        let engine = QuotaEngine::new(pool.clone(), directory, Arc::new(LogSink));
        let now = Utc::now();

        // 8 orders across 4 staff: target = min(30, 8/4) = 2
        seed_orders(&pool, 8, now - Duration::days(1)).await;
        seed(&pool, "cook-1", 3, 2).await;

        let report = engine.run_audit(now).await.unwrap();
        assert_eq!(report.target, 2);
        assert_eq!(report.volume, 8);
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.failed, 0);

        let ledger = Ledger::new(pool);
        let account = ledger.get("cook-1").await.unwrap();
        assert_eq!(account.weekly_cook_count, 0);
        assert_eq!(account.weekly_courier_count, 0);
        assert_eq!(account.cook_quota_strikes, 0);
    }

    #[tokio::test]
    async fn test_audit_strikes_only_failing_nonzero_dimension() {
        let pool = test_pool().await;
        let directory = staff_directory();
        let engine = QuotaEngine::new(pool.clone(), directory, Arc::new(LogSink));
        let now = Utc::now();

        seed_orders(&pool, 8, now - Duration::days(1)).await;
        // Below target in cooking, zero in couriering: only the cook
        // dimension draws a strike
        seed(&pool, "cook-1", 1, 0).await;

        let report = engine.run_audit(now).await.unwrap();
        assert_eq!(report.failed, 1);

        let ledger = Ledger::new(pool);
        let account = ledger.get("cook-1").await.unwrap();
        assert_eq!(account.cook_quota_strikes, 1);
        assert_eq!(account.courier_quota_strikes, 0);
    }

    #[tokio::test]
    async fn test_second_consecutive_miss_removes_role() {
        let pool = test_pool().await;
        let directory = staff_directory();
        let engine = QuotaEngine::new(pool.clone(), directory.clone(), Arc::new(LogSink));
        let now = Utc::now();

        seed_orders(&pool, 8, now - Duration::days(1)).await;
        seed(&pool, "cook-1", 1, 0).await;
        engine.run_audit(now).await.unwrap();

        seed(&pool, "cook-1", 1, 0).await;
        engine.run_audit(now).await.unwrap();

        let ledger = Ledger::new(pool);
        let account = ledger.get("cook-1").await.unwrap();
        assert_eq!(account.cook_quota_strikes, 0);
        assert!(!directory.lookup_roles("cook-1").await.unwrap().cook);
    }

    #[tokio::test]
    async fn test_exempt_accounts_are_skipped() {
        let pool = test_pool().await;
        let directory = staff_directory();
        let engine = QuotaEngine::new(pool.clone(), directory, Arc::new(LogSink));
        let now = Utc::now();

        seed_orders(&pool, 8, now - Duration::days(1)).await;
        seed(&pool, "cook-2", 1, 0).await;

        let report = engine.run_audit(now).await.unwrap();
        assert_eq!(report.evaluated, 0);

        let ledger = Ledger::new(pool);
        assert_eq!(ledger.get("cook-2").await.unwrap().cook_quota_strikes, 0);
    }

    #[tokio::test]
    async fn test_zero_target_auto_passes() {
        let pool = test_pool().await;
        let directory = staff_directory();
        let engine = QuotaEngine::new(pool.clone(), directory, Arc::new(LogSink));
        let now = Utc::now();

        // 3 orders, 4 staff: target 0
        seed_orders(&pool, 3, now - Duration::days(1)).await;
        seed(&pool, "cook-1", 1, 0).await;

        let report = engine.run_audit(now).await.unwrap();
        assert_eq!(report.target, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_leaderboard_orders_and_caps() {
        let pool = test_pool().await;
        let directory = staff_directory();
        let engine = QuotaEngine::new(pool.clone(), directory, Arc::new(LogSink));
        let now = Utc::now();

        for i in 0..12 {
            seed(&pool, &format!("staff-{:02}", i), (i + 1) as i64, 0).await;
        }

        let report = engine.run_audit(now).await.unwrap();
        assert_eq!(report.top_cooks.len(), 10);
        assert_eq!(report.top_cooks[0].account_id, "staff-11");
        assert_eq!(report.top_cooks[0].count, 12);
        assert!(report.top_couriers.is_empty());
    }

    #[tokio::test]
    async fn test_window_marker_prevents_double_run() {
        let pool = test_pool().await;
        let directory = staff_directory();
        let engine = QuotaEngine::new(pool.clone(), directory, Arc::new(LogSink));
        let window = Utc.with_ymd_and_hms(2025, 1, 5, 23, 10, 0).unwrap();

        seed(&pool, "cook-1", 5, 5).await;

        assert!(engine.run_if_due(window).await.unwrap().is_some());
        // Same window, a later tick: marker blocks the re-run
        let later = window + Duration::minutes(30);
        assert!(engine.run_if_due(later).await.unwrap().is_none());
        // Next week runs again
        let next_week = window + Duration::days(7);
        assert!(engine.run_if_due(next_week).await.unwrap().is_some());
        // Outside the window nothing happens
        assert!(engine
            .run_if_due(window + Duration::days(1))
            .await
            .unwrap()
            .is_none());
    }
}
