use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info};

pub mod tasks;

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        // Spawn fulfillment tasks
        tokio::spawn(Self::preparation_timer_job(Arc::clone(&self)));
        tokio::spawn(Self::stale_order_sweep_job(Arc::clone(&self)));
        tokio::spawn(Self::weekly_quota_job(Arc::clone(&self)));

        // Spawn maintenance tasks
        tokio::spawn(Self::expired_block_cleanup_job(Arc::clone(&self)));
        tokio::spawn(Self::capability_cache_job(Arc::clone(&self)));
        tokio::spawn(Self::health_check_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Fire due preparation timers (runs every 10 seconds)
    ///
    /// Timers are stored as durable rows, so any that came due while the
    /// process was down fire on the first tick after restart.
    async fn preparation_timer_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(10));

        loop {
            interval.tick().await;

            match tasks::fire_due_preparation_timers(&scheduler.context).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Marked {} orders ready", count);
                    }
                }
                Err(e) => error!("Failed to fire preparation timers: {}", e),
            }
        }
    }

    /// Force-deliver stale ready orders (runs every minute)
    async fn stale_order_sweep_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(60));

        loop {
            interval.tick().await;

            match tasks::sweep_stale_orders(&scheduler.context).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Failsafe-delivered {} stale orders", count);
                    }
                }
                Err(e) => error!("Failed to sweep stale orders: {}", e),
            }
        }
    }

    /// Weekly quota audit (checked hourly, runs in its Sunday window)
    async fn weekly_quota_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(3600));

        loop {
            interval.tick().await;

            match tasks::run_weekly_quota(&scheduler.context).await {
                Ok(Some(report)) => {
                    info!(
                        "Weekly quota audit complete: target {}, {} evaluated, {} failed",
                        report.target, report.evaluated, report.failed
                    );
                }
                Ok(None) => {
                    // Outside the audit window or already ran
                }
                Err(e) => error!("Weekly quota audit failed: {}", e),
            }
        }
    }

    /// Cleanup expired context blocks (runs every 15 minutes)
    async fn expired_block_cleanup_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(900));

        loop {
            interval.tick().await;
            info!("Running expired block cleanup");

            match tasks::cleanup_expired_blocks(&scheduler.context).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Cleaned up {} expired context blocks", count);
                    }
                }
                Err(e) => error!("Failed to cleanup expired blocks: {}", e),
            }
        }
    }

    /// Evict stale capability cache entries (runs every 5 minutes)
    async fn capability_cache_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300));

        loop {
            interval.tick().await;
            scheduler.context.resolver.evict_stale().await;
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300));

        loop {
            interval.tick().await;

            match tasks::health_check(&scheduler.context).await {
                Ok(_) => {
                    // Silent success
                }
                Err(e) => error!("Health check failed: {}", e),
            }
        }
    }
}
