/// Background task implementations
use crate::{context::AppContext, error::CoreResult, quota::QuotaReport};
use chrono::Utc;

/// Promote preparing orders whose timer has elapsed
pub async fn fire_due_preparation_timers(ctx: &AppContext) -> CoreResult<u64> {
    ctx.orders.run_due_transitions(Utc::now()).await
}

/// Force-deliver orders that sat ready past the staleness limit
pub async fn sweep_stale_orders(ctx: &AppContext) -> CoreResult<u64> {
    ctx.orders.failsafe_sweep(Utc::now()).await
}

/// Run the weekly quota audit if its window is open
pub async fn run_weekly_quota(ctx: &AppContext) -> CoreResult<Option<QuotaReport>> {
    ctx.quota.run_if_due(Utc::now()).await
}

/// Drop context blocks whose expiry has passed
pub async fn cleanup_expired_blocks(ctx: &AppContext) -> CoreResult<u64> {
    ctx.blocks.cleanup_expired(Utc::now()).await
}

/// Health check, verifies database connectivity
pub async fn health_check(ctx: &AppContext) -> CoreResult<()> {
    sqlx::query("SELECT 1").fetch_one(&ctx.db).await?;

    Ok(())
}
