/// Command surface and dispatch pipeline
///
/// Every inbound command runs the same gauntlet: upsert the actor's
/// account, reject restricted accounts, resolve capabilities, check the
/// command's declared requirement, then execute. Guard failures surface
/// as typed errors and leave all state untouched.
use crate::context::AppContext;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{Account, OrderKind};
use crate::notify::{notify_best_effort, NotifyTarget};
use crate::orders::{machine::PREP_DURATION_SECS, Order, OrderStatus, OriginContext};
use crate::perms::Capability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One inbound command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Order { item: String },
    SuperOrder { item: String },
    OrderStatus,
    Daily,
    Balance,
    Redeem { code: String },
    Tip { order_id: String, amount: i64 },
    Stats { target: Option<String> },
    StaffBuy,
    Claim { order_id: String },
    Cook { order_id: String, evidence: Vec<String> },
    Deliver { order_id: String },
    SetScript { text: String },
    Warn { order_id: String, reason: String },
    ForceCancel { order_id: String, reason: String },
    ForceWarn { order_id: String, reason: String },
    Refund { order_id: String },
    Search { query: String },
    Ban { account_id: String, days: i64 },
    Unban { account_id: String },
    GenerateCodes { amount: u32 },
    BlockContext { context_id: String, reason: String, days: Option<i64> },
    UnblockContext { context_id: String },
}

impl Command {
    /// Capability this command requires, checked before any business logic
    pub fn required_capability(&self) -> Capability {
        match self {
            Command::Order { .. }
            | Command::SuperOrder { .. }
            | Command::OrderStatus
            | Command::Daily
            | Command::Balance
            | Command::Redeem { .. }
            | Command::Tip { .. }
            | Command::Stats { .. } => Capability::None,
            Command::StaffBuy => Capability::Staff,
            Command::Claim { .. } | Command::Cook { .. } | Command::Warn { .. } => Capability::Cook,
            Command::Deliver { .. } | Command::SetScript { .. } => Capability::Courier,
            Command::ForceCancel { .. }
            | Command::ForceWarn { .. }
            | Command::Refund { .. }
            | Command::Search { .. }
            | Command::Ban { .. }
            | Command::Unban { .. } => Capability::Manager,
            Command::GenerateCodes { .. }
            | Command::BlockContext { .. }
            | Command::UnblockContext { .. } => Capability::Owner,
        }
    }
}

/// Structured result of a successful command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    OrderPlaced { order_id: String, price: i64 },
    OrderStatusReport { order: Option<Order> },
    AllowanceGranted { amount: i64 },
    BalanceReport { balance: i64 },
    VipExtended { until: DateTime<Utc> },
    TipSplit { cook_share: i64, courier_share: i64 },
    StatsReport { account: Account },
    StatBoostPurchased { until: DateTime<Utc> },
    OrderClaimed { order_id: String },
    PreparationStarted { order_id: String, ready_in_secs: i64 },
    OrderDelivered { order_id: String },
    ScriptSaved,
    StrikeIssued { account_id: String, strike_count: i64 },
    Refunded { order_id: String, amount: i64 },
    SearchResults { orders: Vec<Order> },
    Banned { account_id: String, until: DateTime<Utc> },
    Unbanned { account_id: String },
    CodesGenerated { codes: Vec<String> },
    ContextBlocked { context_id: String },
    ContextUnblocked { context_id: String, removed: bool },
}

/// Inbound request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub actor_id: String,
    #[serde(default)]
    pub actor_label: Option<String>,
    #[serde(default)]
    pub origin: Option<OriginContext>,
    #[serde(flatten)]
    pub command: Command,
}

/// Dispatch a command through the full gate pipeline
pub async fn dispatch(ctx: &AppContext, request: CommandRequest) -> CoreResult<CommandOutcome> {
    let now = Utc::now();
    let account = ctx.ledger.get_or_create(&request.actor_id).await?;

    // Restriction precedes every capability gate
    if account.perm_banned {
        return Err(CoreError::ServiceRestricted("Account terminated".to_string()));
    }
    if account.is_blocked(now) {
        return Err(CoreError::ServiceRestricted("Account suspended".to_string()));
    }

    let caps = ctx.resolver.resolve(&request.actor_id).await;
    let required = request.command.required_capability();
    if !caps.satisfies(required) {
        return Err(CoreError::Unauthorized(format!(
            "Command requires {:?} capability",
            required
        )));
    }

    execute(ctx, &account, request, now).await
}

async fn execute(
    ctx: &AppContext,
    account: &Account,
    request: CommandRequest,
    now: DateTime<Utc>,
) -> CoreResult<CommandOutcome> {
    let actor_id = request.actor_id.clone();
    let actor_label = request
        .actor_label
        .clone()
        .unwrap_or_else(|| actor_id.clone());

    match request.command {
        Command::Order { item } => {
            let origin = require_origin(request.origin)?;
            place_order(ctx, account, origin, &item, OrderKind::Standard, now).await
        }
        Command::SuperOrder { item } => {
            let origin = require_origin(request.origin)?;
            place_order(ctx, account, origin, &item, OrderKind::Super, now).await
        }
        Command::OrderStatus => {
            let order = ctx.orders.active_for(&actor_id).await?;
            Ok(CommandOutcome::OrderStatusReport { order })
        }
        Command::Daily => {
            let amount = ctx.ledger.claim_allowance(&actor_id, now).await?;
            Ok(CommandOutcome::AllowanceGranted { amount })
        }
        Command::Balance => Ok(CommandOutcome::BalanceReport {
            balance: account.balance,
        }),
        Command::Redeem { code } => {
            let until = ctx
                .vip_codes
                .redeem(&code, &actor_id, &ctx.ledger, now)
                .await?;
            Ok(CommandOutcome::VipExtended { until })
        }
        Command::Tip { order_id, amount } => tip_order(ctx, &actor_id, &order_id, amount).await,
        Command::Stats { target } => {
            let subject = target.as_deref().unwrap_or(&actor_id);
            let account = ctx.ledger.get(subject).await?;
            Ok(CommandOutcome::StatsReport { account })
        }
        Command::StaffBuy => {
            let until = ctx.ledger.purchase_stat_boost(&actor_id, now).await?;
            Ok(CommandOutcome::StatBoostPurchased { until })
        }
        Command::Claim { order_id } => {
            ctx.orders.claim(&order_id, &actor_id, &actor_label).await?;
            Ok(CommandOutcome::OrderClaimed { order_id })
        }
        Command::Cook { order_id, evidence } => {
            ctx.orders.prepare(&order_id, &actor_id, evidence, now).await?;
            Ok(CommandOutcome::PreparationStarted {
                order_id,
                ready_in_secs: PREP_DURATION_SECS,
            })
        }
        Command::Deliver { order_id } => {
            let script = ctx.scripts.get(&actor_id).await?;
            ctx.orders.deliver(&order_id, &actor_id, script, now).await?;
            Ok(CommandOutcome::OrderDelivered { order_id })
        }
        Command::SetScript { text } => {
            if text.trim().is_empty() {
                return Err(CoreError::Validation("Script text cannot be empty".to_string()));
            }
            ctx.scripts.set(&actor_id, &text).await?;
            Ok(CommandOutcome::ScriptSaved)
        }
        Command::Warn { order_id, reason } => {
            let order = ctx.orders.cancel_unprepped(&order_id).await?;
            strike_requester(ctx, &order, &actor_id, &reason, now).await
        }
        Command::ForceCancel { order_id, reason } => {
            let order = ctx.orders.cancel_predelivery(&order_id).await?;
            strike_requester(ctx, &order, &actor_id, &reason, now).await
        }
        Command::ForceWarn { order_id, reason } => {
            let order = ctx.orders.get(&order_id).await?;
            if order.status != OrderStatus::Delivered {
                return Err(CoreError::InvalidState(format!(
                    "Order {order_id} has not been delivered"
                )));
            }
            strike_requester(ctx, &order, &actor_id, &reason, now).await
        }
        Command::Refund { order_id } => {
            let order = ctx.orders.refund(&order_id).await?;
            Ok(CommandOutcome::Refunded {
                order_id,
                amount: order.price_paid,
            })
        }
        Command::Search { query } => {
            let orders = ctx.orders.search(&query, 25).await?;
            Ok(CommandOutcome::SearchResults { orders })
        }
        Command::Ban { account_id, days } => {
            if days <= 0 {
                return Err(CoreError::Validation("Ban length must be positive".to_string()));
            }
            let until = ctx.discipline.ban(&account_id, days, now).await?;
            Ok(CommandOutcome::Banned { account_id, until })
        }
        Command::Unban { account_id } => {
            ctx.discipline.unban(&account_id).await?;
            Ok(CommandOutcome::Unbanned { account_id })
        }
        Command::GenerateCodes { amount } => {
            let codes = ctx.vip_codes.generate_batch(amount).await?;
            Ok(CommandOutcome::CodesGenerated { codes })
        }
        Command::BlockContext {
            context_id,
            reason,
            days,
        } => {
            ctx.blocks.block(&context_id, &reason, days, &actor_id).await?;
            Ok(CommandOutcome::ContextBlocked { context_id })
        }
        Command::UnblockContext { context_id } => {
            let removed = ctx.blocks.unblock(&context_id).await?;
            Ok(CommandOutcome::ContextUnblocked {
                context_id,
                removed,
            })
        }
    }
}

fn require_origin(origin: Option<OriginContext>) -> CoreResult<OriginContext> {
    origin.ok_or_else(|| CoreError::Validation("Orders require an origin context".to_string()))
}

async fn place_order(
    ctx: &AppContext,
    account: &Account,
    origin: OriginContext,
    item: &str,
    kind: OrderKind,
    now: DateTime<Utc>,
) -> CoreResult<CommandOutcome> {
    let order = ctx.orders.create(account, origin, item, kind, now).await?;
    Ok(CommandOutcome::OrderPlaced {
        price: order.price_paid,
        order_id: order.order_id,
    })
}

async fn tip_order(
    ctx: &AppContext,
    actor_id: &str,
    order_id: &str,
    amount: i64,
) -> CoreResult<CommandOutcome> {
    if amount <= 0 {
        return Err(CoreError::Validation("Tip must be positive".to_string()));
    }
    let order = ctx.orders.get(order_id).await?;
    if order.status != OrderStatus::Delivered {
        return Err(CoreError::InvalidState(format!(
            "Order {order_id} has not been delivered"
        )));
    }
    if order.requester_id != actor_id {
        return Err(CoreError::Unauthorized(
            "Only the requester can tip their order".to_string(),
        ));
    }
    let cook = order
        .cook_id
        .clone()
        .ok_or_else(|| CoreError::InvalidState("Order has no cook on record".to_string()))?;
    let courier = if order.auto_delivered() {
        None
    } else {
        order.courier_id.as_deref()
    };
    let (cook_share, courier_share) = ctx
        .ledger
        .split_tip(actor_id, &cook, courier, amount)
        .await?;
    Ok(CommandOutcome::TipSplit {
        cook_share,
        courier_share,
    })
}

async fn strike_requester(
    ctx: &AppContext,
    order: &Order,
    issuer_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> CoreResult<CommandOutcome> {
    let outcome = ctx
        .discipline
        .strike(&order.requester_id, reason, issuer_id, now)
        .await?;
    notify_best_effort(
        &ctx.notifier,
        NotifyTarget::Account(order.requester_id.clone()),
        &format!(
            "Your order {} was flagged by staff: {reason}",
            order.order_id
        ),
    )
    .await;
    Ok(CommandOutcome::StrikeIssued {
        account_id: order.requester_id.clone(),
        strike_count: outcome.strike_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;
    use crate::context::test_support::test_context;
    use crate::context::AppContext;

    fn staffed_directory() -> DirectoryConfig {
        DirectoryConfig {
            cooks: vec!["cook-1".to_string()],
            couriers: vec!["courier-1".to_string()],
            managers: vec!["manager-1".to_string()],
            quota_exempt: vec![],
        }
    }

    fn origin() -> OriginContext {
        OriginContext {
            context: "ctx-1".to_string(),
            channel: "chan-1".to_string(),
        }
    }

    async fn run(ctx: &AppContext, actor: &str, command: Command) -> CoreResult<CommandOutcome> {
        dispatch(
            ctx,
            CommandRequest {
                actor_id: actor.to_string(),
                actor_label: None,
                origin: Some(origin()),
                command,
            },
        )
        .await
    }

    async fn fund(ctx: &AppContext, account_id: &str, amount: i64) {
        ctx.ledger.get_or_create(account_id).await.unwrap();
        ctx.ledger.credit(account_id, amount).await.unwrap();
    }

    #[tokio::test]
    async fn stranger_cannot_claim() {
        let ctx = test_context(staffed_directory()).await;
        fund(&ctx, "user-1", 500).await;
        let placed = run(&ctx, "user-1", Command::Order { item: "cupcake".to_string() })
            .await
            .unwrap();
        let order_id = match placed {
            CommandOutcome::OrderPlaced { order_id, .. } => order_id,
            other => panic!("unexpected outcome {:?}", other),
        };

        let denied = run(&ctx, "stranger", Command::Claim { order_id }).await;
        assert!(matches!(denied, Err(CoreError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn restriction_precedes_capability_gate() {
        let ctx = test_context(staffed_directory()).await;
        ctx.ledger.get_or_create("cook-1").await.unwrap();
        ctx.discipline
            .ban("cook-1", 7, Utc::now())
            .await
            .unwrap();

        let denied = run(
            &ctx,
            "cook-1",
            Command::Claim { order_id: "ZZZZZZ".to_string() },
        )
        .await;
        assert!(matches!(denied, Err(CoreError::ServiceRestricted(_))));
    }

    #[tokio::test]
    async fn owner_passes_every_gate() {
        let ctx = test_context(staffed_directory()).await;
        let outcome = run(&ctx, "owner-1", Command::GenerateCodes { amount: 3 })
            .await
            .unwrap();
        match outcome {
            CommandOutcome::CodesGenerated { codes } => assert_eq!(codes.len(), 3),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_lifecycle_through_dispatch() {
        let ctx = test_context(staffed_directory()).await;
        fund(&ctx, "user-1", 500).await;

        let placed = run(&ctx, "user-1", Command::Order { item: "cupcake".to_string() })
            .await
            .unwrap();
        let order_id = match placed {
            CommandOutcome::OrderPlaced { order_id, price } => {
                assert_eq!(price, crate::ledger::STANDARD_PRICE);
                order_id
            }
            other => panic!("unexpected outcome {:?}", other),
        };

        run(&ctx, "cook-1", Command::Claim { order_id: order_id.clone() })
            .await
            .unwrap();
        run(
            &ctx,
            "cook-1",
            Command::Cook {
                order_id: order_id.clone(),
                evidence: vec!["proof".to_string()],
            },
        )
        .await
        .unwrap();

        // Completes the timed preparation before delivery
        ctx.orders
            .finish_prep(&order_id, Utc::now())
            .await
            .unwrap();

        run(&ctx, "courier-1", Command::Deliver { order_id: order_id.clone() })
            .await
            .unwrap();

        let order = ctx.orders.get(&order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);
        assert_eq!(order.courier_id.as_deref(), Some("courier-1"));

        let tipped = run(
            &ctx,
            "user-1",
            Command::Tip { order_id: order_id.clone(), amount: 101 },
        )
        .await
        .unwrap();
        match tipped {
            CommandOutcome::TipSplit { cook_share, courier_share } => {
                assert_eq!(cook_share, 51);
                assert_eq!(courier_share, 50);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn warn_cancels_and_strikes_requester() {
        let ctx = test_context(staffed_directory()).await;
        fund(&ctx, "user-1", 500).await;
        let placed = run(&ctx, "user-1", Command::Order { item: "cupcake".to_string() })
            .await
            .unwrap();
        let order_id = match placed {
            CommandOutcome::OrderPlaced { order_id, .. } => order_id,
            other => panic!("unexpected outcome {:?}", other),
        };

        let outcome = run(
            &ctx,
            "cook-1",
            Command::Warn { order_id: order_id.clone(), reason: "abusive request".to_string() },
        )
        .await
        .unwrap();
        match outcome {
            CommandOutcome::StrikeIssued { account_id, strike_count } => {
                assert_eq!(account_id, "user-1");
                assert_eq!(strike_count, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let order = ctx.orders.get(&order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::CancelledUnprepped);
    }

    #[tokio::test]
    async fn force_warn_requires_delivered_order() {
        let ctx = test_context(staffed_directory()).await;
        fund(&ctx, "user-1", 500).await;
        let placed = run(&ctx, "user-1", Command::Order { item: "cupcake".to_string() })
            .await
            .unwrap();
        let order_id = match placed {
            CommandOutcome::OrderPlaced { order_id, .. } => order_id,
            other => panic!("unexpected outcome {:?}", other),
        };

        let rejected = run(
            &ctx,
            "manager-1",
            Command::ForceWarn { order_id, reason: "late report".to_string() },
        )
        .await;
        assert!(matches!(rejected, Err(CoreError::InvalidState(_))));
    }

    #[tokio::test]
    async fn tip_on_auto_delivered_order_goes_to_cook() {
        let ctx = test_context(staffed_directory()).await;
        fund(&ctx, "user-1", 500).await;
        let placed = run(&ctx, "user-1", Command::Order { item: "cupcake".to_string() })
            .await
            .unwrap();
        let order_id = match placed {
            CommandOutcome::OrderPlaced { order_id, .. } => order_id,
            other => panic!("unexpected outcome {:?}", other),
        };

        run(&ctx, "cook-1", Command::Claim { order_id: order_id.clone() })
            .await
            .unwrap();
        run(
            &ctx,
            "cook-1",
            Command::Cook { order_id: order_id.clone(), evidence: vec!["proof".to_string()] },
        )
        .await
        .unwrap();
        ctx.orders.finish_prep(&order_id, Utc::now()).await.unwrap();

        // Stale-order sweep delivers without a courier
        let stale =
            Utc::now() + chrono::Duration::minutes(crate::orders::machine::READY_STALE_MINUTES + 1);
        ctx.orders.failsafe_sweep(stale).await.unwrap();

        let tipped = run(
            &ctx,
            "user-1",
            Command::Tip { order_id: order_id.clone(), amount: 100 },
        )
        .await
        .unwrap();
        match tipped {
            CommandOutcome::TipSplit { cook_share, courier_share } => {
                assert_eq!(cook_share, 100);
                assert_eq!(courier_share, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn blocked_origin_rejects_orders() {
        let ctx = test_context(staffed_directory()).await;
        fund(&ctx, "user-1", 500).await;
        run(
            &ctx,
            "owner-1",
            Command::BlockContext {
                context_id: "ctx-1".to_string(),
                reason: "spam".to_string(),
                days: None,
            },
        )
        .await
        .unwrap();

        let rejected = run(&ctx, "user-1", Command::Order { item: "cupcake".to_string() }).await;
        assert!(matches!(rejected, Err(CoreError::Unauthorized(_))));
    }
}
