/// Read-only fulfillment endpoints
use crate::{context::AppContext, discipline::StrikeRecord, error::CoreError, orders::Order};
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/v1/orders/:order_id", get(get_order))
        .route("/v1/accounts/:account_id", get(get_account))
        .route("/v1/accounts/:account_id/strikes", get(get_strikes))
}

async fn get_strikes(
    State(ctx): State<AppContext>,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<StrikeRecord>>, CoreError> {
    let records = ctx.discipline.history(&account_id).await?;
    Ok(Json(records))
}

async fn get_order(
    State(ctx): State<AppContext>,
    Path(order_id): Path<String>,
) -> Result<Json<Order>, CoreError> {
    let order = ctx.orders.get(&order_id).await?;
    Ok(Json(order))
}

#[derive(Serialize)]
struct AccountView {
    id: String,
    balance: i64,
    strike_count: i64,
    lifetime_cook_count: i64,
    lifetime_courier_count: i64,
    weekly_cook_count: i64,
    weekly_courier_count: i64,
}

async fn get_account(
    State(ctx): State<AppContext>,
    Path(account_id): Path<String>,
) -> Result<Json<AccountView>, CoreError> {
    let account = ctx.ledger.get(&account_id).await?;
    Ok(Json(AccountView {
        id: account.id,
        balance: account.balance,
        strike_count: account.strike_count,
        lifetime_cook_count: account.lifetime_cook_count,
        lifetime_courier_count: account.lifetime_courier_count,
        weekly_cook_count: account.weekly_cook_count,
        weekly_courier_count: account.weekly_courier_count,
    }))
}
