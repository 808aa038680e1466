/// API routes and handlers
pub mod commands;
pub mod fulfillment;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(commands::routes())
        .merge(fulfillment::routes())
}
