/// Command endpoint
///
/// Every mutating operation arrives through one route. The request body
/// carries the actor, the optional origin context, and the command
/// itself as a tagged union.
use crate::{
    context::AppContext,
    dispatch::{dispatch, CommandOutcome, CommandRequest},
    error::CoreError,
};
use axum::{extract::State, routing::post, Json, Router};

pub fn routes() -> Router<AppContext> {
    Router::new().route("/v1/commands", post(run_command))
}

async fn run_command(
    State(ctx): State<AppContext>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<CommandOutcome>, CoreError> {
    if request.actor_id.trim().is_empty() {
        return Err(CoreError::Validation("actor_id is required".to_string()));
    }

    let outcome = dispatch(&ctx, request).await?;
    Ok(Json(outcome))
}
