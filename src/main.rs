/// Sugarline - order fulfillment simulation service
///
/// A virtual kitchen economy: accounts order goods with coins, staff
/// claim, prepare and deliver them, and background jobs keep timers,
/// quotas and discipline moving.

mod api;
mod blocks;
mod config;
mod context;
mod db;
mod discipline;
mod dispatch;
mod error;
mod jobs;
mod ledger;
mod notify;
mod orders;
mod perms;
mod quota;
mod scripts;
mod server;
mod vip;

use config::ServerConfig;
use context::AppContext;
use error::CoreResult;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> CoreResult<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sugarline=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner();

    // Load configuration
    let config = ServerConfig::from_env()?;

    // Create application context
    let ctx = Arc::new(AppContext::new(config).await?);

    // Start background jobs
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    // Start server
    server::serve((*ctx).clone()).await?;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
   _____                        ___
  / ___/__  ______ _____ ______/ (_)___  ___
  \__ \/ / / / __ `/ __ `/ ___/ / / __ \/ _ \
 ___/ / /_/ / /_/ / /_/ / /  / / / / / /  __/
/____/\__,_/\__, /\__,_/_/  /_/_/_/ /_/\___/
           /____/

        Order Fulfillment Service v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
