mod bootstrap;
mod config;
mod dispatch;
mod error;
mod events;
mod execution;
mod fees;
mod payout;
mod poller;
mod sequence;
mod settlement;
mod store;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Settings;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,payout_settler=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting payout settlement worker");

    let settings = Settings::load()?;
    let worker = bootstrap::initialize_worker(&settings).await?;

    worker
        .poll_loop
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    if let Some(handle) = worker.fee_watcher {
        handle.abort();
    }

    info!("👋 Settlement worker stopped");
    Ok(())
}
