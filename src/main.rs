use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payroll_backend::bootstrap;
use payroll_backend::config::Config;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,payroll_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("🚀 Starting payroll settlement engine");

    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    let state = bootstrap::initialize_app_state(config).await?;
    let handles = bootstrap::start_background_tasks(&state);

    info!("🌐 Engine running; {} background task(s) active", handles.len());

    // Run until interrupted; the schedulers do the work
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; stopping background tasks");
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
