use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use tributary::api::{self, AppState};
use tributary::broker::Broker;
use tributary::config::TributaryConfig;
use tributary::manager::TenantManager;
use tributary::read::ReadService;
use tributary::shutdown::{self, Shutdown};
use tributary::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Logging + environment
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    // 2. Load Configuration
    let config = TributaryConfig::load()?;
    if config.server.api_key.is_none() {
        warn!("server.api_key not set, API authentication is DISABLED. DO NOT USE IN PRODUCTION.");
    }

    // 3. Connect external systems (store runs migrations on connect)
    let store = Arc::new(Store::connect(&config.store).await?);
    let broker = Arc::new(Broker::connect(&config.broker.url).await?);

    // 4. Core components
    let manager = Arc::new(TenantManager::new(store.clone(), broker.clone(), &config));
    let reads = ReadService::new(store.clone(), &config.pagination);

    // 5. HTTP server with graceful shutdown
    let state = AppState {
        manager: manager.clone(),
        reads,
        store,
        broker,
        api_key: config.server.api_key.clone(),
    };
    let app = api::router(state);

    let shutdown_handle = Shutdown::new();
    tokio::spawn(shutdown::signal_listener(shutdown_handle.clone()));

    let addr: SocketAddr = ([0, 0, 0, 0], config.server.port).into();
    info!("Tributary listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let wait = shutdown_handle.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait.requested().await })
        .await?;

    // 6. Drain tenant consumers within the grace budget
    manager.shutdown(config.shutdown.grace()).await;
    info!("Shutdown complete");

    Ok(())
}
