use tracing_subscriber::EnvFilter;

use chatkey_relay::config::RelayConfig;
use chatkey_relay::router::build_router;
use chatkey_relay::shutdown::shutdown_signal;
use chatkey_relay::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = RelayConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config);
    let relay = state.relay.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("relay listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            relay.shutdown_all();
        })
        .await?;

    Ok(())
}
