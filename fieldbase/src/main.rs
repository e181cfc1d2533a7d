use fieldbase::error::AppError;
use fieldbase::info;
use fieldbase::orchestrator::Engine;
use fieldbase::rest::{self, RequestState};
use fieldbase::settings::AppConfig;
use fieldbase::storage::Storage;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = AppConfig::new("config/settings")?;
    let storage = Storage::open(&config.storage)?;
    let engine = Arc::new(Engine::open(storage, config.engine_settings()));

    if !config.http.enable {
        info!("HTTP server is disabled, nothing to do");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = RequestState { engine };
    rest::serve(state, config.http.bind_address, Some(CorsLayer::permissive()), shutdown_rx).await
}
