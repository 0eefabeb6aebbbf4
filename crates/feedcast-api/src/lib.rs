pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/render", post(handlers::handle_render))
        .route("/screenshot", post(handlers::handle_screenshot))
        .route("/status", get(handlers::handle_status))
        .route("/cache/{fingerprint}", get(handlers::handle_cache_entry))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve until the daemon's shutdown broadcast fires.
pub async fn serve(state: ApiState, listen_addr: &str, port: u16) -> anyhow::Result<()> {
    let mut shutdown = state.shutdown_tx.subscribe();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((listen_addr, port)).await?;
    tracing::info!(addr = listen_addr, port, "API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    tracing::info!("API stopped");
    Ok(())
}
