/// HTTP server: spawns axum on a background tokio task.
use axum::Router;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::api::api_router;
use crate::state::AppState;
use crate::sync_ws::sync_router;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    api_router()
        .merge(sync_router())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve. Port 0 picks a free port; the bound port is returned.
pub async fn spawn_server(
    state: AppState,
) -> Result<(u16, JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let bind_addr = state.config.bind_address.clone();
    let port = state.config.port;

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", bind_addr, port)).await?;
    let actual_port = listener.local_addr()?.port();

    log::info!(
        "HTTP server listening on http://{}:{} (sync at ws://{}:{}/sync)",
        bind_addr,
        actual_port,
        bind_addr,
        actual_port
    );

    let app = app(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("HTTP server exited with error: {}", e);
        }
    });

    Ok((actual_port, handle))
}
