//! HTTP server: the WebSocket route plus static files for everything else

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use ops_core::traits::Dialer;

use crate::gateway::connection::ClientConnection;
use crate::state::GatewayState;

/// How long shutdown waits for client connections to close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Build the gateway router
pub fn router<D: Dialer>(state: Arc<GatewayState<D>>) -> Router {
    let mut router = Router::new().route(&state.config.ws_path, get(ws_handler::<D>));

    if let Some(dir) = &state.config.static_dir {
        tracing::debug!("Serving static files from {:?}", dir);
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve on `listener` until the state's token is cancelled
pub async fn serve<D: Dialer>(listener: TcpListener, state: Arc<GatewayState<D>>) -> Result<()> {
    tracing::info!(
        "Gateway listening on {} (WebSocket route {})",
        listener.local_addr()?,
        state.config.ws_path
    );

    let cancel = state.cancel.clone();
    axum::serve(
        listener,
        router(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
    .context("HTTP server failed")?;

    state.tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, state.tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!("{} client connections still open at shutdown", state.tracker.len());
    }

    Ok(())
}

async fn ws_handler<D: Dialer>(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState<D>>>,
) -> Response {
    let connection = ClientConnection::new(state.next_client_id(), peer, &state);
    let tracker = state.tracker.clone();

    ws.on_upgrade(move |socket| tracker.track_future(connection.run(socket)))
}
