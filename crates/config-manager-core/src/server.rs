//! Local HTTP listeners (token agent, admin surface).

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Binds `127.0.0.1:{port}` (port 0 picks a free one).
pub async fn bind_local(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", port)).await
}

/// Serves `router` until `shutdown` is cancelled.
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        debug!(server = name, %addr, "listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            debug!(server = name, "shutdown signal received, shutting down");
        })
        .await
}
