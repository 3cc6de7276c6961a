//! Static origin server for the public directory the release tool writes to.

use std::path::PathBuf;

use axum::Router;
use axum::http::{HeaderValue, header};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::error::Result;

/// Serves `dir` on `listener` until `token` is cancelled.
///
/// Every response carries `Cache-Control: no-cache` so update checks always
/// revalidate the worker script and manifest.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_origin(
    listener: TcpListener,
    dir: PathBuf,
    token: CancellationToken,
) -> Result<()> {
    log::info!(
        "Serving {} on {}",
        dir.display(),
        listener.local_addr()?
    );
    let app = Router::new()
        .fallback_service(ServeDir::new(dir))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ));
    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await?;
    Ok(())
}

/// Binds `host:port` and serves `dir` until `token` is cancelled.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn run_origin(
    dir: PathBuf,
    host: &str,
    port: u16,
    token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    serve_origin(listener, dir, token).await
}
