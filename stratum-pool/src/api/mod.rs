//! HTTP reporting API.
//!
//! Read-only JSON views of coin stats, telemetry health and recent activity,
//! plus the admin coin reload. Built on Axum and served under `/api/v1`.
//!
//! Binds to localhost by default and has no authentication; the reload
//! endpoint makes exposing it beyond the host unwise.

pub mod v1;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ApiConfig;
use crate::tracing::prelude::*;
pub use v1::AppState;

/// Bind the configured address and serve until `shutdown` fires.
pub async fn serve(config: ApiConfig, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(&config.listen).await?;
    serve_on(listener, state, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let actual_addr = listener.local_addr()?;
    info!(url = %format!("http://{}", actual_addr), "API server listening.");

    if !actual_addr.ip().is_loopback() {
        warn!(
            "API server is bound to a non-localhost address ({}). \
             This exposes coin reload to the network without authentication.",
            actual_addr.ip()
        );
    }

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;

    Ok(())
}

/// Build the application router with all API routes.
pub fn build_router(state: AppState) -> Router {
    Router::new().nest("/api/v1", v1::routes(state)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}
