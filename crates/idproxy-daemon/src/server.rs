//! HTTP listener and graceful shutdown.
//!
//! Every path except the liveness path is handed to the [`Forwarder`].

use std::future::IntoFuture;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::Response;
use axum::routing::any;
use idproxy::{Forwarder, Shutdown};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::{DaemonError, Result};
use crate::health;

#[derive(Clone)]
struct AppState {
    forwarder: Forwarder,
    shutdown: Shutdown,
}

/// Builds the proxy router.
///
/// `shutdown` is handed to each forward so pending credential acquisitions
/// stop once the process begins shutting down.
pub fn router(forwarder: Forwarder, shutdown: Shutdown, health_path: &str) -> Router {
    Router::new()
        .route(health_path, any(health::liveness))
        .fallback(proxy)
        .layer(DefaultBodyLimit::disable())
        .with_state(AppState {
            forwarder,
            shutdown,
        })
}

async fn proxy(State(state): State<AppState>, request: Request) -> Response<Body> {
    state.forwarder.forward(request, state.shutdown.clone()).await
}

/// Serves `app` on `listener` until `shutdown` fires.
///
/// Once triggered, the listener stops accepting and in-flight requests get
/// `grace` to finish; whatever is left after that is dropped.
///
/// # Errors
///
/// Returns an error if the server fails before or during shutdown.
pub async fn run(
    listener: TcpListener,
    app: Router,
    shutdown: Shutdown,
    grace: Duration,
) -> Result<()> {
    let mut stop_accepting = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop_accepting.wait().await })
        .into_future();
    tokio::pin!(server);

    let mut shutdown = shutdown;
    tokio::select! {
        result = &mut server => {
            return result.map_err(|e| DaemonError::Server(e.to_string()));
        }
        () = shutdown.wait() => {
            info!(grace_secs = grace.as_secs(), "Server is shutting down");
        }
    }

    match tokio::time::timeout(grace, server).await {
        Ok(result) => result.map_err(|e| DaemonError::Server(e.to_string()))?,
        Err(_) => warn!("Grace period elapsed with requests in flight, forcing shutdown"),
    }

    Ok(())
}
