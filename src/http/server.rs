//! HTTP server implementation.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::middleware::{protect, RateLimitState};
use crate::error::{RatewallError, Result};

/// Body of the protected landing endpoint.
pub const HOME_BODY: &str = "Ratewall: rate limited endpoint\n";

async fn home() -> &'static str {
    HOME_BODY
}

/// Build the application router with every route behind the rate limiter.
pub fn app(state: RateLimitState) -> Router {
    let routes = Router::new().route("/", get(home));
    protect(routes, state).layer(TraceLayer::new_for_http())
}

/// HTTP server for the rate limited application.
pub struct HttpServer {
    /// Bound listener
    listener: TcpListener,
    /// The application router
    router: Router,
}

impl HttpServer {
    /// Bind the server to `addr`.
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, router })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// Once `signal` resolves the server stops accepting connections and
    /// waits at most `drain_timeout` for in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F, drain_timeout: Duration) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Starting HTTP server");

        let (draining_tx, draining_rx) = tokio::sync::oneshot::channel::<()>();
        let serve = axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            signal.await;
            let _ = draining_tx.send(());
        })
        .into_future();

        let drain_deadline = async move {
            if draining_rx.await.is_ok() {
                tokio::time::sleep(drain_timeout).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            result = serve => result.map_err(|e| {
                error!(error = %e, "HTTP server failed");
                RatewallError::Server(e.to_string())
            }),
            _ = drain_deadline => {
                warn!(
                    timeout = ?drain_timeout,
                    "In-flight requests did not finish before the drain timeout"
                );
                Ok(())
            }
        }
    }
}
