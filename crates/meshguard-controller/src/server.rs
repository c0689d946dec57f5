//! HTTP server for the controller surface

use crate::controller::Controller;
use crate::handlers::{self, AppState};
use axum::Router;
use meshguard_common::{Error, Result};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

/// HTTP server wrapper for the controller
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    pub fn new(controller: Arc<Controller>) -> Self {
        Server {
            state: AppState::new(controller),
        }
    }

    /// Serve until the provided shutdown future resolves
    pub async fn run(
        &self,
        bind_addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let app = self.create_app();
        info!(bind_addr, "starting controller surface");

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Unavailable(format!("failed to bind {}: {}", bind_addr, e)))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Unavailable(format!("server error: {}", e)))?;
        Ok(())
    }

    fn create_app(&self) -> Router {
        handlers::create_router(self.state.clone())
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    }
}
