//! Control API server using Axum

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::error::{GateError, Result};
use crate::proxy::rotation::ControlledSelector;

use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub controlled: Arc<ControlledSelector>,
    pub started_at: Instant,
}

/// Control API server
pub struct ApiServer {
    addr: String,
    state: AppState,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(addr: impl Into<String>, controlled: Arc<ControlledSelector>) -> Self {
        Self {
            addr: addr.into(),
            state: AppState {
                controlled,
                started_at: Instant::now(),
            },
        }
    }

    /// Build the router
    fn build_router(&self) -> Router {
        routes::create_router(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    #[instrument(skip(self, shutdown), fields(addr = %self.addr))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Control API listening on {}", listener.local_addr()?);

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| GateError::Internal(e.to_string()))?;

        info!("Control API shut down");
        Ok(())
    }
}
