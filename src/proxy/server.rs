//! Proxy listener
//!
//! Accepts client connections, applies the IP allow-list and hands each connection to the
//! [`ProxyHandler`] on its own task.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, instrument, Instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::proxy::handler::ProxyHandler;
use crate::proxy::middleware::IpAllowList;

/// Proxy server
pub struct ProxyServer {
    addr: String,
    handler: Arc<ProxyHandler>,
    allow: IpAllowList,
}

impl ProxyServer {
    /// Create a new proxy server bound to `addr` once run
    pub fn new(addr: impl Into<String>, handler: Arc<ProxyHandler>, allow: IpAllowList) -> Self {
        Self {
            addr: addr.into(),
            handler,
            allow,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Run the proxy server
    ///
    /// Failing to bind is the only fatal error.
    #[instrument(skip(self, shutdown), fields(addr = %self.addr))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Proxy server listening on {}", listener.local_addr()?);

        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept connections on `listener` until shutdown is signalled
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            if !self.allow.allows(client_addr.ip()) {
                                debug!(client = %client_addr, "Client not in allow list, closing");
                                continue;
                            }

                            let handler = self.handler.clone();
                            let span = info_span!("conn", id = %Uuid::new_v4(), peer = %client_addr);
                            tokio::spawn(
                                async move {
                                    handler.serve(stream, client_addr).await;
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }
    }
}
