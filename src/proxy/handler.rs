//! HTTP/CONNECT proxy request handler
//!
//! Drives one accepted client connection: parse, pretend gate, auth, then either a
//! CONNECT tunnel or a forwarded plain HTTP exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{GateError, Result};
use crate::proxy::dispatcher::{DispatchError, Dispatched, Dispatcher};
use crate::proxy::message::{read_request, read_response_head, Request};
use crate::proxy::middleware::{extract_user_pass, ProxyAuth, CHALLENGE_RESPONSE};
use crate::proxy::relay::{pump, with_deadline, DuplexRelay, PumpEnd};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Configuration for the proxy handler
#[derive(Debug, Clone)]
pub struct ProxyHandlerConfig {
    /// Answer every request with a fake 404 instead of proxying
    pub pretend: bool,
    /// How long the surviving relay direction may keep reading
    pub relay_wait: Duration,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            pretend: false,
            relay_wait: crate::proxy::relay::DEFAULT_RELAY_WAIT,
        }
    }
}

/// Proxy request handler
pub struct ProxyHandler {
    dispatcher: Arc<Dispatcher>,
    auth: ProxyAuth,
    config: ProxyHandlerConfig,
    relay: DuplexRelay,
}

impl ProxyHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, auth: ProxyAuth, config: ProxyHandlerConfig) -> Self {
        let relay = DuplexRelay::new(config.relay_wait);
        Self {
            dispatcher,
            auth,
            config,
            relay,
        }
    }

    /// Handle one client connection until it is done
    pub async fn serve<S>(&self, stream: S, client_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, mut write) = tokio::io::split(stream);
        let mut reader = BufReader::new(read);

        let request = match read_request(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!(client = %client_addr, "Dropping connection: {}", e);
                return;
            }
        };

        if self.config.pretend {
            let reply = format!(
                "{} 404 Not Found\r\nServer: nginx\r\n\r\n404 Not Found\r\n",
                request.proto
            );
            let _ = write.write_all(reply.as_bytes()).await;
            debug!(client = %client_addr, uri = %request.uri, "Pretend mode reply sent");
            return;
        }

        if self.auth.validate(request.auth.as_deref()).is_err() {
            let (user, pass) = request
                .auth
                .as_deref()
                .and_then(extract_user_pass)
                .unwrap_or_default();
            warn!(
                client = %client_addr,
                "Proxy authentication failed, user: {}, pass: {}",
                user,
                pass
            );
            let _ = write.write_all(CHALLENGE_RESPONSE.as_bytes()).await;
            return;
        }

        if request.is_connect() {
            self.serve_connect(request, reader, write, client_addr).await;
        } else {
            self.serve_http(request, reader, write, client_addr).await;
        }
    }

    /// Dial for `request`, answering the client on failure
    async fn dispatch<W>(
        &self,
        request: &Request,
        client: &mut W,
        client_addr: SocketAddr,
    ) -> Option<Dispatched>
    where
        W: AsyncWrite + Unpin,
    {
        let reply = match self.dispatcher.dial(&request.target).await {
            Ok(dispatched) => return Some(dispatched),
            Err(DispatchError::NoForwarder) => {
                warn!(client = %client_addr, target = %request.target, "No forwarder available");
                format!("{} 503 Service Unavailable\r\n\r\n", request.proto)
            }
            Err(DispatchError::InvalidTarget(target)) => {
                debug!(client = %client_addr, "Invalid target {}", target);
                format!("{} 400 Bad Request\r\n\r\n", request.proto)
            }
            Err(e) => {
                warn!(client = %client_addr, "Error in dial: {}", e);
                format!("{} 502 ERROR\r\n\r\n", request.proto)
            }
        };

        let _ = client.write_all(reply.as_bytes()).await;
        None
    }

    #[instrument(skip_all, fields(target = %request.target))]
    async fn serve_connect<R, W>(
        &self,
        request: Request,
        reader: R,
        mut writer: W,
        client_addr: SocketAddr,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let Some(dispatched) = self.dispatch(&request, &mut writer, client_addr).await else {
            return;
        };
        let forwarder = dispatched.forwarder;

        if let Err(e) = writer.write_all(CONNECT_ESTABLISHED).await {
            debug!("Client went away before the tunnel started: {}", e);
            return;
        }

        info!(client = %client_addr, forwarder = %forwarder.address(), "Tunnel established");

        let outcome = self
            .relay
            .relay_halves((reader, writer), dispatched.connection.into_split())
            .await;

        let up_kb = outcome.left_to_right as f64 / 1024.0;
        let down_kb = outcome.right_to_left as f64 / 1024.0;
        let duration_ms = outcome.elapsed.as_millis() as u64;

        match &outcome.error {
            Some(e) => {
                warn!(
                    client = %client_addr,
                    forwarder = %forwarder.address(),
                    duration_ms,
                    up_kb,
                    down_kb,
                    "Relay error: {}",
                    e
                );
                self.dispatcher.record_relay_failure(&forwarder, e);
            }
            None => {
                info!(
                    client = %client_addr,
                    forwarder = %forwarder.address(),
                    duration_ms,
                    up_kb,
                    down_kb,
                    "Tunnel closed"
                );
            }
        }
    }

    #[instrument(skip_all, fields(target = %request.target))]
    async fn serve_http<R, W>(
        &self,
        request: Request,
        mut reader: R,
        mut writer: W,
        client_addr: SocketAddr,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some(dispatched) = self.dispatch(&request, &mut writer, client_addr).await else {
            return;
        };
        let forwarder = dispatched.forwarder;
        let started = Instant::now();

        let (upstream_read, mut upstream_write) = dispatched.connection.into_split();
        if let Err(e) = upstream_write.write_all(&request.encode()).await {
            debug!("Failed to send request upstream: {}", e);
            return;
        }

        let wait = self.relay.wait();
        let (body_deadline_tx, mut body_deadline_rx) = watch::channel(None);
        let (response_deadline_tx, mut response_deadline_rx) = watch::channel(None);

        // Remaining client bytes (request bodies) go upstream until the response is done
        let upload = async {
            let pumped = pump(&mut reader, &mut upstream_write, &mut body_deadline_rx).await;
            if pumped.failed() {
                response_deadline_tx.send_replace(Some(Instant::now() + wait));
            }
            pumped
        };

        let download = async {
            let result =
                forward_response(upstream_read, &mut writer, &mut response_deadline_rx).await;
            body_deadline_tx.send_replace(Some(Instant::now()));
            result
        };

        let (uploaded, downloaded) = tokio::join!(upload, download);

        let up_kb = uploaded.bytes as f64 / 1024.0;
        let duration_ms = started.elapsed().as_millis() as u64;

        match downloaded {
            Ok(bytes) => info!(
                client = %client_addr,
                forwarder = %forwarder.address(),
                duration_ms,
                up_kb,
                down_kb = bytes as f64 / 1024.0,
                "{} {} forwarded",
                request.method,
                request.uri
            ),
            Err(e) => debug!(
                client = %client_addr,
                forwarder = %forwarder.address(),
                duration_ms,
                up_kb,
                "Response forwarding ended: {}",
                e
            ),
        }
    }
}

/// Copy the upstream response to the client with `Connection: close` forced
///
/// Returns the number of body bytes forwarded.
async fn forward_response<R, W>(
    upstream: R,
    client: &mut W,
    deadline: &mut watch::Receiver<Option<Instant>>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut upstream = BufReader::new(upstream);

    let mut head = match with_deadline(read_response_head(&mut upstream), deadline).await {
        Some(head) => head?,
        None => return Err(GateError::Timeout),
    };
    head.force_close();
    client.write_all(&head.encode()).await?;

    let pumped = pump(&mut upstream, &mut *client, deadline).await;
    match pumped.end {
        PumpEnd::Read(e) | PumpEnd::Write(e) => Err(e.into()),
        PumpEnd::Eof | PumpEnd::Unblocked => Ok(pumped.bytes),
    }
}
