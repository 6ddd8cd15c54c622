//! Forwarder transport layer for direct, HTTP and SOCKS5 egress
//!
//! Handles opening a TCP byte stream to a target through one forwarder.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{GateError, Result};
use crate::models::{Forwarder, ForwarderProtocol};

/// Upper bound for an upstream CONNECT reply head
const MAX_CONNECT_REPLY: usize = 8 * 1024;

/// Forwarder transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Connect to a target through the specified forwarder
    #[instrument(skip(forwarder), fields(forwarder = %forwarder.address(), target = %target_host))]
    pub async fn connect(
        forwarder: &Forwarder,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        match forwarder.protocol() {
            ForwarderProtocol::Direct => Self::connect_direct(target_host, target_port).await,
            ForwarderProtocol::Http => Self::connect_http(forwarder, target_host, target_port).await,
            ForwarderProtocol::Socks5 => {
                Self::connect_socks5(forwarder, target_host, target_port).await
            }
        }
    }

    async fn connect_direct(target_host: &str, target_port: u16) -> Result<TcpStream> {
        let addr = join_host_port(target_host, target_port);
        debug!("Dialing {} directly", addr);

        TcpStream::connect(&addr).await.map_err(|e| {
            GateError::ForwarderConnectionFailed(format!("dial tcp {}: {}", addr, e))
        })
    }

    /// Connect through HTTP CONNECT method
    async fn connect_http(
        forwarder: &Forwarder,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to HTTP forwarder at {}", forwarder.address());

        let mut stream = TcpStream::connect(forwarder.address()).await.map_err(|e| {
            GateError::ForwarderConnectionFailed(format!(
                "dial tcp {}: {}",
                forwarder.address(),
                e
            ))
        })?;

        let request = Self::build_connect_request(forwarder, target_host, target_port);
        stream.write_all(request.as_bytes()).await.map_err(|e| {
            GateError::ForwarderConnectionFailed(format!("Failed to send CONNECT: {}", e))
        })?;

        let reply = read_reply_head(&mut stream).await?;
        let status_line = reply.lines().next().unwrap_or_default();
        let accepted = status_line
            .split_whitespace()
            .nth(1)
            .is_some_and(|code| code == "200");

        if !status_line.starts_with("HTTP/") || !accepted {
            return Err(GateError::ConnectFailed(format!(
                "{} answered: {}",
                forwarder.address(),
                status_line
            )));
        }

        debug!("HTTP CONNECT tunnel established");
        Ok(stream)
    }

    /// Build HTTP CONNECT request
    fn build_connect_request(forwarder: &Forwarder, target_host: &str, target_port: u16) -> String {
        let authority = join_host_port(target_host, target_port);
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

        // Add proxy authentication if credentials are provided
        if let Some((username, password)) = forwarder.credentials() {
            let credentials = format!("{}:{}", username, password);
            let encoded = BASE64.encode(credentials.as_bytes());
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }

        request.push_str("\r\n");
        request
    }

    /// Connect through SOCKS5 forwarder, letting it resolve the target name
    async fn connect_socks5(
        forwarder: &Forwarder,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS5 forwarder at {}", forwarder.address());

        let socket = TcpStream::connect(forwarder.address()).await.map_err(|e| {
            GateError::ForwarderConnectionFailed(format!(
                "dial tcp {}: {}",
                forwarder.address(),
                e
            ))
        })?;

        let stream = match forwarder.credentials() {
            Some((username, password)) => {
                Socks5Stream::connect_with_password_and_socket(
                    socket,
                    (target_host, target_port),
                    username,
                    password,
                )
                .await
            }
            None => Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await,
        }
        .map_err(|e| GateError::ConnectFailed(format!("SOCKS5 connect failed: {}", e)))?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }
}

/// Read an HTTP reply head byte by byte so no tunneled bytes are consumed
async fn read_reply_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_REPLY {
            return Err(GateError::ConnectFailed(
                "CONNECT reply head too large".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await.map_err(|e| {
            GateError::ForwarderConnectionFailed(format!(
                "Failed to read CONNECT response: {}",
                e
            ))
        })?;
        if n == 0 {
            return Err(GateError::ConnectFailed("empty CONNECT response".to_string()));
        }
        head.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Split `host[:port]` into its parts, bracketed IPv6 included
///
/// `default_port` applies when the authority has no port.
pub fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let invalid = || GateError::InvalidRequest(format!("invalid authority: {}", authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail {
            "" => (host, None),
            _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
        }
    } else {
        match authority.rsplit_once(':') {
            // A bare IPv6 literal carries no port
            Some((host, _)) if host.contains(':') => (authority, None),
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}

/// Join a host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
