use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GateError, Result};

/// Sentinel stored in the latency slot while no measurement exists
const LATENCY_UNKNOWN: i64 = -1;

/// Address reported by the direct egress forwarder
pub const DIRECT_ADDRESS: &str = "direct";

/// Egress protocol spoken to a forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwarderProtocol {
    Direct,
    Http,
    Socks5,
}

impl ForwarderProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwarderProtocol::Direct => "direct",
            ForwarderProtocol::Http => "http",
            ForwarderProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_scheme(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Some(ForwarderProtocol::Direct),
            "http" => Some(ForwarderProtocol::Http),
            "socks5" | "socks5h" => Some(ForwarderProtocol::Socks5),
            _ => None,
        }
    }

    fn default_port(&self) -> Option<u16> {
        match self {
            ForwarderProtocol::Direct => None,
            ForwarderProtocol::Http => Some(80),
            ForwarderProtocol::Socks5 => Some(1080),
        }
    }
}

impl std::fmt::Display for ForwarderProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One configured upstream endpoint
///
/// The address is the identity key and never changes. Health fields are atomics so
/// that concurrent connections, the health checker and selectors can share one
/// instance behind an `Arc` without locking.
#[derive(Debug)]
pub struct Forwarder {
    address: String,
    protocol: ForwarderProtocol,
    username: Option<String>,
    password: Option<String>,
    priority: u32,
    max_failures: u32,
    enabled: AtomicBool,
    latency_nanos: AtomicI64,
    failures: AtomicU32,
}

impl Forwarder {
    pub fn new(address: impl Into<String>, protocol: ForwarderProtocol, priority: u32) -> Self {
        Self {
            address: address.into(),
            protocol,
            username: None,
            password: None,
            priority,
            max_failures: 3,
            enabled: AtomicBool::new(true),
            latency_nanos: AtomicI64::new(LATENCY_UNKNOWN),
            failures: AtomicU32::new(0),
        }
    }

    /// The forwarder that dials targets without any upstream hop
    pub fn direct() -> Self {
        Self::new(DIRECT_ADDRESS, ForwarderProtocol::Direct, 0)
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Parse `scheme://[user:pass@]host:port[#priority=N]` or `direct://`
    pub fn from_url(raw: &str, max_failures: u32) -> Result<Self> {
        let url = Url::parse(raw.trim())?;

        let protocol = ForwarderProtocol::from_scheme(url.scheme())
            .ok_or_else(|| GateError::UnsupportedProtocol(url.scheme().to_string()))?;

        let priority = match url.fragment() {
            Some(fragment) => parse_priority(fragment)?,
            None => 0,
        };

        if protocol == ForwarderProtocol::Direct {
            return Ok(Self::new(DIRECT_ADDRESS, protocol, priority).with_max_failures(max_failures));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| GateError::InvalidForwarder(format!("{} is missing a host", raw)))?;
        let port = url
            .port()
            .or_else(|| protocol.default_port())
            .ok_or_else(|| GateError::InvalidForwarder(format!("{} is missing a port", raw)))?;

        let mut forwarder = Self::new(format!("{}:{}", host, port), protocol, priority)
            .with_max_failures(max_failures);

        if !url.username().is_empty() {
            forwarder = forwarder.with_credentials(
                url.username().to_string(),
                url.password().unwrap_or("").to_string(),
            );
        }

        Ok(forwarder)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn protocol(&self) -> ForwarderProtocol {
        self.protocol
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Last measured latency, `None` while unknown
    pub fn latency(&self) -> Option<Duration> {
        let nanos = self.latency_nanos.load(Ordering::Relaxed);
        u64::try_from(nanos).ok().map(Duration::from_nanos)
    }

    /// Latency in milliseconds as exposed on the control API, `-1` when unknown
    pub fn latency_millis(&self) -> i64 {
        self.latency()
            .map(|l| i64::try_from(l.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(LATENCY_UNKNOWN)
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        let nanos = latency
            .map(|l| i64::try_from(l.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(LATENCY_UNKNOWN);
        self.latency_nanos.store(nanos, Ordering::Relaxed);
    }

    /// Enable and clear the failure count. Returns true when the forwarder was disabled.
    pub fn enable(&self) -> bool {
        self.failures.store(0, Ordering::Release);
        !self.enabled.swap(true, Ordering::AcqRel)
    }

    /// Returns true when the forwarder was enabled.
    pub fn disable(&self) -> bool {
        self.enabled.swap(false, Ordering::AcqRel)
    }

    /// Count one failure. Returns true when this failure disabled the forwarder.
    pub fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if self.max_failures == 0 || failures < self.max_failures {
            return false;
        }
        self.disable()
    }

    pub fn info(&self) -> ForwarderInfo {
        ForwarderInfo {
            address: self.address.clone(),
            priority: self.priority,
            enabled: self.enabled(),
            latency: self.latency_millis(),
        }
    }
}

fn parse_priority(fragment: &str) -> Result<u32> {
    for pair in fragment.split('&') {
        if let Some(value) = pair.strip_prefix("priority=") {
            return value.parse().map_err(|_| {
                GateError::InvalidForwarder(format!("invalid priority: {}", value))
            });
        }
    }
    Ok(0)
}

/// Forwarder snapshot as reported by the control API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderInfo {
    pub address: String,
    pub priority: u32,
    pub enabled: bool,
    /// Last measured latency in milliseconds, -1 while unknown
    pub latency: i64,
}
