//! Proxy authentication
//!
//! Handles Basic authentication for the proxy front-end.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::debug;

use crate::error::{GateError, Result};

/// Reply sent when credentials are missing or wrong
pub const CHALLENGE_RESPONSE: &str =
    "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n";

/// Proxy authentication handler
#[derive(Clone)]
pub struct ProxyAuth {
    /// Whether authentication is enabled
    enabled: bool,
    /// Expected username
    username: String,
    /// Expected password
    password: String,
}

impl ProxyAuth {
    /// Create a proxy auth handler
    ///
    /// Authentication is only enforced when both username and password are non-empty.
    pub fn new(username: String, password: String) -> Self {
        Self {
            enabled: !username.is_empty() && !password.is_empty(),
            username,
            password,
        }
    }

    /// Create a disabled auth handler
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            username: String::new(),
            password: String::new(),
        }
    }

    /// Check if authentication is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Validate the raw `Proxy-Authorization` value
    pub fn validate(&self, header: Option<&str>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let (user, pass) = header
            .and_then(extract_user_pass)
            .ok_or(GateError::AuthenticationFailed)?;

        if user == self.username && pass == self.password {
            debug!("Proxy authentication successful for user: {}", user);
            Ok(())
        } else {
            Err(GateError::AuthenticationFailed)
        }
    }
}

/// Decode `Basic <base64(user:pass)>` into its two parts
pub fn extract_user_pass(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (user, pass) = credentials.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
