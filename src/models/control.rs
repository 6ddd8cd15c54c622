use serde::{Deserialize, Serialize};

use super::forwarder::{Forwarder, ForwarderInfo};

/// Envelope returned by every control API endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_proxy: Option<ForwarderInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_list: Option<Vec<ForwarderInfo>>,
}

impl ControlResponse {
    pub fn with_current(message: impl Into<String>, forwarder: &Forwarder) -> Self {
        Self {
            success: true,
            message: message.into(),
            current_proxy: Some(forwarder.info()),
            proxy_list: None,
        }
    }

    pub fn with_list<'a>(
        message: impl Into<String>,
        forwarders: impl IntoIterator<Item = &'a Forwarder>,
    ) -> Self {
        Self {
            success: true,
            message: message.into(),
            current_proxy: None,
            proxy_list: Some(forwarders.into_iter().map(Forwarder::info).collect()),
        }
    }
}

/// Body of a pin request
#[derive(Debug, Clone, Deserialize)]
pub struct PinRequest {
    pub address: String,
}
