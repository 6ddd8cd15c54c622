//! Listener groups
//!
//! A group is one or more listen addresses sharing a forwarder pool, a selection
//! strategy and an IP allow-list. Traditional mode runs a single group; multi-listener
//! mode runs one per `LISTENER_<N>_*` table.

use std::sync::Arc;

use tracing::debug;

use crate::config::{ListenerConfig, ProxyServerConfig};
use crate::error::Result;
use crate::models::Forwarder;
use crate::proxy::dispatcher::Dispatcher;
use crate::proxy::handler::{ProxyHandler, ProxyHandlerConfig};
use crate::proxy::health::HealthRecorder;
use crate::proxy::middleware::ProxyAuth;
use crate::proxy::rotation::{create_selector, ControlledSelector, ProxySelector, RotationStrategy};
use crate::proxy::server::ProxyServer;

/// Servers and forwarders of one listener group
pub struct ListenerGroup {
    name: String,
    forwarders: Vec<Arc<Forwarder>>,
    selector: Arc<dyn ProxySelector>,
    servers: Vec<ProxyServer>,
}

impl ListenerGroup {
    /// Build the group's pool, selector and one server per listen address
    ///
    /// A group using the controlled strategy draws from `controlled`, whose pool the
    /// caller owns; every other strategy gets a selector over the group's own pool.
    pub fn build(
        listener: &ListenerConfig,
        proxy: &ProxyServerConfig,
        controlled: &Arc<ControlledSelector>,
        recorder: Arc<dyn HealthRecorder>,
    ) -> Result<Self> {
        let forwarders = listener.forwarders.build()?;

        let strategy = listener.forwarders.strategy;
        let selector = create_selector(strategy, controlled);
        if strategy != RotationStrategy::Controlled {
            selector.set_pool(forwarders.clone());
        }

        let auth = ProxyAuth::new(proxy.auth_username.clone(), proxy.auth_password.clone());
        let handler_config = ProxyHandlerConfig {
            pretend: proxy.pretend,
            relay_wait: proxy.relay_wait(),
        };

        let servers = listener
            .listen
            .iter()
            .map(|addr| {
                // Each listener tells its own address apart in relay errors
                let dispatcher = Arc::new(Dispatcher::new(
                    selector.clone(),
                    recorder.clone(),
                    addr.clone(),
                    proxy.connect_timeout(),
                ));
                let handler = Arc::new(ProxyHandler::new(
                    dispatcher,
                    auth.clone(),
                    handler_config.clone(),
                ));
                ProxyServer::new(addr.clone(), handler, listener.ip_allow.clone())
            })
            .collect::<Vec<_>>();

        debug!(
            group = %listener.name,
            forwarders = forwarders.len(),
            listeners = servers.len(),
            strategy = selector.strategy_name(),
            "Listener group built"
        );

        Ok(Self {
            name: listener.name.clone(),
            forwarders,
            selector,
            servers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group's own forwarders in configuration order
    pub fn forwarders(&self) -> &[Arc<Forwarder>] {
        &self.forwarders
    }

    pub fn strategy_name(&self) -> &'static str {
        self.selector.strategy_name()
    }

    pub fn servers(&self) -> &[ProxyServer] {
        &self.servers
    }

    pub fn into_servers(self) -> Vec<ProxyServer> {
        self.servers
    }
}
