//! Relay Gate - Entry Point
//!
//! Starts the proxy listener groups, their health checkers and the optional control API
//! with graceful shutdown support.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_gate::api::ApiServer;
use relay_gate::config::{Config, LogConfig};
use relay_gate::proxy::group::ListenerGroup;
use relay_gate::proxy::health::{FailureRecorder, HealthChecker, HealthRecorder};
use relay_gate::proxy::rotation::ControlledSelector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;

    init_tracing(&config.log);
    if config.multi_listener {
        info!(
            "Starting Relay Gate in multi-listener mode with {} group(s)",
            config.listeners.len()
        );
    } else {
        info!("Starting Relay Gate");
    }

    if config.proxy.auth_username.is_empty() != config.proxy.auth_password.is_empty() {
        warn!("Proxy authentication needs both a username and a password, leaving it disabled");
    } else if !config.proxy.auth_username.is_empty() {
        info!("Proxy authentication enabled");
    }

    // The controlled selector is shared by every group using the api strategy
    let controlled = Arc::new(ControlledSelector::new());
    let recorder: Arc<dyn HealthRecorder> = Arc::new(FailureRecorder);

    let mut groups = Vec::new();
    for listener in &config.listeners {
        if listener.listen.is_empty() {
            warn!(group = %listener.name, "Skipping listener group without a listen address");
            continue;
        }

        let group = ListenerGroup::build(listener, &config.proxy, &controlled, recorder.clone())
            .with_context(|| format!("failed to build listener group {}", listener.name))?;
        info!(
            "Listener group {}: {} forwarders, strategy {}, listen {}",
            group.name(),
            group.forwarders().len(),
            group.strategy_name(),
            listener.listen.join(", ")
        );
        if !listener.ip_allow.is_empty() {
            info!(group = %group.name(), "IP allow-list enabled with {} entries", listener.ip_allow.len());
        }
        groups.push(group);
    }

    // The control API inspects and steers the first group's pool
    let Some(first) = groups.first() else {
        bail!("no listener group has a listen address");
    };
    controlled.set_pool(first.forwarders().to_vec());

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    // Start one health checker per group
    let mut health_tasks = Vec::new();
    if config.check.enabled {
        for group in &groups {
            let checker =
                HealthChecker::new(config.check.checker_config(), group.forwarders().to_vec());
            let health_shutdown = shutdown_tx.subscribe();
            health_tasks.push(tokio::spawn(async move {
                checker.run(health_shutdown).await;
            }));
        }
    } else {
        warn!("Health checker disabled");
    }

    // Start proxy servers
    let mut proxy_tasks = JoinSet::new();
    for group in groups {
        for server in group.into_servers() {
            let proxy_shutdown = shutdown_tx.subscribe();
            proxy_tasks.spawn(async move { server.run(proxy_shutdown).await });
        }
    }

    // Start control API
    let api_task = config.control_addr().map(|addr| {
        let api_server = ApiServer::new(addr, controlled.clone());
        let api_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = api_server.run(api_shutdown).await {
                error!("Control API error: {}", e);
            }
        })
    });

    info!(
        "Servers started - Proxy listeners: {}, Control API: {}",
        proxy_tasks.len(),
        config.control_addr().as_deref().unwrap_or("disabled")
    );

    // Wait for shutdown signal, or for any proxy listener to die
    let early_exit = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            None
        }
        Some(result) = proxy_tasks.join_next() => Some(result),
    };

    // Send shutdown signal to all services
    let _ = shutdown_tx.send(true);

    let mut failure = early_exit.and_then(proxy_failure);
    while let Some(result) = proxy_tasks.join_next().await {
        if let Some(e) = proxy_failure(result) {
            if failure.is_none() {
                failure = Some(e);
            } else {
                error!("{:#}", e);
            }
        }
    }
    if let Some(task) = api_task {
        let _ = task.await;
    }
    for task in health_tasks {
        let _ = task.await;
    }

    if let Some(e) = failure {
        return Err(e);
    }

    info!("Relay Gate stopped");
    Ok(())
}

/// Turn a finished proxy task into its failure, if any
fn proxy_failure(
    result: Result<relay_gate::Result<()>, JoinError>,
) -> Option<anyhow::Error> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(anyhow::Error::new(e).context("proxy server failed")),
        Err(e) => Some(anyhow::Error::new(e).context("proxy server task panicked")),
    }
}

/// Install the tracing subscriber, honouring `RUST_LOG` over the configured level
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("relay_gate={},tower_http=debug", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
