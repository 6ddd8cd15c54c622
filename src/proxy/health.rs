//! Forwarder health feedback and periodic health checking
//!
//! Dial and relay code reports outcomes through [`HealthRecorder`]; the
//! [`HealthChecker`] checks every forwarder on an interval independently of traffic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::models::Forwarder;
use crate::proxy::transport::{parse_authority, ProxyTransport};

/// Sink for connection outcomes observed against a forwarder
pub trait HealthRecorder: Send + Sync {
    fn record(&self, forwarder: &Forwarder, success: bool);
}

/// Counts consecutive failures and disables a forwarder at its threshold
#[derive(Debug, Default, Clone, Copy)]
pub struct FailureRecorder;

impl HealthRecorder for FailureRecorder {
    fn record(&self, forwarder: &Forwarder, success: bool) {
        if success {
            if forwarder.enable() {
                info!(forwarder = %forwarder.address(), "Forwarder enabled");
            }
            return;
        }

        if forwarder.record_failure() {
            warn!(
                forwarder = %forwarder.address(),
                failures = forwarder.failures(),
                "Forwarder disabled after repeated failures"
            );
        } else {
            debug!(
                forwarder = %forwarder.address(),
                failures = forwarder.failures(),
                "Forwarder failure recorded"
            );
        }
    }
}

/// Health checker configuration
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Interval between health checks
    pub check_interval: Duration,
    /// Timeout for each check
    pub check_timeout: Duration,
    /// `host:port` reached through each forwarder
    pub check_target: String,
    /// Only check forwarders that are currently disabled
    pub disabled_only: bool,
    /// Concurrent checks
    pub workers: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(10),
            check_target: "www.msftconnecttest.com:80".to_string(),
            disabled_only: false,
            workers: 10,
        }
    }
}

/// Health checker for forwarders
pub struct HealthChecker {
    config: HealthCheckerConfig,
    forwarders: Vec<Arc<Forwarder>>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckerConfig, forwarders: Vec<Arc<Forwarder>>) -> Self {
        Self { config, forwarders }
    }

    /// Run the health checker (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health checker with {}s interval",
            self.config.check_interval.as_secs()
        );

        let mut check_interval = interval(self.config.check_interval);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    self.check_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Check the forwarders once, returning the healthy and unhealthy counts
    pub async fn check_all(&self) -> (usize, usize) {
        let targets: Vec<Arc<Forwarder>> = self
            .forwarders
            .iter()
            .filter(|f| !self.config.disabled_only || !f.enabled())
            .cloned()
            .collect();

        if targets.is_empty() {
            debug!("No forwarders to check");
            return (0, 0);
        }

        debug!("Checking health of {} forwarders", targets.len());

        let results = futures::stream::iter(targets)
            .map(|forwarder| async move { self.check_forwarder(&forwarder).await })
            .buffer_unordered(self.config.workers.max(1))
            .collect::<Vec<bool>>()
            .await;

        let healthy = results.iter().filter(|&&ok| ok).count();
        let unhealthy = results.len() - healthy;

        info!(
            "Health check complete: {} healthy, {} unhealthy",
            healthy, unhealthy
        );

        (healthy, unhealthy)
    }

    /// Check one forwarder and update its state
    #[instrument(skip(self, forwarder), fields(forwarder = %forwarder.address()))]
    pub async fn check_forwarder(&self, forwarder: &Forwarder) -> bool {
        let (host, port) = match parse_authority(&self.config.check_target, 80) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Invalid health check target: {}", e);
                return false;
            }
        };

        let started = Instant::now();
        let result = timeout(
            self.config.check_timeout,
            ProxyTransport::connect(forwarder, &host, port),
        )
        .await;

        match result {
            Ok(Ok(_conn)) => {
                let elapsed = started.elapsed();
                forwarder.set_latency(Some(elapsed));
                if forwarder.enable() {
                    info!(
                        latency_ms = elapsed.as_millis() as u64,
                        "Forwarder is healthy again"
                    );
                } else {
                    debug!(latency_ms = elapsed.as_millis() as u64, "Forwarder is healthy");
                }
                true
            }
            Ok(Err(e)) => {
                self.mark_unhealthy(forwarder, &format!("connect failed: {}", e));
                false
            }
            Err(_) => {
                self.mark_unhealthy(forwarder, "connect timed out");
                false
            }
        }
    }

    fn mark_unhealthy(&self, forwarder: &Forwarder, reason: &str) {
        forwarder.set_latency(None);
        if forwarder.disable() {
            warn!("Forwarder is unhealthy: {}", reason);
        } else {
            debug!("Forwarder is still unhealthy: {}", reason);
        }
    }
}
