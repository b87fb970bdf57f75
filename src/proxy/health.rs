//! Periodic re-validation of pooled proxies
//!
//! Re-runs the handshake probe against every endpoint on a fixed interval
//! so Valid endpoints that stopped working are demoted and Failed ones can
//! recover.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::proxy::pool::ProxyPool;
use crate::proxy::validator::Validator;

/// Outcome counts of one re-validation round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoundSummary {
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Background re-validation loop over a pool
pub struct HealthMonitor {
    validator: Validator,
    pool: Arc<ProxyPool>,
    interval: Duration,
    concurrency: usize,
}

impl HealthMonitor {
    pub fn new(
        validator: Validator,
        pool: Arc<ProxyPool>,
        interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            validator,
            pool,
            interval,
            concurrency: concurrency.max(1),
        }
    }

    /// Run until `shutdown` flips to `true` (call in a spawned task)
    ///
    /// The first round starts immediately.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health monitor with {}s interval",
            self.interval.as_secs()
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Spawn the loop, returning its shutdown handle and task
    pub fn spawn(self) -> (HealthMonitorHandle, JoinHandle<()>) {
        let (handle, shutdown) = HealthMonitorHandle::new();
        let task = tokio::spawn(async move { self.run(shutdown).await });
        (handle, task)
    }

    /// Validate every pooled endpoint once and record the outcomes
    pub async fn check_all(&self) -> RoundSummary {
        // Failed endpoints are included so they can recover
        let endpoints = self.pool.endpoints();
        debug!("Re-validating {} proxies", endpoints.len());

        let results = futures::stream::iter(endpoints)
            .map(|endpoint| async move {
                let result = self.validator.validate(&endpoint, None).await;
                self.pool.record_validation(&endpoint, &result);
                result.is_valid
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<bool>>()
            .await;

        let healthy = results.iter().filter(|&&v| v).count();
        let summary = RoundSummary {
            healthy,
            unhealthy: results.len() - healthy,
        };

        info!(
            "Health check complete: {} healthy, {} unhealthy",
            summary.healthy, summary.unhealthy
        );
        summary
    }
}

/// Shutdown switch for a running [`HealthMonitor`]
pub struct HealthMonitorHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl HealthMonitorHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::models::{ProxyProtocol, ProxyState, ValidationResult};
    use crate::test_support::{refused_endpoint, spawn_fake_proxy, FakeProxyKind};

    fn validator() -> Validator {
        Validator::new(Arc::new(FleetConfig {
            health_check_timeout: Duration::from_millis(500),
            ..Default::default()
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_check_all_records_outcomes() {
        let good = spawn_fake_proxy(FakeProxyKind::HttpConnect).await;
        let bad = refused_endpoint(ProxyProtocol::Socks5).await;

        let pool = Arc::new(ProxyPool::new(0));
        pool.add(good.endpoint.clone());
        // Previously valid, now unreachable
        pool.record_validation(
            &bad,
            &ValidationResult::valid(bad.clone(), Duration::ZERO, None),
        );

        let monitor = HealthMonitor::new(validator(), pool.clone(), Duration::from_secs(60), 4);
        let summary = monitor.check_all().await;

        assert_eq!(summary, RoundSummary { healthy: 1, unhealthy: 1 });
        assert_eq!(pool.health(&good.endpoint).unwrap().state, ProxyState::Valid);
        assert_eq!(pool.health(&bad).unwrap().state, ProxyState::Failed);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let good = spawn_fake_proxy(FakeProxyKind::Socks4).await;
        let pool = Arc::new(ProxyPool::new(0));
        pool.add(good.endpoint.clone());

        let monitor = HealthMonitor::new(validator(), pool.clone(), Duration::from_millis(50), 2);
        let (handle, task) = monitor.spawn();

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert_eq!(pool.health(&good.endpoint).unwrap().state, ProxyState::Valid);
        assert!(good.stats.tunnels() >= 1);
    }
}
