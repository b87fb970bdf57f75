//! Fleet facade: ingest, validate, execute and snapshot
//!
//! [`ProxyFleet`] wires one pool, one validator and one executor around a
//! shared read-only [`FleetConfig`].

pub mod executor;
pub mod request;

pub use executor::TaskExecutor;
pub use request::{HttpResponse, RequestTarget};

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::config::FleetConfig;
use crate::error::Result;
use crate::models::{
    parse_proxy_list, HealthRecord, HttpTask, ProxyEndpoint, ProxyProtocol, TaskResult,
    ValidationResult,
};
use crate::proxy::health::HealthMonitor;
use crate::proxy::pool::{PoolStats, ProxyPool};
use crate::proxy::validator::Validator;

/// One proxy fleet session
pub struct ProxyFleet {
    config: Arc<FleetConfig>,
    pool: Arc<ProxyPool>,
    validator: Validator,
    executor: TaskExecutor,
}

impl ProxyFleet {
    /// Build a session, rejecting invalid tunables
    pub fn new(config: FleetConfig) -> Result<Self> {
        let config = Arc::new(config);
        let pool = Arc::new(ProxyPool::new(config.failure_threshold));
        let executor = TaskExecutor::new(config.clone(), pool.clone())?;
        let validator = Validator::new(config.clone())?;

        Ok(Self {
            config,
            pool,
            validator,
            executor,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Add candidates as Untested, merging duplicates
    pub fn load_candidates<I>(&self, endpoints: I) -> usize
    where
        I: IntoIterator<Item = ProxyEndpoint>,
    {
        self.pool.load_candidates(endpoints)
    }

    /// Parse a newline separated list and add its endpoints
    pub fn load_proxy_list(&self, text: &str, default_protocol: ProxyProtocol) -> usize {
        self.load_candidates(parse_proxy_list(text, default_protocol))
    }

    /// Validate a batch and record every outcome in the pool
    ///
    /// Each result is recorded under the identity actually probed, so a
    /// protocol hint yields its own pool entry.
    pub async fn validate_all(
        &self,
        endpoints: &[ProxyEndpoint],
        hints: Option<&[ProxyProtocol]>,
    ) -> Result<Vec<ValidationResult>> {
        let results = self.validator.validate_all(endpoints, hints).await?;
        for result in &results {
            self.pool.record_validation(&result.endpoint, result);
        }
        Ok(results)
    }

    /// Validate everything currently pooled
    pub async fn validate_pool(&self) -> Result<Vec<ValidationResult>> {
        let endpoints = self.pool.endpoints();
        let results = self.validate_all(&endpoints, None).await?;
        info!("Pool after validation: {:?}", self.pool.stats());
        Ok(results)
    }

    pub async fn execute_tasks(&self, tasks: &[HttpTask]) -> Result<Vec<TaskResult>> {
        self.executor.execute_tasks(tasks).await
    }

    pub async fn execute_tasks_until(
        &self,
        tasks: &[HttpTask],
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<TaskResult>> {
        self.executor.execute_tasks_until(tasks, cancel).await
    }

    /// Endpoints that passed their last validation
    pub fn valid_endpoints(&self) -> Vec<ProxyEndpoint> {
        self.pool.valid_endpoints()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn export_health(&self) -> Vec<HealthRecord> {
        self.pool.export_health()
    }

    pub fn import_health<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = HealthRecord>,
    {
        self.pool.import_health(records)
    }

    /// Background re-validation over this session's pool
    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            self.validator.clone(),
            self.pool.clone(),
            self.config.revalidate_interval,
            self.config.validation_concurrency,
        )
    }
}
