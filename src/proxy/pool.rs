//! Session proxy pool and health tracker
//!
//! All mutations go through one mutex and never await while holding it, so
//! concurrent validations and task outcomes are applied one at a time.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{FleetError, Result};
use crate::models::{HealthRecord, ProxyEndpoint, ProxyHealth, ProxyState, ValidationResult};

/// Counts of endpoints per state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub valid: usize,
    pub failed: usize,
    pub untested: usize,
}

#[derive(Debug)]
struct Entry {
    endpoint: ProxyEndpoint,
    health: ProxyHealth,
    /// Selection sequence number of the last use, 0 if never selected
    last_used: u64,
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: Vec<Entry>,
    index: HashMap<ProxyEndpoint, usize>,
    use_seq: u64,
}

impl PoolInner {
    fn entry_mut(&mut self, endpoint: &ProxyEndpoint) -> Option<&mut Entry> {
        let idx = *self.index.get(endpoint)?;
        self.entries.get_mut(idx)
    }

    fn insert(&mut self, endpoint: ProxyEndpoint, health: ProxyHealth) -> &mut Entry {
        let idx = match self.index.get(&endpoint) {
            Some(&idx) => idx,
            None => {
                let idx = self.entries.len();
                self.index.insert(endpoint.clone(), idx);
                self.entries.push(Entry {
                    endpoint,
                    health,
                    last_used: 0,
                });
                idx
            }
        };
        &mut self.entries[idx]
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.endpoint.clone(), i))
            .collect();
    }
}

/// Working set of endpoints and their health for one session
#[derive(Debug)]
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
    failure_threshold: u32,
}

impl ProxyPool {
    /// `failure_threshold`: a Valid endpoint turns Failed once its
    /// consecutive task failures exceed this value
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            failure_threshold,
        }
    }

    /// Add an Untested endpoint; returns `false` if it was already present
    pub fn add(&self, endpoint: ProxyEndpoint) -> bool {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&endpoint) {
            return false;
        }
        inner.insert(endpoint, ProxyHealth::default());
        true
    }

    /// Add many endpoints, merging duplicates; returns how many were new
    pub fn load_candidates<I>(&self, endpoints: I) -> usize
    where
        I: IntoIterator<Item = ProxyEndpoint>,
    {
        let mut inner = self.inner.lock();
        let mut added = 0;
        for endpoint in endpoints {
            if !inner.index.contains_key(&endpoint) {
                inner.insert(endpoint, ProxyHealth::default());
                added += 1;
            }
        }
        debug!("Loaded {} new candidates ({} total)", added, inner.entries.len());
        added
    }

    /// Apply a validation outcome, inserting the endpoint if unknown
    pub fn record_validation(&self, endpoint: &ProxyEndpoint, result: &ValidationResult) {
        let mut inner = self.inner.lock();
        let entry = inner.insert(endpoint.clone(), ProxyHealth::default());
        let health = &mut entry.health;

        health.last_checked = Some(Utc::now());

        if result.is_valid {
            health.state = ProxyState::Valid;
            health.consecutive_failures = 0;
            if result.ip_info.is_some() {
                health.ip_info = result.ip_info.clone();
            }
            return;
        }

        // A failed handshake always demotes, whatever the threshold
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.state = ProxyState::Failed;
    }

    /// Apply the outcome of a task attempt
    ///
    /// Only ever demotes: success resets the failure count of a Valid
    /// endpoint but never promotes an Untested or Failed one.
    pub fn record_task_outcome(&self, endpoint: &ProxyEndpoint, success: bool) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entry_mut(endpoint) else {
            return;
        };
        let health = &mut entry.health;

        if success {
            if health.state == ProxyState::Valid {
                health.consecutive_failures = 0;
            }
            return;
        }

        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        if health.state == ProxyState::Valid && health.consecutive_failures > self.failure_threshold {
            health.state = ProxyState::Failed;
            warn!(
                "Proxy {} marked failed after {} consecutive failures",
                entry.endpoint, health.consecutive_failures
            );
        }
    }

    /// Pick the least recently used Valid endpoint not in `excluding`
    ///
    /// Ties go to the fewest consecutive failures, then to insertion order.
    pub fn select_next(&self, excluding: &HashSet<ProxyEndpoint>) -> Result<ProxyEndpoint> {
        let mut inner = self.inner.lock();

        let chosen = inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.health.state.is_usable() && !excluding.contains(&e.endpoint))
            .min_by_key(|(i, e)| (e.last_used, e.health.consecutive_failures, *i))
            .map(|(i, _)| i);

        let Some(idx) = chosen else {
            return Err(FleetError::PoolExhausted {
                attempts: 0,
                last_error: None,
            });
        };

        inner.use_seq += 1;
        let seq = inner.use_seq;
        let entry = &mut inner.entries[idx];
        entry.last_used = seq;
        Ok(entry.endpoint.clone())
    }

    pub fn health(&self, endpoint: &ProxyEndpoint) -> Option<ProxyHealth> {
        let inner = self.inner.lock();
        let idx = *inner.index.get(endpoint)?;
        Some(inner.entries[idx].health.clone())
    }

    /// Every pooled endpoint, in insertion order
    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| e.endpoint.clone())
            .collect()
    }

    /// Endpoints currently in the Valid state
    pub fn valid_endpoints(&self) -> Vec<ProxyEndpoint> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.health.state.is_usable())
            .map(|e| e.endpoint.clone())
            .collect()
    }

    pub fn has_valid(&self) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|e| e.health.state.is_usable())
    }

    /// Drop Failed endpoints; returns how many were removed
    pub fn remove_failed(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.health.state != ProxyState::Failed);
        let removed = before - inner.entries.len();
        if removed > 0 {
            inner.reindex();
        }
        removed
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let mut stats = PoolStats {
            total: inner.entries.len(),
            ..Default::default()
        };
        for entry in &inner.entries {
            match entry.health.state {
                ProxyState::Valid => stats.valid += 1,
                ProxyState::Failed => stats.failed += 1,
                ProxyState::Untested => stats.untested += 1,
            }
        }
        stats
    }

    /// Snapshot of every endpoint's health, for an external store
    pub fn export_health(&self) -> Vec<HealthRecord> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| HealthRecord {
                endpoint: e.endpoint.clone(),
                health: e.health.clone(),
            })
            .collect()
    }

    /// Restore health from a previous snapshot, inserting unknown endpoints
    pub fn import_health<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = HealthRecord>,
    {
        let mut inner = self.inner.lock();
        let mut count = 0;
        for record in records {
            let entry = inner.insert(record.endpoint, ProxyHealth::default());
            entry.health = record.health;
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
