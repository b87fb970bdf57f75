//! Concurrent task execution through the proxy pool
//!
//! Each task walks an explicit state machine:
//! `Pending -> Attempting(proxy) -> Succeeded | Attempting(next) | Exhausted`.
//! A failed proxy joins the task's exclusion set so a retry always rotates
//! to a different endpoint.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::request::{
    check_request, send_through_tunnel, HttpResponse, OutboundRequest, RequestTarget,
};
use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::models::{HttpTask, ProxyEndpoint, TaskResult};
use crate::proxy::pool::ProxyPool;
use crate::proxy::transport::ProxyTransport;

enum TaskState {
    Pending,
    Attempting(ProxyEndpoint),
    Succeeded {
        proxy: ProxyEndpoint,
        response: HttpResponse,
    },
    Exhausted(String),
}

/// Bookkeeping carried across the attempts of one task
struct TaskRun<'a> {
    task: &'a HttpTask,
    excluded: HashSet<ProxyEndpoint>,
    attempts: u32,
    max_attempts: u32,
    last_proxy: Option<ProxyEndpoint>,
    started: StdInstant,
}

impl<'a> TaskRun<'a> {
    fn new(task: &'a HttpTask, default_max_retries: u32) -> Self {
        let retries = task.max_retries.unwrap_or(default_max_retries);
        Self {
            task,
            excluded: HashSet::new(),
            attempts: 0,
            max_attempts: retries.saturating_add(1),
            last_proxy: None,
            started: StdInstant::now(),
        }
    }

    fn succeeded(self, proxy: ProxyEndpoint, response: HttpResponse) -> TaskResult {
        TaskResult {
            task_id: self.task.task_id.clone(),
            proxy_used: Some(proxy),
            is_success: true,
            status_code: Some(response.status),
            response_data: Some(response.body),
            response_time: self.started.elapsed(),
            error_message: None,
            attempts: self.attempts,
        }
    }

    fn failed(self, error: impl ToString) -> TaskResult {
        TaskResult {
            task_id: self.task.task_id.clone(),
            proxy_used: self.last_proxy,
            is_success: false,
            status_code: None,
            response_data: None,
            response_time: self.started.elapsed(),
            error_message: Some(error.to_string()),
            attempts: self.attempts,
        }
    }
}

/// Runs batches of tasks through a shared pool
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    config: Arc<FleetConfig>,
    pool: Arc<ProxyPool>,
}

impl TaskExecutor {
    /// Create an executor over `pool`, rejecting an unusable config
    pub fn new(config: Arc<FleetConfig>, pool: Arc<ProxyPool>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, pool })
    }

    /// Run every task, returning results in input order
    ///
    /// Fails as a whole only when `tasks` is empty or the pool holds no
    /// Valid endpoint at start.
    pub async fn execute_tasks(&self, tasks: &[HttpTask]) -> Result<Vec<TaskResult>> {
        let (_cancel_tx, cancel) = watch::channel(false);
        self.execute_tasks_until(tasks, cancel).await
    }

    /// Like [`execute_tasks`](Self::execute_tasks), stopping admission once
    /// `cancel` turns `true`
    ///
    /// Tasks not yet admitted come back with zero attempts; tasks already
    /// running finish their current attempt but start no new one.
    pub async fn execute_tasks_until(
        &self,
        tasks: &[HttpTask],
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<TaskResult>> {
        if tasks.is_empty() {
            return Err(FleetError::InvalidConfig(
                "task list must not be empty".into(),
            ));
        }
        if !self.pool.has_valid() {
            return Err(FleetError::InvalidConfig(
                "proxy pool has no valid endpoints".into(),
            ));
        }

        info!(
            "Executing {} tasks with up to {} in flight",
            tasks.len(),
            self.config.max_concurrent_requests
        );

        let mut results: Vec<(usize, TaskResult)> = stream::iter(tasks.iter().enumerate())
            .map(|(i, task)| {
                let cancel = cancel.clone();
                async move {
                    let cancelled = *cancel.borrow();
                    if cancelled {
                        debug!("Task {} cancelled before admission", task.task_id);
                        return (i, TaskRun::new(task, 0).failed("cancelled before start"));
                    }
                    (i, self.run_task(task, &cancel).await)
                }
            })
            .buffer_unordered(self.config.max_concurrent_requests)
            .collect()
            .await;

        results.sort_by_key(|(i, _)| *i);
        let results: Vec<TaskResult> = results.into_iter().map(|(_, r)| r).collect();

        let succeeded = results.iter().filter(|r| r.is_success).count();
        info!(
            "Batch complete: {} succeeded, {} failed",
            succeeded,
            results.len() - succeeded
        );
        Ok(results)
    }

    #[instrument(skip(self, task, cancel), fields(task_id = %task.task_id))]
    async fn run_task(&self, task: &HttpTask, cancel: &watch::Receiver<bool>) -> TaskResult {
        let mut run = TaskRun::new(task, self.config.default_max_retries);

        let target = match RequestTarget::parse(&task.url) {
            Ok(target) => target,
            Err(e) => return run.failed(e),
        };
        if let Err(e) = check_request(&target, &task.headers) {
            return run.failed(e);
        }

        let mut state = TaskState::Pending;
        loop {
            state = match state {
                TaskState::Pending => match self.pool.select_next(&run.excluded) {
                    Ok(proxy) => TaskState::Attempting(proxy),
                    Err(e) => TaskState::Exhausted(e.to_string()),
                },
                TaskState::Attempting(proxy) => {
                    run.attempts += 1;
                    run.last_proxy = Some(proxy.clone());
                    debug!("Attempt {} through {}", run.attempts, proxy);

                    match self.attempt(task, &target, &proxy).await {
                        Ok(response) => {
                            self.pool.record_task_outcome(&proxy, true);
                            TaskState::Succeeded { proxy, response }
                        }
                        Err(e) if !e.is_retryable() => {
                            warn!(
                                category = e.category(),
                                "Attempt {} through {} failed without blaming the proxy: {}",
                                run.attempts,
                                proxy,
                                e
                            );
                            TaskState::Exhausted(e.to_string())
                        }
                        Err(e) => {
                            warn!(
                                category = e.category(),
                                "Attempt {} through {} failed: {}",
                                run.attempts,
                                proxy,
                                e
                            );
                            self.pool.record_task_outcome(&proxy, false);
                            run.excluded.insert(proxy);
                            self.next_after_failure(&run, e, cancel)
                        }
                    }
                }
                TaskState::Succeeded { proxy, response } => {
                    return run.succeeded(proxy, response);
                }
                TaskState::Exhausted(e) => {
                    return run.failed(e);
                }
            };
        }
    }

    /// Decide where a failed attempt leads
    fn next_after_failure(
        &self,
        run: &TaskRun<'_>,
        error: FleetError,
        cancel: &watch::Receiver<bool>,
    ) -> TaskState {
        if run.attempts >= run.max_attempts {
            return TaskState::Exhausted(error.to_string());
        }
        if *cancel.borrow() {
            return TaskState::Exhausted(format!(
                "batch cancelled after {} attempt(s): {}",
                run.attempts, error
            ));
        }

        match self.pool.select_next(&run.excluded) {
            Ok(next) => TaskState::Attempting(next),
            Err(_) => TaskState::Exhausted(
                FleetError::PoolExhausted {
                    attempts: run.attempts,
                    last_error: Some(error.to_string()),
                }
                .to_string(),
            ),
        }
    }

    /// One request through one proxy under the task's deadline
    async fn attempt(
        &self,
        task: &HttpTask,
        target: &RequestTarget,
        proxy: &ProxyEndpoint,
    ) -> Result<HttpResponse> {
        let timeout: Duration = task.timeout.unwrap_or(self.config.default_timeout);
        let deadline = Instant::now() + timeout;

        let tunnel = ProxyTransport::connect(proxy, &target.host, target.port, deadline).await?;

        send_through_tunnel(
            tunnel,
            target,
            OutboundRequest {
                method: task.method.into(),
                headers: &task.headers,
                body: task.body.clone(),
                user_agent: &self.config.user_agent,
            },
            deadline,
        )
        .await
    }
}
