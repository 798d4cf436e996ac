// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Worker Pool
//!
//! Bounded pool of tokio tasks executing persisted jobs.
//!
//! ## Dispatch paths
//!
//! 1. **Live**: [`WorkerPool::schedule`] tries a non-blocking enqueue. When the
//!    queue is full the job is marked `NoAvailableWorkers` and persisted
//!    instead of blocking the caller.
//! 2. **Recovery**: a background poller periodically loads jobs whose
//!    execution was interrupted (`Init`/`Accepted` past the accepted grace
//!    period) or which are due for a retry (`Error`/`NoAvailableWorkers` past
//!    the reschedulable grace period) and enqueues them, waiting for capacity.
//!
//! The same job may end up in the queue twice through both paths. Each
//! attempt starts with a conditional exec-count increment in the store; only
//! the copy whose snapshot still matches the stored row runs.
//!
//! ## Shutdown
//!
//! [`WorkerPool::stop`] cancels the poller, closes the queue and waits until
//! the workers have drained every job already buffered.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{ExecutorError, JobError};
use super::job::{Job, JobState};
use super::notification::{NotificationConfig, SendJobStatusExecutor, SEND_JOB_STATUS_JOB_TYPE};
use super::store::JobStore;
use crate::storage::{ListOptions, StoreResult};
use crate::system::SystemStatus;

/// Default number of jobs buffered in memory.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default number of attempts before a failing job is given up.
pub const DEFAULT_MAX_JOB_ERROR_COUNT: u32 = 10;

/// Default interval between recovery passes.
pub const DEFAULT_DB_JOB_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default age after which an `Init`/`Accepted` job counts as abandoned.
pub const DEFAULT_ACCEPTED_GRACE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Default age after which an `Error`/`NoAvailableWorkers` job is retried.
pub const DEFAULT_RESCHEDULABLE_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Executes jobs of one registered type.
///
/// The executor may set `result`, `transaction_id` and
/// `should_send_notification` on the job. Executions are at-least-once, so
/// executors must tolerate running again for the same job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &mut Job) -> Result<(), ExecutorError>;
}

/// Pool sizing and recovery timing.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Size of the in-memory job queue
    pub capacity: usize,
    /// Number of concurrent workers
    pub worker_count: usize,
    /// A job failing more often than this ends in `Failed`
    pub max_job_error_count: u32,
    pub db_job_poll_interval: Duration,
    pub accepted_grace_period: Duration,
    pub reschedulable_grace_period: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            worker_count: 1,
            max_job_error_count: DEFAULT_MAX_JOB_ERROR_COUNT,
            db_job_poll_interval: DEFAULT_DB_JOB_POLL_INTERVAL,
            accepted_grace_period: DEFAULT_ACCEPTED_GRACE_PERIOD,
            reschedulable_grace_period: DEFAULT_RESCHEDULABLE_GRACE_PERIOD,
        }
    }
}

/// Job counts per state plus pool sizing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolStatus {
    pub jobs_init: usize,
    pub jobs_not_accepted: usize,
    pub jobs_accepted: usize,
    pub jobs_errored: usize,
    pub jobs_failed: usize,
    pub jobs_completed: usize,
    #[serde(rename = "poolCapacity")]
    pub capacity: usize,
    pub worker_count: usize,
    pub queue_size: usize,
}

/// Builder for [`WorkerPool`].
pub struct WorkerPoolBuilder {
    store: Arc<dyn JobStore>,
    config: WorkerPoolConfig,
    notifications: NotificationConfig,
    system: Option<Arc<dyn SystemStatus>>,
}

impl WorkerPoolBuilder {
    pub fn notifications(mut self, notifications: NotificationConfig) -> Self {
        self.notifications = notifications;
        self
    }

    /// Defer scheduling while the system is halted.
    pub fn system_status(mut self, system: Arc<dyn SystemStatus>) -> Self {
        self.system = Some(system);
        self
    }

    pub fn build(self) -> WorkerPool {
        let mut config = self.config;
        config.capacity = config.capacity.max(1);
        config.worker_count = config.worker_count.max(1);
        let (sender, receiver) = mpsc::channel(config.capacity);

        let pool = WorkerPool {
            inner: Arc::new(PoolInner {
                store: self.store,
                config,
                executors: RwLock::new(HashMap::new()),
                sender: Mutex::new(Some(sender)),
                receiver: tokio::sync::Mutex::new(receiver),
                notifications: self.notifications.clone(),
                system: self.system,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
            }),
        };

        pool.register_executor(
            SEND_JOB_STATUS_JOB_TYPE,
            Arc::new(SendJobStatusExecutor::new(self.notifications)),
        );

        pool
    }
}

/// Bounded pool of workers plus the recovery poller.
///
/// Cheap to clone; all clones share the same queue and workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    store: Arc<dyn JobStore>,
    config: WorkerPoolConfig,
    executors: RwLock<HashMap<String, Arc<dyn JobExecutor>>>,
    /// Taken on stop, which closes the queue
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    notifications: NotificationConfig,
    system: Option<Arc<dyn SystemStatus>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn builder(store: Arc<dyn JobStore>, config: WorkerPoolConfig) -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            store,
            config,
            notifications: NotificationConfig::disabled(),
            system: None,
        }
    }

    /// Register the executor for `job_type`, replacing any previous one.
    pub fn register_executor(&self, job_type: impl Into<String>, executor: Arc<dyn JobExecutor>) {
        if let Ok(mut executors) = self.inner.executors.write() {
            executors.insert(job_type.into(), executor);
        }
    }

    /// Spawn the workers and the recovery poller.
    ///
    /// Calling it again has no effect. Must run inside a tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            workers = self.inner.config.worker_count,
            capacity = self.inner.config.capacity,
            "Worker pool starting"
        );

        for worker_id in 0..self.inner.config.worker_count {
            let pool = self.clone();
            self.inner.tracker.spawn(pool.run_worker(worker_id));
        }

        let pool = self.clone();
        self.inner.tracker.spawn(pool.run_recovery_poller());
    }

    /// Stop accepting jobs and wait for the workers to drain the queue.
    pub async fn stop(&self) {
        info!("Worker pool shutting down");
        self.inner.shutdown.cancel();
        if let Ok(mut sender) = self.inner.sender.lock() {
            sender.take();
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Worker pool stopped");
    }

    /// Insert a new job in state `Init`.
    pub fn create_job(&self, job_type: &str, transaction_id: &str) -> StoreResult<Job> {
        let job = Job::new(job_type, transaction_id);
        self.inner.store.insert_job(&job)?;
        Ok(job)
    }

    /// Insert a new job in state `Init` carrying executor attributes.
    pub fn create_job_with_attributes(
        &self,
        job_type: &str,
        transaction_id: &str,
        attributes: serde_json::Value,
    ) -> StoreResult<Job> {
        let mut job = Job::new(job_type, transaction_id);
        job.attributes = attributes;
        self.inner.store.insert_job(&job)?;
        Ok(job)
    }

    /// Queue a job for execution without blocking.
    ///
    /// If the queue is full (or the pool is stopped) the job is marked
    /// `NoAvailableWorkers` and persisted; the recovery poller retries it
    /// later. While the system is halted nothing happens and the job waits
    /// for the recovery poller.
    pub fn schedule(&self, job: &mut Job) -> StoreResult<()> {
        if self.is_halted() {
            debug!(job_id = %job.id, "System halted, leaving job to the recovery poller");
            return Ok(());
        }

        if !self.try_enqueue(job.clone()) {
            job.state = JobState::NoAvailableWorkers;
            self.inner.store.update_job(job)?;
        }

        Ok(())
    }

    /// Execute a job on the caller's task and surface the executor error.
    ///
    /// Used by synchronous request paths. The job goes through the same
    /// accept/finalize protocol as queued jobs.
    pub async fn run_sync(&self, job: &mut Job) -> Result<(), JobError> {
        self.execute_job(job).await
    }

    pub fn job(&self, id: Uuid) -> StoreResult<Job> {
        self.inner.store.job(id)
    }

    pub fn jobs(&self, opts: ListOptions) -> StoreResult<Vec<Job>> {
        self.inner.store.jobs(opts)
    }

    pub fn status(&self) -> StoreResult<WorkerPoolStatus> {
        let counts = self.inner.store.state_counts()?;
        let count = |state| counts.get(&state).copied().unwrap_or(0);

        Ok(WorkerPoolStatus {
            jobs_init: count(JobState::Init),
            jobs_not_accepted: count(JobState::NoAvailableWorkers),
            jobs_accepted: count(JobState::Accepted),
            jobs_errored: count(JobState::Error),
            jobs_failed: count(JobState::Failed),
            jobs_completed: count(JobState::Complete),
            capacity: self.inner.config.capacity,
            worker_count: self.inner.config.worker_count,
            queue_size: self.queue_size(),
        })
    }

    /// Jobs currently buffered in the queue.
    pub fn queue_size(&self) -> usize {
        match self.inner.sender.lock() {
            Ok(sender) => sender
                .as_ref()
                .map(|s| s.max_capacity() - s.capacity())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    // =========================================================================
    // Queue
    // =========================================================================

    fn try_enqueue(&self, job: Job) -> bool {
        match self.inner.sender.lock() {
            Ok(sender) => match sender.as_ref() {
                Some(sender) => sender.try_send(job).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Wait for queue capacity. Returns `false` once the pool is stopping.
    async fn enqueue_blocking(&self, job: Job) -> bool {
        let sender = match self.inner.sender.lock() {
            Ok(sender) => sender.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return false;
        };

        tokio::select! {
            sent = sender.send(job) => sent.is_ok(),
            _ = self.inner.shutdown.cancelled() => false,
        }
    }

    fn is_halted(&self) -> bool {
        let Some(system) = &self.inner.system else {
            return false;
        };
        match system.is_halted() {
            Ok(halted) => halted,
            Err(e) => {
                warn!(error = %e, "Could not read system status");
                false
            }
        }
    }

    fn executor(&self, job_type: &str) -> Option<Arc<dyn JobExecutor>> {
        self.inner
            .executors
            .read()
            .ok()
            .and_then(|executors| executors.get(job_type).cloned())
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    async fn run_worker(self, worker_id: usize) {
        debug!(worker_id, "Job worker starting");
        loop {
            let next = {
                let mut receiver = self.inner.receiver.lock().await;
                receiver.recv().await
            };
            let Some(mut job) = next else {
                break;
            };
            // Errors are recorded on the job and logged by execute_job
            let _ = self.execute_job(&mut job).await;
        }
        debug!(worker_id, "Job worker stopped");
    }

    async fn run_recovery_poller(self) {
        let interval = self.inner.config.db_job_poll_interval;
        let mut rest = Duration::ZERO;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(rest) => {},
                _ = self.inner.shutdown.cancelled() => break,
            }

            if self.is_halted() {
                rest = interval;
                continue;
            }

            let begin = Instant::now();

            let jobs = match self.inner.store.schedulable_jobs(
                self.inner.config.accepted_grace_period,
                self.inner.config.reschedulable_grace_period,
                ListOptions::default(),
            ) {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(error = %e, "Could not fetch schedulable jobs from DB");
                    rest = interval;
                    continue;
                }
            };

            if !jobs.is_empty() {
                debug!(count = jobs.len(), "Rescheduling jobs from DB");
            }

            for job in jobs {
                if !self.enqueue_blocking(job).await {
                    break;
                }
            }

            // Sleep only the remainder so slow queries don't stretch the cycle
            rest = interval.saturating_sub(begin.elapsed());
        }

        debug!("Recovery poller stopped");
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn execute_job(&self, job: &mut Job) -> Result<(), JobError> {
        match self.inner.store.increase_exec_count(job) {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %job.id, job_type = %job.job_type, "Failed to accept job");
                return Err(JobError::NotAccepted(job.id));
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to increase job exec_count");
                return Err(e.into());
            }
        }

        let Some(executor) = self.executor(&job.job_type) else {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                "Could not process job, no registered executor for type"
            );
            job.state = JobState::NoAvailableWorkers;
            self.persist(job);
            return Err(JobError::NoExecutor(job.job_type.clone()));
        };

        let result = AssertUnwindSafe(executor.execute(job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ExecutorError::failed(format!(
                    "executor panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match &result {
            Ok(()) => {
                job.state = JobState::Complete;
                job.error.clear();
            }
            Err(err) => {
                job.state = if job.exec_count > self.inner.config.max_job_error_count
                    || err.is_permanent()
                {
                    JobState::Failed
                } else {
                    JobState::Error
                };
                job.record_error(err.to_string());
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    exec_count = job.exec_count,
                    state = %job.state,
                    error = %err,
                    "Job execution resulted with error"
                );
            }
        }

        self.persist(job);

        if job.state.is_terminal()
            && job.deleted_at.is_none()
            && job.should_send_notification
            && self.inner.notifications.should_send_job_status()
        {
            if let Err(e) = self.schedule_job_status_notification(job) {
                warn!(
                    job_id = %job.id,
                    error = %e,
                    "Could not schedule a status update notification for job"
                );
            }
        }

        result.map_err(JobError::from)
    }

    /// Store write failures leave the last persisted state in place; the
    /// recovery poller picks the job up again.
    fn persist(&self, job: &mut Job) {
        if let Err(e) = self.inner.store.update_job(job) {
            warn!(job_id = %job.id, error = %e, "Could not update DB entry for job");
        }
    }

    fn schedule_job_status_notification(&self, parent: &Job) -> StoreResult<()> {
        let attributes = serde_json::to_value(parent.to_response())?;
        let mut job = self.create_job_with_attributes(SEND_JOB_STATUS_JOB_TYPE, "", attributes)?;
        self.schedule(&mut job)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
