// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bridge from chain events to jobs.
//!
//! Every dispatched event becomes a persisted `chain_event` job, so event
//! processing inherits the pool's retries, recovery and status webhooks.
//! Events may be delivered more than once; the job records the transaction
//! hash so downstream consumers can deduplicate.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::blockchain::ChainEvent;
use crate::jobs::{ExecutorError, Job, JobExecutor, WorkerPool};
use crate::listener::EventHandler;

/// Job type of jobs created from chain events.
pub const CHAIN_EVENT_JOB_TYPE: &str = "chain_event";

/// Turns chain events into scheduled jobs.
pub struct ChainEventJobHandler {
    pool: WorkerPool,
}

impl ChainEventJobHandler {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventHandler for ChainEventJobHandler {
    async fn handle(&self, event: ChainEvent) {
        let attributes = match serde_json::to_value(&event) {
            Ok(attributes) => attributes,
            Err(e) => {
                warn!(error = %e, "Could not encode chain event");
                return;
            }
        };

        let mut job = match self.pool.create_job_with_attributes(
            CHAIN_EVENT_JOB_TYPE,
            &event.transaction_id,
            attributes,
        ) {
            Ok(job) => job,
            Err(e) => {
                warn!(
                    transaction_id = %event.transaction_id,
                    error = %e,
                    "Could not create job for chain event"
                );
                return;
            }
        };

        if let Err(e) = self.pool.schedule(&mut job) {
            warn!(job_id = %job.id, error = %e, "Could not schedule chain event job");
        }
    }
}

/// Executes `chain_event` jobs.
#[derive(Default)]
pub struct ChainEventExecutor;

#[async_trait]
impl JobExecutor for ChainEventExecutor {
    async fn execute(&self, job: &mut Job) -> Result<(), ExecutorError> {
        if job.job_type != CHAIN_EVENT_JOB_TYPE {
            return Err(ExecutorError::InvalidJobType);
        }

        // Undecodable attributes never become decodable
        let event: ChainEvent = job.attributes_as().map_err(ExecutorError::permanent)?;

        debug!(
            job_id = %job.id,
            event_type = %event.event_type,
            block_height = event.block_height,
            "Processing chain event"
        );

        job.transaction_id = event.transaction_id.clone();
        job.result = event.transaction_id;
        job.should_send_notification = true;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobState, JobStore, RedbJobStore, WorkerPoolConfig};
    use crate::storage::{temp_db, ListOptions};
    use std::sync::Arc;

    fn event() -> ChainEvent {
        ChainEvent {
            event_type: "Transfer(address,address,uint256)".to_string(),
            block_height: 77,
            transaction_id: format!("0x{:064x}", 77),
            log_index: 1,
            payload: serde_json::json!({"data": "0x01"}),
        }
    }

    #[tokio::test]
    async fn handler_creates_and_schedules_job() {
        let (db, _dir) = temp_db();
        let store = Arc::new(RedbJobStore::new(db).unwrap());
        let pool = WorkerPool::builder(store.clone(), WorkerPoolConfig::default()).build();
        let handler = ChainEventJobHandler::new(pool.clone());

        handler.handle(event()).await;

        let jobs = store.jobs(ListOptions::default()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, CHAIN_EVENT_JOB_TYPE);
        assert_eq!(jobs[0].transaction_id, event().transaction_id);
        assert_eq!(jobs[0].attributes_as::<ChainEvent>().unwrap(), event());
        assert_eq!(pool.queue_size(), 1);
    }

    #[tokio::test]
    async fn executor_records_transaction_and_requests_notification() {
        let mut job = Job::new(CHAIN_EVENT_JOB_TYPE, "");
        job.set_attributes(&event()).unwrap();

        ChainEventExecutor.execute(&mut job).await.unwrap();

        assert_eq!(job.transaction_id, event().transaction_id);
        assert_eq!(job.result, event().transaction_id);
        assert!(job.should_send_notification);
    }

    #[tokio::test]
    async fn undecodable_event_is_permanent() {
        let mut job = Job::new(CHAIN_EVENT_JOB_TYPE, "");
        job.attributes = serde_json::json!({"unexpected": true});

        let err = ChainEventExecutor.execute(&mut job).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn executor_rejects_other_types() {
        let mut job = Job::new("account_create", "");
        let err = ChainEventExecutor.execute(&mut job).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidJobType));
    }

    #[tokio::test]
    async fn chain_event_job_completes_on_pool() {
        let (db, _dir) = temp_db();
        let store = Arc::new(RedbJobStore::new(db).unwrap());
        let pool = WorkerPool::builder(store.clone(), WorkerPoolConfig::default()).build();
        pool.register_executor(CHAIN_EVENT_JOB_TYPE, Arc::new(ChainEventExecutor));

        let mut job = pool
            .create_job_with_attributes(
                CHAIN_EVENT_JOB_TYPE,
                "",
                serde_json::to_value(event()).unwrap(),
            )
            .unwrap();
        pool.run_sync(&mut job).await.unwrap();

        let stored = store.job(job.id).unwrap();
        assert_eq!(stored.state, JobState::Complete);
        assert_eq!(stored.result, event().transaction_id);
    }
}
