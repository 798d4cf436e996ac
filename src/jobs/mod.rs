// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable at-least-once job execution.
//!
//! Every unit of asynchronous work (account creation, withdrawals, webhook
//! deliveries) is a persisted [`Job`]. A [`WorkerPool`] executes jobs through
//! executors registered per job type and recovers jobs whose execution was
//! interrupted by a crash, a full queue or a retryable error.

pub mod error;
pub mod job;
pub mod notification;
pub mod pool;
pub mod store;

pub use error::{ExecutorError, JobError};
pub use job::{Job, JobResponse, JobState};
pub use notification::{NotificationConfig, SendJobStatusExecutor, SEND_JOB_STATUS_JOB_TYPE};
pub use pool::{JobExecutor, WorkerPool, WorkerPoolBuilder, WorkerPoolConfig, WorkerPoolStatus};
pub use store::{JobStore, RedbJobStore};
