// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::fmt::Display;

use uuid::Uuid;

use crate::storage::StoreError;

/// Error returned by a job executor.
///
/// Anything except [`ExecutorError::Permanent`] is retried until the job's
/// attempt budget is used up.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor was invoked for a job type it does not handle.
    #[error("invalid job type")]
    InvalidJobType,

    /// Retrying cannot help; the job fails immediately.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("{0}")]
    Failed(String),
}

impl ExecutorError {
    /// Tag an error as permanent.
    pub fn permanent(err: impl Display) -> Self {
        Self::Permanent(err.to_string())
    }

    pub fn failed(err: impl Display) -> Self {
        Self::Failed(err.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<StoreError> for ExecutorError {
    fn from(e: StoreError) -> Self {
        Self::Failed(e.to_string())
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Error surfaced to callers of synchronous job execution.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Another worker claimed this execution attempt first.
    #[error("job {0} was accepted by another worker")]
    NotAccepted(Uuid),

    #[error("no executor registered for job type {0}")]
    NoExecutor(String),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}
