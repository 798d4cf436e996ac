// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted job record and its state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Job lifecycle state.
///
/// `Init → Accepted → {Complete | Error | Failed | NoAvailableWorkers}`.
/// `Error` and `NoAvailableWorkers` are picked up again by the recovery
/// poller; `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created, not yet dispatched
    Init,
    /// Claimed by a worker, in progress
    Accepted,
    /// Queue was full or no executor was registered for the type
    NoAvailableWorkers,
    /// Last attempt failed, will be retried
    Error,
    /// Finished successfully
    Complete,
    /// Gave up: permanent error or too many attempts
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Init,
        JobState::Accepted,
        JobState::NoAvailableWorkers,
        JobState::Error,
        JobState::Complete,
        JobState::Failed,
    ];

    /// Stored representation (`INIT`, `ACCEPTED`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Init => "INIT",
            JobState::Accepted => "ACCEPTED",
            JobState::NoAvailableWorkers => "NO_AVAILABLE_WORKERS",
            JobState::Error => "ERROR",
            JobState::Complete => "COMPLETE",
            JobState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::Init
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of asynchronous, retryable, persisted work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Executor registry key
    #[serde(rename = "type")]
    pub job_type: String,
    pub state: JobState,
    /// Latest error message, empty after a successful attempt
    #[serde(default)]
    pub error: String,
    /// Every error message ever recorded, oldest first
    #[serde(default)]
    pub errors: Vec<String>,
    /// Executor-defined payload
    #[serde(default)]
    pub result: String,
    /// Correlates the job with an on-chain transaction
    #[serde(default)]
    pub transaction_id: String,
    /// Number of accepted execution attempts
    #[serde(default)]
    pub exec_count: u32,
    /// Executor-defined structured input
    #[serde(default)]
    pub attributes: serde_json::Value,
    /// Set by an executor to request a status notification. Never persisted.
    #[serde(skip)]
    pub should_send_notification: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a fresh job in state `Init`.
    pub fn new(job_type: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            state: JobState::Init,
            error: String::new(),
            errors: Vec::new(),
            result: String::new(),
            transaction_id: transaction_id.into(),
            exec_count: 0,
            attributes: serde_json::Value::Null,
            should_send_notification: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Serialize `attrs` into the job's attributes.
    pub fn set_attributes<T: Serialize>(&mut self, attrs: &T) -> Result<(), serde_json::Error> {
        self.attributes = serde_json::to_value(attrs)?;
        Ok(())
    }

    /// Decode the job's attributes.
    pub fn attributes_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.attributes.clone())
    }

    /// Record a failed attempt.
    pub(crate) fn record_error(&mut self, message: String) {
        self.errors.push(message.clone());
        self.error = message;
    }

    /// Public JSON representation (status endpoints and webhooks).
    pub fn to_response(&self) -> JobResponse {
        JobResponse {
            job_id: self.id,
            job_type: self.job_type.clone(),
            state: self.state,
            error: self.error.clone(),
            errors: self.errors.clone(),
            result: self.result.clone(),
            transaction_id: self.transaction_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Job as seen by API clients and webhook receivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub state: JobState,
    pub error: String,
    pub errors: Vec<String>,
    pub result: String,
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
