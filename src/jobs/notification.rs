// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Job status notifications.
//!
//! When an executor sets `should_send_notification` and its job reaches a
//! terminal state, the pool creates a separate [`SEND_JOB_STATUS_JOB_TYPE`]
//! job whose attributes hold the finished job's [`JobResponse`]. Delivery is
//! therefore retried on its own schedule and a failing webhook never re-runs
//! the original work.
//!
//! [`JobResponse`]: super::JobResponse

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::error::ExecutorError;
use super::job::Job;
use super::pool::JobExecutor;

/// Reserved job type for status notifications.
pub const SEND_JOB_STATUS_JOB_TYPE: &str = "send_job_status";

/// Default timeout for a single webhook request.
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how job status notifications are delivered.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    webhook_url: Option<Url>,
    webhook_timeout: Duration,
    client: reqwest::Client,
}

impl NotificationConfig {
    /// Notifications disabled.
    pub fn disabled() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout: DEFAULT_WEBHOOK_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    /// POST job statuses to `url`.
    pub fn webhook(url: Url, timeout: Duration) -> Self {
        Self {
            webhook_url: Some(url),
            webhook_timeout: timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn should_send_job_status(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Deliver a job status payload. A no-op when no webhook is configured.
    pub async fn send_job_status(&self, content: &serde_json::Value) -> Result<(), ExecutorError> {
        let Some(url) = &self.webhook_url else {
            return Ok(());
        };

        let response = self
            .client
            .post(url.clone())
            .timeout(self.webhook_timeout)
            .json(content)
            .send()
            .await
            .map_err(|e| ExecutorError::failed(format!("error while sending webhook request: {e}")))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(ExecutorError::failed(format!(
                "webhook endpoint responded with an unexpected status code: {}",
                response.status().as_u16()
            )));
        }

        Ok(())
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Executor for [`SEND_JOB_STATUS_JOB_TYPE`] jobs.
pub struct SendJobStatusExecutor {
    config: NotificationConfig,
}

impl SendJobStatusExecutor {
    pub fn new(config: NotificationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl JobExecutor for SendJobStatusExecutor {
    async fn execute(&self, job: &mut Job) -> Result<(), ExecutorError> {
        if job.job_type != SEND_JOB_STATUS_JOB_TYPE {
            return Err(ExecutorError::InvalidJobType);
        }

        // Never notify about a notification
        job.should_send_notification = false;

        self.config.send_job_status(&job.attributes).await
    }
}
