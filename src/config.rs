// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Environment variable names, defaults and the parsed [`Config`] loaded
//! once at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding `wallet-jobs.redb` | `/data` |
//! | `WORKER_COUNT` | Concurrent job workers | `1` |
//! | `WORKER_QUEUE_CAPACITY` | Bounded job queue size | `1000` |
//! | `MAX_JOB_ERROR_COUNT` | Attempts before a job is `FAILED` | `10` |
//! | `DB_JOB_POLL_INTERVAL_SECS` | Recovery poll interval | `30` |
//! | `ACCEPTED_GRACE_PERIOD_SECS` | Grace for `INIT`/`ACCEPTED` jobs | `180` |
//! | `RESCHEDULABLE_GRACE_PERIOD_SECS` | Grace for `ERROR`/`NO_AVAILABLE_WORKERS` jobs | `60` |
//! | `JOB_STATUS_WEBHOOK_URL` | Job status webhook | Disabled |
//! | `JOB_STATUS_WEBHOOK_TIMEOUT_SECS` | Webhook request timeout | `30` |
//! | `EVENTS_INTERVAL_SECS` | Chain listener tick interval | `10` |
//! | `EVENTS_MAX_BLOCKS` | Blocks processed per tick (>= 1) | `100` |
//! | `EVENTS_STARTING_HEIGHT` | First block to process (0 = head) | `0` |
//! | `EVENTS_LOCK_TIMEOUT_SECS` | Listener cursor lease lifetime | `60` |
//! | `CHAIN_EVENT_TYPES` | Comma-separated event types | None |
//! | `CHAIN_RPC_URL` | EVM JSON-RPC endpoint | Avalanche Fuji |
//! | `PAUSE_DURATION_SECS` | System pause after chain outage | `60` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::blockchain::DEFAULT_RPC_URL;
use crate::jobs::{NotificationConfig, WorkerPoolConfig};
use crate::listener::ListenerConfig;
use crate::logging::LogFormat;

/// Environment variable name for the data directory.
///
/// # Default
/// `/data`
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "/data";

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "wallet-jobs.redb";

pub const WORKER_COUNT_ENV: &str = "WORKER_COUNT";
pub const WORKER_QUEUE_CAPACITY_ENV: &str = "WORKER_QUEUE_CAPACITY";
pub const MAX_JOB_ERROR_COUNT_ENV: &str = "MAX_JOB_ERROR_COUNT";
pub const DB_JOB_POLL_INTERVAL_ENV: &str = "DB_JOB_POLL_INTERVAL_SECS";
pub const ACCEPTED_GRACE_PERIOD_ENV: &str = "ACCEPTED_GRACE_PERIOD_SECS";
pub const RESCHEDULABLE_GRACE_PERIOD_ENV: &str = "RESCHEDULABLE_GRACE_PERIOD_SECS";

/// Environment variable name for the job status webhook.
///
/// Notifications are disabled when unset or empty.
pub const JOB_STATUS_WEBHOOK_URL_ENV: &str = "JOB_STATUS_WEBHOOK_URL";
pub const JOB_STATUS_WEBHOOK_TIMEOUT_ENV: &str = "JOB_STATUS_WEBHOOK_TIMEOUT_SECS";

pub const EVENTS_INTERVAL_ENV: &str = "EVENTS_INTERVAL_SECS";
pub const EVENTS_MAX_BLOCKS_ENV: &str = "EVENTS_MAX_BLOCKS";
pub const EVENTS_STARTING_HEIGHT_ENV: &str = "EVENTS_STARTING_HEIGHT";
pub const EVENTS_LOCK_TIMEOUT_ENV: &str = "EVENTS_LOCK_TIMEOUT_SECS";

/// Environment variable name for the subscribed event types.
///
/// Comma separated, each `Name(types)` or `0xContract:Name(types)`.
pub const CHAIN_EVENT_TYPES_ENV: &str = "CHAIN_EVENT_TYPES";
pub const CHAIN_RPC_URL_ENV: &str = "CHAIN_RPC_URL";

pub const PAUSE_DURATION_ENV: &str = "PAUSE_DURATION_SECS";

/// Environment variable name for the log output format.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Fully parsed runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub pool: WorkerPoolConfig,
    pub webhook_url: Option<Url>,
    pub webhook_timeout: Duration,
    pub listener: ListenerConfig,
    pub event_types: Vec<String>,
    pub rpc_url: String,
    pub pause_duration: Duration,
    pub log_format: LogFormat,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using `lookup` to resolve variables. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let defaults = WorkerPoolConfig::default();
        let pool = WorkerPoolConfig {
            worker_count: parse_or(&get, WORKER_COUNT_ENV, defaults.worker_count)?,
            capacity: parse_or(&get, WORKER_QUEUE_CAPACITY_ENV, defaults.capacity)?,
            max_job_error_count: parse_or(&get, MAX_JOB_ERROR_COUNT_ENV, defaults.max_job_error_count)?,
            db_job_poll_interval: secs_or(&get, DB_JOB_POLL_INTERVAL_ENV, defaults.db_job_poll_interval)?,
            accepted_grace_period: secs_or(&get, ACCEPTED_GRACE_PERIOD_ENV, defaults.accepted_grace_period)?,
            reschedulable_grace_period: secs_or(
                &get,
                RESCHEDULABLE_GRACE_PERIOD_ENV,
                defaults.reschedulable_grace_period,
            )?,
        };
        if pool.worker_count == 0 {
            return Err(invalid(WORKER_COUNT_ENV, "0", "must be at least 1"));
        }
        if pool.capacity == 0 {
            return Err(invalid(WORKER_QUEUE_CAPACITY_ENV, "0", "must be at least 1"));
        }

        let webhook_url = get(JOB_STATUS_WEBHOOK_URL_ENV)
            .map(|raw| {
                Url::parse(&raw).map_err(|e| invalid(JOB_STATUS_WEBHOOK_URL_ENV, &raw, e))
            })
            .transpose()?;

        let defaults = ListenerConfig::default();
        let listener = ListenerConfig {
            interval: secs_or(&get, EVENTS_INTERVAL_ENV, defaults.interval)?,
            max_blocks: parse_or(&get, EVENTS_MAX_BLOCKS_ENV, defaults.max_blocks)?,
            starting_height: parse_or(&get, EVENTS_STARTING_HEIGHT_ENV, defaults.starting_height)?,
            lock_timeout: secs_or(&get, EVENTS_LOCK_TIMEOUT_ENV, defaults.lock_timeout)?,
        };
        if listener.max_blocks == 0 {
            return Err(invalid(EVENTS_MAX_BLOCKS_ENV, "0", "must be at least 1"));
        }
        if listener.interval.is_zero() {
            return Err(invalid(EVENTS_INTERVAL_ENV, "0", "must be at least 1"));
        }

        let event_types = get(CHAIN_EVENT_TYPES_ENV)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let log_format = match get(LOG_FORMAT_ENV) {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| invalid(LOG_FORMAT_ENV, &raw, e))?,
            None => LogFormat::default(),
        };

        Ok(Self {
            data_dir: get(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            pool,
            webhook_url,
            webhook_timeout: secs_or(
                &get,
                JOB_STATUS_WEBHOOK_TIMEOUT_ENV,
                crate::jobs::notification::DEFAULT_WEBHOOK_TIMEOUT,
            )?,
            listener,
            event_types,
            rpc_url: get(CHAIN_RPC_URL_ENV).unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            pause_duration: secs_or(
                &get,
                PAUSE_DURATION_ENV,
                crate::system::DEFAULT_PAUSE_DURATION,
            )?,
            log_format,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn notifications(&self) -> NotificationConfig {
        match &self.webhook_url {
            Some(url) => NotificationConfig::webhook(url.clone(), self.webhook_timeout),
            None => NotificationConfig::disabled(),
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw.parse().map_err(|e| invalid(var, &raw, e)),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| invalid(var, &raw, e)),
        None => Ok(default),
    }
}
