// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Job persistence.
//!
//! The `jobs` table maps the job id to the JSON-serialized [`Job`]. Queries
//! that need ordering or filtering scan the table; the table only holds this
//! deployment's jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::Deserialize;
use uuid::Uuid;

use super::job::{Job, JobState};
use crate::storage::{JsonTable, ListOptions, StateDatabase, StoreError, StoreResult};

const JOBS: JsonTable = TableDefinition::new("jobs");

/// Persistence operations the worker pool relies on.
pub trait JobStore: Send + Sync {
    /// Jobs ordered newest first.
    fn jobs(&self, opts: ListOptions) -> StoreResult<Vec<Job>>;

    fn job(&self, id: Uuid) -> StoreResult<Job>;

    /// Insert a new job, keeping the timestamps it carries.
    fn insert_job(&self, job: &Job) -> StoreResult<()>;

    /// Replace the stored job and refresh `job.updated_at`.
    ///
    /// A stored `deleted_at` is kept, so a job deleted while it executes
    /// stays deleted.
    fn update_job(&self, job: &mut Job) -> StoreResult<()>;

    /// Claim the next execution attempt.
    ///
    /// Succeeds only if the stored `exec_count` and `updated_at` still match
    /// the values in `job`. On success the stored and in-memory job have
    /// `exec_count + 1`, state `Accepted` and a fresh `updated_at`, and `true`
    /// is returned. `false` means someone else got there first (or the job
    /// was deleted) and `job` is left untouched.
    fn increase_exec_count(&self, job: &mut Job) -> StoreResult<bool>;

    /// Jobs whose execution was interrupted or which are due for a retry.
    ///
    /// `Init`/`Accepted` jobs untouched for longer than `accepted_grace`,
    /// and `Error`/`NoAvailableWorkers` jobs untouched for longer than
    /// `reschedulable_grace`.
    fn schedulable_jobs(
        &self,
        accepted_grace: Duration,
        reschedulable_grace: Duration,
        opts: ListOptions,
    ) -> StoreResult<Vec<Job>>;

    /// Number of jobs per state.
    fn state_counts(&self) -> StoreResult<HashMap<JobState, usize>>;

    fn soft_delete_job(&self, id: Uuid) -> StoreResult<()>;
}

/// redb-backed [`JobStore`].
pub struct RedbJobStore {
    db: Arc<StateDatabase>,
}

impl RedbJobStore {
    pub fn new(db: Arc<StateDatabase>) -> StoreResult<Self> {
        db.ensure_table(JOBS)?;
        Ok(Self { db })
    }

    /// Every live (not soft-deleted) job, unordered.
    fn live_jobs(&self) -> StoreResult<Vec<Job>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(JOBS)?;
        let mut jobs = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let job: Job = serde_json::from_slice(value.value())?;
            if job.deleted_at.is_none() {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    fn write_job(&self, job: &Job) -> StoreResult<()> {
        let key = job.id.to_string();
        let json = serde_json::to_vec(job)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(JOBS)?;
            table.insert(key.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// Fields of a stored row an update must not overwrite.
#[derive(Deserialize)]
struct Tombstone {
    #[serde(default)]
    deleted_at: Option<DateTime<Utc>>,
}

/// Cut-off instant for a grace period.
fn cutoff(now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(grace)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

impl JobStore for RedbJobStore {
    fn jobs(&self, opts: ListOptions) -> StoreResult<Vec<Job>> {
        let mut jobs = self.live_jobs()?;
        newest_first(&mut jobs);
        Ok(opts.apply(jobs.into_iter()))
    }

    fn job(&self, id: Uuid) -> StoreResult<Job> {
        let key = id.to_string();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(JOBS)?;
        let job: Job = match table.get(key.as_str())? {
            Some(value) => serde_json::from_slice(value.value())?,
            None => return Err(StoreError::NotFound(format!("Job {id}"))),
        };
        if job.deleted_at.is_some() {
            return Err(StoreError::NotFound(format!("Job {id}")));
        }
        Ok(job)
    }

    fn insert_job(&self, job: &Job) -> StoreResult<()> {
        self.write_job(job)
    }

    fn update_job(&self, job: &mut Job) -> StoreResult<()> {
        job.updated_at = Utc::now();
        let key = job.id.to_string();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(JOBS)?;
            let stored: Option<Tombstone> = match table.get(key.as_str())? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };
            if let Some(deleted_at) = stored.and_then(|t| t.deleted_at) {
                job.deleted_at = Some(deleted_at);
            }
            let json = serde_json::to_vec(&*job)?;
            table.insert(key.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn increase_exec_count(&self, job: &mut Job) -> StoreResult<bool> {
        let key = job.id.to_string();
        let write_txn = self.db.begin_write()?;
        let claimed = {
            let mut table = write_txn.open_table(JOBS)?;

            let stored_bytes = match table.get(key.as_str())? {
                Some(value) => value.value().to_vec(),
                None => return Err(StoreError::NotFound(format!("Job {}", job.id))),
            };
            let mut stored: Job = serde_json::from_slice(&stored_bytes)?;

            if stored.deleted_at.is_some()
                || stored.exec_count != job.exec_count
                || stored.updated_at != job.updated_at
            {
                None
            } else {
                stored.exec_count += 1;
                stored.state = JobState::Accepted;
                stored.updated_at = Utc::now();
                let json = serde_json::to_vec(&stored)?;
                table.insert(key.as_str(), json.as_slice())?;
                Some(stored)
            }
        };

        let Some(stored) = claimed else {
            // Dropping the transaction aborts it
            return Ok(false);
        };
        write_txn.commit()?;

        job.exec_count = stored.exec_count;
        job.state = stored.state;
        job.updated_at = stored.updated_at;
        Ok(true)
    }

    fn schedulable_jobs(
        &self,
        accepted_grace: Duration,
        reschedulable_grace: Duration,
        opts: ListOptions,
    ) -> StoreResult<Vec<Job>> {
        let now = Utc::now();
        let accepted_cutoff = cutoff(now, accepted_grace);
        let reschedulable_cutoff = cutoff(now, reschedulable_grace);

        let mut jobs: Vec<Job> = self
            .live_jobs()?
            .into_iter()
            .filter(|job| match job.state {
                JobState::Init | JobState::Accepted => job.updated_at < accepted_cutoff,
                JobState::Error | JobState::NoAvailableWorkers => {
                    job.updated_at < reschedulable_cutoff
                }
                JobState::Complete | JobState::Failed => false,
            })
            .collect();
        newest_first(&mut jobs);
        Ok(opts.apply(jobs.into_iter()))
    }

    fn state_counts(&self) -> StoreResult<HashMap<JobState, usize>> {
        let mut counts = HashMap::new();
        for job in self.live_jobs()? {
            *counts.entry(job.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn soft_delete_job(&self, id: Uuid) -> StoreResult<()> {
        let key = id.to_string();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(JOBS)?;
            let mut job: Job = match table.get(key.as_str())? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(StoreError::NotFound(format!("Job {id}"))),
            };
            if job.deleted_at.is_some() {
                return Err(StoreError::NotFound(format!("Job {id}")));
            }
            let now = Utc::now();
            job.deleted_at = Some(now);
            job.updated_at = now;
            let json = serde_json::to_vec(&job)?;
            table.insert(key.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_db;

    fn temp_store() -> (RedbJobStore, tempfile::TempDir) {
        let (db, dir) = temp_db();
        (RedbJobStore::new(db).unwrap(), dir)
    }

    fn aged_job(state: JobState, age: chrono::Duration) -> Job {
        let mut job = Job::new("test", "");
        job.state = state;
        job.created_at = Utc::now() - age;
        job.updated_at = job.created_at;
        job
    }

    #[test]
    fn insert_and_get_job() {
        let (store, _dir) = temp_store();
        let job = Job::new("account_create", "0xtx");
        store.insert_job(&job).unwrap();

        let fetched = store.job(job.id).unwrap();
        assert_eq!(fetched.job_type, "account_create");
        assert_eq!(fetched.transaction_id, "0xtx");
        assert_eq!(fetched.updated_at, job.updated_at);
    }

    #[test]
    fn missing_job_is_not_found() {
        let (store, _dir) = temp_store();
        assert!(matches!(
            store.job(Uuid::new_v4()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn update_refreshes_updated_at() {
        let (store, _dir) = temp_store();
        let mut job = aged_job(JobState::Init, chrono::Duration::minutes(5));
        store.insert_job(&job).unwrap();
        let before = job.updated_at;

        job.result = "done".to_string();
        store.update_job(&mut job).unwrap();

        assert!(job.updated_at > before);
        let fetched = store.job(job.id).unwrap();
        assert_eq!(fetched.result, "done");
        assert_eq!(fetched.updated_at, job.updated_at);
    }

    #[test]
    fn increase_exec_count_claims_once() {
        let (store, _dir) = temp_store();
        let job = Job::new("test", "");
        store.insert_job(&job).unwrap();

        // Two workers holding the same snapshot of the job
        let mut first = job.clone();
        let mut second = job.clone();

        assert!(store.increase_exec_count(&mut first).unwrap());
        assert_eq!(first.exec_count, 1);
        assert_eq!(first.state, JobState::Accepted);

        assert!(!store.increase_exec_count(&mut second).unwrap());
        assert_eq!(second.exec_count, 0);
        assert_eq!(second.state, JobState::Init);
        assert_eq!(second.updated_at, job.updated_at);

        let stored = store.job(job.id).unwrap();
        assert_eq!(stored.exec_count, 1);
        assert_eq!(stored.updated_at, first.updated_at);
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let (store, _dir) = temp_store();
        let store = Arc::new(store);
        let job = Job::new("test", "");
        store.insert_job(&job).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let mut snapshot = job.clone();
                std::thread::spawn(move || store.increase_exec_count(&mut snapshot).unwrap())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|claimed| *claimed)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.job(job.id).unwrap().exec_count, 1);
    }

    #[test]
    fn schedulable_jobs_respect_grace_periods() {
        let (store, _dir) = temp_store();
        let accepted_grace = Duration::from_secs(180);
        let reschedulable_grace = Duration::from_secs(60);

        let stale_init = aged_job(JobState::Init, chrono::Duration::minutes(5));
        let fresh_init = aged_job(JobState::Init, chrono::Duration::seconds(10));
        let stale_accepted = aged_job(JobState::Accepted, chrono::Duration::minutes(4));
        let recent_error = aged_job(JobState::Error, chrono::Duration::minutes(2));
        let fresh_error = aged_job(JobState::Error, chrono::Duration::seconds(5));
        let no_workers = aged_job(JobState::NoAvailableWorkers, chrono::Duration::minutes(2));
        let old_failed = aged_job(JobState::Failed, chrono::Duration::days(3));
        let old_complete = aged_job(JobState::Complete, chrono::Duration::days(3));

        for job in [
            &stale_init,
            &fresh_init,
            &stale_accepted,
            &recent_error,
            &fresh_error,
            &no_workers,
            &old_failed,
            &old_complete,
        ] {
            store.insert_job(job).unwrap();
        }

        let found: Vec<Uuid> = store
            .schedulable_jobs(accepted_grace, reschedulable_grace, ListOptions::default())
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();

        assert_eq!(found.len(), 4);
        assert!(found.contains(&stale_init.id));
        assert!(found.contains(&stale_accepted.id));
        assert!(found.contains(&recent_error.id));
        assert!(found.contains(&no_workers.id));
    }

    #[test]
    fn list_is_newest_first_and_paginated() {
        let (store, _dir) = temp_store();
        let mut ids = Vec::new();
        for i in 0..5 {
            let job = aged_job(JobState::Init, chrono::Duration::seconds(50 - i));
            ids.push(job.id);
            store.insert_job(&job).unwrap();
        }

        let page = store.jobs(ListOptions::parse(2, 1)).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[3]);
        assert_eq!(page[1].id, ids[2]);
    }

    #[test]
    fn state_counts_group_by_state() {
        let (store, _dir) = temp_store();
        store.insert_job(&Job::new("a", "")).unwrap();
        store.insert_job(&Job::new("b", "")).unwrap();
        store
            .insert_job(&aged_job(JobState::Failed, chrono::Duration::zero()))
            .unwrap();

        let counts = store.state_counts().unwrap();
        assert_eq!(counts.get(&JobState::Init), Some(&2));
        assert_eq!(counts.get(&JobState::Failed), Some(&1));
        assert_eq!(counts.get(&JobState::Complete), None);
    }

    #[test]
    fn soft_deleted_jobs_are_hidden() {
        let (store, _dir) = temp_store();
        let job = aged_job(JobState::Init, chrono::Duration::hours(1));
        store.insert_job(&job).unwrap();

        store.soft_delete_job(job.id).unwrap();

        assert!(matches!(store.job(job.id), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.soft_delete_job(job.id),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.jobs(ListOptions::default()).unwrap().is_empty());
        assert!(store
            .schedulable_jobs(
                Duration::from_secs(1),
                Duration::from_secs(1),
                ListOptions::default()
            )
            .unwrap()
            .is_empty());
    }

    #[test]
    fn update_keeps_deletion() {
        let (store, _dir) = temp_store();
        let mut job = Job::new("test", "");
        store.insert_job(&job).unwrap();

        // In-memory copy taken before the delete still has no deleted_at
        store.soft_delete_job(job.id).unwrap();
        job.state = JobState::Complete;
        store.update_job(&mut job).unwrap();

        assert!(job.deleted_at.is_some());
        assert!(matches!(store.job(job.id), Err(StoreError::NotFound(_))));
        assert!(store.state_counts().unwrap().is_empty());
    }

    #[test]
    fn deleted_job_cannot_be_claimed() {
        let (store, _dir) = temp_store();
        let mut job = Job::new("test", "");
        store.insert_job(&job).unwrap();
        store.soft_delete_job(job.id).unwrap();

        assert!(!store.increase_exec_count(&mut job).unwrap());
        assert_eq!(job.exec_count, 0);
        assert_eq!(job.state, JobState::Init);
    }
}
