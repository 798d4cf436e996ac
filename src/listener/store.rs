// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Listener cursor persistence with an exclusive lease.
//!
//! The cursor lives in a single `ListenerStatus` row. A tick holds a lease on
//! that row for its whole duration so that two listener instances sharing the
//! database never process the same block range concurrently. Acquisition
//! never waits: if the lease is held and unexpired the tick is skipped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{JsonTable, StateDatabase, StoreError, StoreResult};

const CHAIN_EVENTS_STATUS: JsonTable = TableDefinition::new("chain_events_status");
const STATUS_KEY: &str = "status";

/// Exclusive hold on the status row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Persisted listener cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerStatus {
    /// Highest block fully processed; 0 until bootstrapped
    pub latest_height: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl ListenerStatus {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            latest_height: 0,
            created_at: now,
            updated_at: now,
            lease: None,
        }
    }
}

/// redb-backed cursor store.
pub struct ListenerStore {
    db: Arc<StateDatabase>,
}

impl ListenerStore {
    pub fn new(db: Arc<StateDatabase>) -> StoreResult<Self> {
        db.ensure_table(CHAIN_EVENTS_STATUS)?;
        Ok(Self { db })
    }

    /// Current status, created on first access.
    pub fn status(&self) -> StoreResult<ListenerStatus> {
        let write_txn = self.db.begin_write()?;
        let status = {
            let mut table = write_txn.open_table(CHAIN_EVENTS_STATUS)?;
            let existing = table
                .get(STATUS_KEY)?
                .map(|value| serde_json::from_slice::<ListenerStatus>(value.value()))
                .transpose()?;
            match existing {
                Some(status) => status,
                None => {
                    let status = ListenerStatus::new();
                    let json = serde_json::to_vec(&status)?;
                    table.insert(STATUS_KEY, json.as_slice())?;
                    status
                }
            }
        };
        write_txn.commit()?;
        Ok(status)
    }

    /// Run `f` while holding the lease on the status row.
    ///
    /// Fails with [`StoreError::Locked`] without waiting if another holder's
    /// lease is still valid. When `f` succeeds its returned status is
    /// committed (the height never decreases) and the lease is released; when
    /// it fails only the lease is released and the cursor stays untouched.
    pub async fn run_exclusive<F, Fut, E>(
        &self,
        holder: Uuid,
        lease_ttl: Duration,
        f: F,
    ) -> Result<ListenerStatus, E>
    where
        F: FnOnce(ListenerStatus) -> Fut,
        Fut: Future<Output = Result<ListenerStatus, E>>,
        E: From<StoreError>,
    {
        let status = self.acquire(holder, lease_ttl)?;

        match f(status).await {
            Ok(updated) => Ok(self.commit(holder, updated)?),
            Err(e) => {
                if let Err(release_err) = self.release(holder) {
                    tracing::warn!(error = %release_err, "Could not release listener lease");
                }
                Err(e)
            }
        }
    }

    fn acquire(&self, holder: Uuid, lease_ttl: Duration) -> StoreResult<ListenerStatus> {
        let ttl = chrono::Duration::from_std(lease_ttl).unwrap_or(chrono::Duration::MAX);
        self.modify(|status, now| {
            if let Some(lease) = &status.lease {
                if lease.holder != holder && lease.expires_at > now {
                    return Err(StoreError::Locked);
                }
            }
            status.lease = Some(Lease {
                holder,
                expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            });
            Ok(())
        })
    }

    fn commit(&self, holder: Uuid, updated: ListenerStatus) -> StoreResult<ListenerStatus> {
        self.modify(|status, now| {
            ensure_holder(status, holder)?;
            status.latest_height = status.latest_height.max(updated.latest_height);
            status.updated_at = now;
            status.lease = None;
            Ok(())
        })
    }

    fn release(&self, holder: Uuid) -> StoreResult<ListenerStatus> {
        self.modify(|status, _| {
            ensure_holder(status, holder)?;
            status.lease = None;
            Ok(())
        })
    }

    /// Read-modify-write of the status row in one write transaction.
    fn modify<F>(&self, f: F) -> StoreResult<ListenerStatus>
    where
        F: FnOnce(&mut ListenerStatus, DateTime<Utc>) -> StoreResult<()>,
    {
        let now = Utc::now();
        let write_txn = self.db.begin_write()?;
        let status = {
            let mut table = write_txn.open_table(CHAIN_EVENTS_STATUS)?;
            let mut status = match table.get(STATUS_KEY)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => ListenerStatus::new(),
            };
            // Dropping the transaction on error aborts it
            f(&mut status, now)?;
            let json = serde_json::to_vec(&status)?;
            table.insert(STATUS_KEY, json.as_slice())?;
            status
        };
        write_txn.commit()?;
        Ok(status)
    }
}

fn ensure_holder(status: &ListenerStatus, holder: Uuid) -> StoreResult<()> {
    match &status.lease {
        Some(lease) if lease.holder == holder => Ok(()),
        _ => Err(StoreError::LeaseLost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_db;

    const TTL: Duration = Duration::from_secs(60);

    fn temp_store() -> (Arc<ListenerStore>, tempfile::TempDir) {
        let (db, dir) = temp_db();
        (Arc::new(ListenerStore::new(db).unwrap()), dir)
    }

    #[test]
    fn status_is_created_once() {
        let (store, _dir) = temp_store();
        let first = store.status().unwrap();
        let second = store.status().unwrap();
        assert_eq!(first.latest_height, 0);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn successful_run_commits_and_releases() {
        let (store, _dir) = temp_store();
        let holder = Uuid::new_v4();

        let committed = store
            .run_exclusive(holder, TTL, |mut status| async move {
                assert!(status.lease.is_some());
                status.latest_height = 100;
                Ok::<_, StoreError>(status)
            })
            .await
            .unwrap();

        assert_eq!(committed.latest_height, 100);
        let stored = store.status().unwrap();
        assert_eq!(stored.latest_height, 100);
        assert!(stored.lease.is_none());
    }

    #[tokio::test]
    async fn failed_run_keeps_cursor_and_releases() {
        let (store, _dir) = temp_store();
        let holder = Uuid::new_v4();

        let err = store
            .run_exclusive(holder, TTL, |mut status| async move {
                status.latest_height = 500;
                Err::<ListenerStatus, _>(StoreError::NotFound(format!(
                    "block {}",
                    status.latest_height
                )))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref what) if what == "block 500"));

        // The height set inside the failed run is not persisted
        let stored = store.status().unwrap();
        assert_eq!(stored.latest_height, 0);
        assert!(stored.lease.is_none());
    }

    #[tokio::test]
    async fn held_lease_rejects_other_holders() {
        let (store, _dir) = temp_store();
        let inner_store = store.clone();

        store
            .run_exclusive(Uuid::new_v4(), TTL, |status| async move {
                let other = inner_store
                    .run_exclusive(Uuid::new_v4(), TTL, |s| async move { Ok::<_, StoreError>(s) })
                    .await;
                assert!(matches!(other, Err(StoreError::Locked)));
                Ok::<_, StoreError>(status)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let (store, _dir) = temp_store();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        // A holder that crashed mid-tick leaves an expired lease behind
        store.acquire(stale, Duration::ZERO).unwrap();

        store
            .run_exclusive(fresh, TTL, |mut status| async move {
                status.latest_height = 7;
                Ok::<_, StoreError>(status)
            })
            .await
            .unwrap();
        assert_eq!(store.status().unwrap().latest_height, 7);

        // The crashed holder cannot commit after the takeover
        let mut late = store.status().unwrap();
        late.latest_height = 999;
        assert!(matches!(store.commit(stale, late), Err(StoreError::LeaseLost)));
        assert_eq!(store.status().unwrap().latest_height, 7);
    }

    #[tokio::test]
    async fn height_never_decreases() {
        let (store, _dir) = temp_store();
        let holder = Uuid::new_v4();

        for height in [50, 10] {
            store
                .run_exclusive(holder, TTL, |mut status| async move {
                    status.latest_height = height;
                    Ok::<_, StoreError>(status)
                })
                .await
                .unwrap();
        }

        assert_eq!(store.status().unwrap().latest_height, 50);
    }
}
