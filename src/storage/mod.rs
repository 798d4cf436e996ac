// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded state database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `jobs`: job id → serialized `Job`
//! - `chain_events_status`: singleton key → serialized `ListenerStatus`
//! - `system_settings`: singleton key → serialized `Settings`
//!
//! Each store opens (and creates) its own table when constructed. redb
//! serializes write transactions, so a read-modify-write performed inside one
//! write transaction is atomic with respect to every other writer sharing the
//! same [`StateDatabase`].

use std::path::Path;

use redb::{Database, ReadTransaction, ReadableDatabase, TableDefinition, WriteTransaction};

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another holder owns the row lock; the caller did not wait for it.
    #[error("row is locked by another holder")]
    Locked,

    /// The lock expired and was taken over before the holder committed.
    #[error("row lock was lost before commit")]
    LeaseLost,
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// StateDatabase
// =============================================================================

/// Every table stores JSON rows keyed by a string.
pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Shared handle to the redb file holding jobs, listener cursor and settings.
pub struct StateDatabase {
    db: Database,
}

impl StateDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;
        Ok(Self { db })
    }

    pub(crate) fn begin_write(&self) -> StoreResult<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    pub(crate) fn begin_read(&self) -> StoreResult<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    /// Create a table if it does not exist yet.
    pub(crate) fn ensure_table(&self, table: JsonTable) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(table)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

// =============================================================================
// Pagination
// =============================================================================

/// Default page size when the caller does not ask for one.
pub const DEFAULT_LIMIT: usize = 1000;

/// Limit/offset window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    /// `None` means unlimited.
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ListOptions {
    /// Normalize raw request values.
    ///
    /// A limit of 0 selects [`DEFAULT_LIMIT`], a negative limit disables the
    /// limit (and the offset), a negative offset is treated as 0.
    pub fn parse(limit: i64, offset: i64) -> Self {
        if limit < 0 {
            return Self {
                limit: None,
                offset: 0,
            };
        }
        let limit = if limit == 0 {
            DEFAULT_LIMIT
        } else {
            limit as usize
        };
        Self {
            limit: Some(limit),
            offset: offset.max(0) as usize,
        }
    }

    /// Apply the window to an already ordered iterator.
    pub fn apply<T>(&self, items: impl Iterator<Item = T>) -> Vec<T> {
        let items = items.skip(self.offset);
        match self.limit {
            Some(limit) => items.take(limit).collect(),
            None => items.collect(),
        }
    }
}

impl Default for ListOptions {
    fn default() -> Self {
        Self::parse(0, 0)
    }
}

#[cfg(test)]
pub(crate) fn temp_db() -> (std::sync::Arc<StateDatabase>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = StateDatabase::open(&dir.path().join("test.redb")).unwrap();
    (std::sync::Arc::new(db), dir)
}
