// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! System-wide halt switches.
//!
//! The system is halted while an operator has enabled maintenance mode or
//! while a pause is in effect. The chain listener pauses the system when the
//! chain node becomes unreachable; the worker pool and the listener skip
//! their work while halted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::{JsonTable, StateDatabase, StoreResult};

const SYSTEM_SETTINGS: JsonTable = TableDefinition::new("system_settings");
const SETTINGS_KEY: &str = "settings";

/// Default length of a pause.
pub const DEFAULT_PAUSE_DURATION: Duration = Duration::from_secs(60);

/// Read-only view used by the worker pool and the listener.
pub trait SystemStatus: Send + Sync {
    /// True in maintenance mode or during a pause.
    fn is_halted(&self) -> StoreResult<bool>;

    /// Halt the system for the configured pause duration, starting now.
    fn pause(&self) -> StoreResult<()>;
}

/// Persisted system settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub maintenance_mode: bool,
    #[serde(default)]
    pub paused_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Settings {
    pub fn is_maintenance_mode(&self) -> bool {
        self.maintenance_mode
    }

    pub fn is_paused(&self, pause_duration: Duration) -> bool {
        self.is_paused_at(Utc::now(), pause_duration)
    }

    fn is_paused_at(&self, now: DateTime<Utc>, pause_duration: Duration) -> bool {
        let Some(since) = self.paused_since else {
            return false;
        };
        match chrono::Duration::from_std(pause_duration) {
            Ok(duration) => now < since + duration,
            Err(_) => true,
        }
    }
}

/// redb-backed settings singleton.
pub struct SystemService {
    db: Arc<StateDatabase>,
    pause_duration: Duration,
}

impl SystemService {
    pub fn new(db: Arc<StateDatabase>, pause_duration: Duration) -> StoreResult<Self> {
        db.ensure_table(SYSTEM_SETTINGS)?;
        Ok(Self { db, pause_duration })
    }

    /// Current settings; defaults when never saved.
    pub fn get_settings(&self) -> StoreResult<Settings> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SYSTEM_SETTINGS)?;
        match table.get(SETTINGS_KEY)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(Settings::default()),
        }
    }

    pub fn set_maintenance_mode(&self, enabled: bool) -> StoreResult<()> {
        self.modify(|settings, _| settings.maintenance_mode = enabled)?;
        info!(enabled, "Maintenance mode updated");
        Ok(())
    }

    /// Read-modify-write of the settings row in one write transaction.
    fn modify<F>(&self, f: F) -> StoreResult<Settings>
    where
        F: FnOnce(&mut Settings, DateTime<Utc>),
    {
        let now = Utc::now();
        let write_txn = self.db.begin_write()?;
        let settings = {
            let mut table = write_txn.open_table(SYSTEM_SETTINGS)?;
            let mut settings: Settings = match table.get(SETTINGS_KEY)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => Settings::default(),
            };
            f(&mut settings, now);
            settings.updated_at = Some(now);
            let json = serde_json::to_vec(&settings)?;
            table.insert(SETTINGS_KEY, json.as_slice())?;
            settings
        };
        write_txn.commit()?;
        Ok(settings)
    }
}

impl SystemStatus for SystemService {
    fn is_halted(&self) -> StoreResult<bool> {
        let settings = self.get_settings()?;
        Ok(settings.is_maintenance_mode() || settings.is_paused(self.pause_duration))
    }

    fn pause(&self) -> StoreResult<()> {
        self.modify(|settings, now| settings.paused_since = Some(now))?;
        info!(pause_secs = self.pause_duration.as_secs(), "System paused");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_db;

    #[test]
    fn fresh_system_is_running() {
        let (db, _dir) = temp_db();
        let system = SystemService::new(db, DEFAULT_PAUSE_DURATION).unwrap();
        assert_eq!(system.get_settings().unwrap(), Settings::default());
        assert!(!system.is_halted().unwrap());
    }

    #[test]
    fn maintenance_mode_halts_until_disabled() {
        let (db, _dir) = temp_db();
        let system = SystemService::new(db, DEFAULT_PAUSE_DURATION).unwrap();

        system.set_maintenance_mode(true).unwrap();
        assert!(system.is_halted().unwrap());
        assert!(system.get_settings().unwrap().updated_at.is_some());

        system.set_maintenance_mode(false).unwrap();
        assert!(!system.is_halted().unwrap());
    }

    #[test]
    fn pause_halts_for_pause_duration() {
        let (db, _dir) = temp_db();
        let system = SystemService::new(db, Duration::from_secs(60)).unwrap();

        system.pause().unwrap();
        assert!(system.is_halted().unwrap());

        let settings = system.get_settings().unwrap();
        let since = settings.paused_since.unwrap();
        let later = since + chrono::Duration::seconds(61);
        assert!(settings.is_paused_at(since, Duration::from_secs(60)));
        assert!(!settings.is_paused_at(later, Duration::from_secs(60)));
    }

    #[test]
    fn zero_pause_duration_never_halts() {
        let (db, _dir) = temp_db();
        let system = SystemService::new(db, Duration::ZERO).unwrap();
        system.pause().unwrap();
        assert!(!system.is_halted().unwrap());
    }

    #[test]
    fn concurrent_updates_keep_both_switches() {
        let (db, _dir) = temp_db();
        let system = Arc::new(SystemService::new(db, DEFAULT_PAUSE_DURATION).unwrap());

        let operator = {
            let system = system.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    system.set_maintenance_mode(i % 2 == 0).unwrap();
                }
            })
        };
        system.pause().unwrap();
        operator.join().unwrap();

        let settings = system.get_settings().unwrap();
        assert!(settings.paused_since.is_some());
        // Last toggle was i = 199
        assert!(!settings.maintenance_mode);
    }

    #[test]
    fn pause_keeps_maintenance_mode() {
        let (db, _dir) = temp_db();
        let system = SystemService::new(db, DEFAULT_PAUSE_DURATION).unwrap();

        system.set_maintenance_mode(true).unwrap();
        system.pause().unwrap();

        let settings = system.get_settings().unwrap();
        assert!(settings.maintenance_mode);
        assert!(settings.paused_since.is_some());
    }

    #[test]
    fn settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let db = Arc::new(StateDatabase::open(&path).unwrap());
            let system = SystemService::new(db, DEFAULT_PAUSE_DURATION).unwrap();
            system.set_maintenance_mode(true).unwrap();
        }
        let db = Arc::new(StateDatabase::open(&path).unwrap());
        let system = SystemService::new(db, DEFAULT_PAUSE_DURATION).unwrap();
        assert!(system.get_settings().unwrap().maintenance_mode);
    }
}
