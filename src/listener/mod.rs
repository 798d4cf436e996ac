// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Chain Listener
//!
//! Background task that advances a persisted block cursor and hands every
//! matching chain event to the registered handlers.
//!
//! ## Tick
//!
//! 1. Skip when the system is halted (maintenance or pause)
//! 2. Take the cursor lease (never waits, a held lease skips the tick)
//! 3. Fetch the head height; if it moved, fetch events of every configured
//!    type in `[cursor + 1, min(head, cursor + max_blocks)]`
//! 4. Dispatch the events and commit the new cursor
//!
//! A crash between dispatch and commit re-processes the range on the next
//! tick, so handlers see events at least once.
//!
//! ## Bootstrap
//!
//! The first tick of a process initializes the cursor: a never-used cursor
//! starts at the current head, and a configured starting height moves it to
//! `starting_height - 1` when it lies behind that. A fresh cursor fetches
//! nothing on that tick; a resumed one advances right away.
//!
//! ## Degradation
//!
//! When the chain node is unreachable the listener pauses the whole system
//! instead of retrying locally. Other errors are logged and retried on the
//! next tick.

pub mod dispatcher;
pub mod store;

pub use dispatcher::{EventDispatcher, EventHandler};
pub use store::{Lease, ListenerStatus, ListenerStore};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blockchain::{ChainClient, ChainClientError};
use crate::storage::{StoreError, StoreResult};
use crate::system::SystemStatus;

/// Current list of event types to subscribe to.
pub type EventTypeSource = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Listener timing and window settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Tick interval (non-zero)
    pub interval: Duration,
    /// Maximum number of blocks processed per tick (at least 1)
    pub max_blocks: u64,
    /// First block to process; 0 starts at the head
    pub starting_height: u64,
    /// Lifetime of the cursor lease
    pub lock_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_blocks: 100,
            starting_height: 0,
            lock_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainClientError),
}

pub struct ChainListener {
    client: Arc<dyn ChainClient>,
    store: Arc<ListenerStore>,
    dispatcher: Arc<EventDispatcher>,
    event_types: EventTypeSource,
    system: Option<Arc<dyn SystemStatus>>,
    config: ListenerConfig,
    /// Lease holder identity of this instance
    holder: Uuid,
    initialized: AtomicBool,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChainListener {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<ListenerStore>,
        dispatcher: Arc<EventDispatcher>,
        event_types: EventTypeSource,
        config: ListenerConfig,
    ) -> Self {
        Self {
            client,
            store,
            dispatcher,
            event_types,
            system: None,
            config: ListenerConfig {
                interval: config.interval.max(Duration::from_millis(1)),
                max_blocks: config.max_blocks.max(1),
                ..config
            },
            holder: Uuid::new_v4(),
            initialized: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Skip ticks while halted and pause the system when the chain is down.
    pub fn with_system_status(mut self, system: Arc<dyn SystemStatus>) -> Self {
        self.system = Some(system);
        self
    }

    /// Persisted cursor.
    pub fn status(&self) -> StoreResult<ListenerStatus> {
        self.store.status()
    }

    /// Spawn the tick loop. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut handle) = self.handle.lock() else {
            return;
        };
        if handle.is_some() {
            return;
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            max_blocks = self.config.max_blocks,
            starting_height = self.config.starting_height,
            "Chain listener starting"
        );

        let listener = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(listener.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => listener.run_tick().await,
                    _ = listener.shutdown.cancelled() => break,
                }
            }

            info!("Chain listener stopped");
        }));
    }

    /// Prevent further ticks and wait for an in-flight tick to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Chain listener task ended abnormally");
            }
        }
    }

    async fn run_tick(&self) {
        match self.tick().await {
            Ok(Some(status)) => debug!(height = status.latest_height, "Chain listener tick done"),
            Ok(None) => debug!("System halted, skipping chain listener tick"),
            Err(ListenerError::Store(StoreError::Locked)) => {
                debug!("Listener cursor is held by another instance, skipping tick")
            }
            Err(ListenerError::Chain(e)) if e.is_unavailable() => {
                warn!(error = %e, "Chain node unavailable, pausing system");
                if let Some(system) = &self.system {
                    if let Err(e) = system.pause() {
                        warn!(error = %e, "Could not pause system");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Chain listener tick failed"),
        }
    }

    /// One listener cycle. `None` when skipped because the system is halted.
    pub(crate) async fn tick(&self) -> Result<Option<ListenerStatus>, ListenerError> {
        if let Some(system) = &self.system {
            if system.is_halted()? {
                return Ok(None);
            }
        }

        let bootstrap = !self.initialized.load(Ordering::SeqCst);

        let status = self
            .store
            .run_exclusive(self.holder, self.config.lock_timeout, |status| async move {
                if bootstrap {
                    self.bootstrap(status).await
                } else {
                    self.advance(status).await
                }
            })
            .await?;

        if bootstrap {
            self.initialized.store(true, Ordering::SeqCst);
            info!(height = status.latest_height, "Chain listener cursor initialized");
        }

        Ok(Some(status))
    }

    async fn bootstrap(&self, status: ListenerStatus) -> Result<ListenerStatus, ListenerError> {
        let fresh = status.latest_height == 0;
        let status = self.initialize(status).await?;
        if fresh {
            return Ok(status);
        }
        self.advance(status).await
    }

    async fn initialize(&self, mut status: ListenerStatus) -> Result<ListenerStatus, ListenerError> {
        if status.latest_height == 0 {
            status.latest_height = self.client.latest_block_height().await?;
        }

        let starting = self.config.starting_height;
        if starting > 0 && status.latest_height < starting - 1 {
            status.latest_height = starting - 1;
        }

        Ok(status)
    }

    async fn advance(&self, mut status: ListenerStatus) -> Result<ListenerStatus, ListenerError> {
        let head = self.client.latest_block_height().await?;
        let cursor = status.latest_height;
        if head <= cursor {
            return Ok(status);
        }

        let start = cursor + 1;
        let end = head.min(cursor.saturating_add(self.config.max_blocks));

        let mut events = Vec::new();
        for event_type in (self.event_types)() {
            events.extend(
                self.client
                    .events_in_range(&event_type, start, end)
                    .await?,
            );
        }

        if !events.is_empty() {
            debug!(count = events.len(), start, end, "Dispatching chain events");
        }
        for event in events {
            self.dispatcher.trigger(event);
        }

        status.latest_height = end;
        Ok(status)
    }
}
