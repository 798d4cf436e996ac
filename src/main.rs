// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use relational_wallet_jobs::blockchain::{EventFilter, EvmChainClient};
use relational_wallet_jobs::config::Config;
use relational_wallet_jobs::deposits::{ChainEventExecutor, ChainEventJobHandler, CHAIN_EVENT_JOB_TYPE};
use relational_wallet_jobs::jobs::{RedbJobStore, WorkerPool};
use relational_wallet_jobs::listener::{ChainListener, EventDispatcher, ListenerStore};
use relational_wallet_jobs::logging;
use relational_wallet_jobs::storage::StateDatabase;
use relational_wallet_jobs::system::SystemService;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    logging::init(config.log_format);

    let db_path = config.db_path();
    info!(path = %db_path.display(), "Opening state database");
    let db = Arc::new(StateDatabase::open(&db_path)?);
    let system = Arc::new(SystemService::new(db.clone(), config.pause_duration)?);

    // Job execution
    let pool = WorkerPool::builder(Arc::new(RedbJobStore::new(db.clone())?), config.pool.clone())
        .notifications(config.notifications())
        .system_status(system.clone())
        .build();
    pool.register_executor(CHAIN_EVENT_JOB_TYPE, Arc::new(ChainEventExecutor));
    pool.start();

    // Chain events
    let dispatcher = Arc::new(EventDispatcher::new());
    dispatcher.register(Arc::new(ChainEventJobHandler::new(pool.clone())));

    let listener = if config.event_types.is_empty() {
        info!("No chain event types configured, chain listener disabled");
        None
    } else {
        for event_type in &config.event_types {
            event_type.parse::<EventFilter>()?;
        }
        let event_types = config.event_types.clone();
        let listener = Arc::new(
            ChainListener::new(
                Arc::new(EvmChainClient::new(&config.rpc_url)?),
                Arc::new(ListenerStore::new(db.clone())?),
                dispatcher,
                Arc::new(move || event_types.clone()),
                config.listener.clone(),
            )
            .with_system_status(system),
        );
        listener.start();
        Some(listener)
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Some(listener) = &listener {
        listener.stop().await;
    }
    pool.stop().await;

    Ok(())
}
