// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fan-out of chain events to registered handlers.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::blockchain::ChainEvent;

/// Receives every dispatched chain event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: ChainEvent);
}

/// Registry of event handlers.
///
/// Each handler runs on its own task; a panicking handler is logged and
/// does not affect the listener or the other handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(handler);
        }
    }

    /// Hand `event` to every handler without waiting for them.
    pub fn trigger(&self, event: ChainEvent) -> Vec<JoinHandle<()>> {
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return Vec::new(),
        };

        handlers
            .into_iter()
            .map(|handler| {
                let event = event.clone();
                tokio::spawn(async move {
                    let event_type = event.event_type.clone();
                    let block_height = event.block_height;
                    if AssertUnwindSafe(handler.handle(event))
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        tracing::warn!(
                            event_type = %event_type,
                            block_height,
                            "Chain event handler panicked"
                        );
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<ChainEvent>);

    #[async_trait]
    impl EventHandler for Forward {
        async fn handle(&self, event: ChainEvent) {
            let _ = self.0.send(event);
        }
    }

    struct Explode;

    #[async_trait]
    impl EventHandler for Explode {
        async fn handle(&self, _event: ChainEvent) {
            panic!("handler bug");
        }
    }

    fn event(height: u64) -> ChainEvent {
        ChainEvent {
            event_type: "Transfer(address,address,uint256)".to_string(),
            block_height: height,
            transaction_id: format!("0x{height:064x}"),
            log_index: 0,
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn every_handler_receives_the_event() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(Arc::new(Forward(tx.clone())));
        dispatcher.register(Arc::new(Forward(tx)));

        for handle in dispatcher.trigger(event(5)) {
            handle.await.unwrap();
        }

        assert_eq!(rx.recv().await.unwrap().block_height, 5);
        assert_eq!(rx.recv().await.unwrap().block_height, 5);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(Arc::new(Explode));
        dispatcher.register(Arc::new(Forward(tx)));

        for handle in dispatcher.trigger(event(9)) {
            // The panic boundary completes the task normally
            handle.await.unwrap();
        }

        assert_eq!(rx.recv().await.unwrap().block_height, 9);
    }

    #[tokio::test]
    async fn no_handlers_is_fine() {
        let dispatcher = EventDispatcher::new();
        assert!(dispatcher.trigger(event(1)).is_empty());
    }
}
