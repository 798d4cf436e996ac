// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Blockchain types and constants.

use serde::{Deserialize, Serialize};

/// RPC endpoint used when none is configured (Avalanche Fuji C-Chain).
pub const DEFAULT_RPC_URL: &str = "https://api.avax-test.network/ext/bc/C/rpc";

/// An on-chain occurrence of interest, as delivered to event handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Configured event type this event matched
    pub event_type: String,
    pub block_height: u64,
    /// Transaction hash (0x-prefixed hex)
    pub transaction_id: String,
    /// Position of the log within its block
    #[serde(default)]
    pub log_index: u64,
    /// Raw log fields (emitting contract, topics, data)
    #[serde(default)]
    pub payload: serde_json::Value,
}
