// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Blockchain integration for Avalanche C-Chain (EVM).
//!
//! This module provides functionality for:
//! - Querying the latest block height
//! - Fetching logs of configured event types within a block range

pub mod client;
pub mod types;

pub use client::{ChainClient, ChainClientError, EventFilter, EvmChainClient};
pub use types::*;
