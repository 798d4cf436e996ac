// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Relational Wallet Jobs
//!
//! Asynchronous execution backbone of the Relational custodial wallet:
//!
//! - [`jobs`]: durable at-least-once job execution with a bounded worker
//!   pool, crash recovery and status webhooks
//! - [`listener`]: exclusive block-range chain listener with a persisted
//!   cursor and event fan-out
//! - [`deposits`]: turns chain events into jobs
//! - [`system`]: maintenance mode and pause switches shared by both
//!
//! All state lives in one redb file ([`storage::StateDatabase`]).

pub mod blockchain;
pub mod config;
pub mod deposits;
pub mod jobs;
pub mod listener;
pub mod logging;
pub mod storage;
pub mod system;
