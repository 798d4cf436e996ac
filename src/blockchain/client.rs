// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Chain client used by the listener.

use std::str::FromStr;

use alloy::{
    network::Ethereum,
    primitives::{keccak256, Address, B256},
    providers::{
        fillers::{BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller},
        Identity, Provider, ProviderBuilder, RootProvider,
    },
    rpc::types::{Filter, Log},
    transports::{RpcError, TransportErrorKind},
};
use async_trait::async_trait;

use super::types::*;

/// HTTP provider type for Avalanche C-Chain (with all fillers).
type HttpProvider = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider<Ethereum>,
>;

/// Read access to a chain node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block height.
    async fn latest_block_height(&self) -> Result<u64, ChainClientError>;

    /// Events of `event_type` in the inclusive block range `[start, end]`.
    async fn events_in_range(
        &self,
        event_type: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<ChainEvent>, ChainClientError>;
}

/// Parsed event type: `Signature(types)` or `0xContract:Signature(types)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub contract: Option<Address>,
    pub signature: String,
    /// keccak256 of the signature (topic 0)
    pub topic: B256,
}

impl FromStr for EventFilter {
    type Err = ChainClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (contract, signature) = match s.split_once(':') {
            Some((address, signature)) => {
                let address = Address::from_str(address.trim()).map_err(|e| {
                    ChainClientError::InvalidEventType(format!("{s}: invalid contract address: {e}"))
                })?;
                (Some(address), signature.trim())
            }
            None => (None, s),
        };

        let well_formed = signature
            .find('(')
            .is_some_and(|open| open > 0 && signature.ends_with(')'));
        if !well_formed || signature.contains(char::is_whitespace) {
            return Err(ChainClientError::InvalidEventType(format!(
                "{s}: expected Name(type,...)"
            )));
        }

        Ok(Self {
            contract,
            signature: signature.to_string(),
            topic: keccak256(signature.as_bytes()),
        })
    }
}

impl EventFilter {
    fn to_filter(&self, start: u64, end: u64) -> Filter {
        let filter = Filter::new()
            .from_block(start)
            .to_block(end)
            .event_signature(self.topic);
        match self.contract {
            Some(address) => filter.address(address),
            None => filter,
        }
    }
}

/// EVM JSON-RPC client (Avalanche C-Chain by default).
pub struct EvmChainClient {
    provider: HttpProvider,
}

impl EvmChainClient {
    /// Create a client for the given RPC endpoint.
    pub fn new(rpc_url: &str) -> Result<Self, ChainClientError> {
        let url: url::Url = rpc_url
            .parse()
            .map_err(|e: url::ParseError| ChainClientError::InvalidRpcUrl(e.to_string()))?;

        let provider = ProviderBuilder::new().connect_http(url);

        Ok(Self { provider })
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    async fn latest_block_height(&self) -> Result<u64, ChainClientError> {
        self.provider
            .get_block_number()
            .await
            .map_err(classify_rpc_error)
    }

    async fn events_in_range(
        &self,
        event_type: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<ChainEvent>, ChainClientError> {
        let filter: EventFilter = event_type.parse()?;

        let logs = self
            .provider
            .get_logs(&filter.to_filter(start, end))
            .await
            .map_err(classify_rpc_error)?;

        let mut events: Vec<ChainEvent> = logs
            .iter()
            .filter_map(|log| log_to_event(event_type, log))
            .collect();
        events.sort_by_key(|e| (e.block_height, e.log_index));
        Ok(events)
    }
}

/// Transport failures mean the node is unreachable; everything else is an
/// RPC-level error.
fn classify_rpc_error(err: RpcError<TransportErrorKind>) -> ChainClientError {
    match err {
        RpcError::Transport(kind) => ChainClientError::Unavailable(kind.to_string()),
        other => ChainClientError::Rpc(other.to_string()),
    }
}

/// Pending logs (no block or transaction yet) are skipped.
fn log_to_event(event_type: &str, log: &Log) -> Option<ChainEvent> {
    let block_height = log.block_number?;
    let transaction_hash = log.transaction_hash?;

    Some(ChainEvent {
        event_type: event_type.to_string(),
        block_height,
        transaction_id: transaction_hash.to_string(),
        log_index: log.log_index.unwrap_or_default(),
        payload: serde_json::json!({
            "address": log.address().to_string(),
            "topics": log.topics().iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            "data": log.data().data.to_string(),
        }),
    })
}

/// Errors that can occur during blockchain operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    #[error("Invalid RPC URL: {0}")]
    InvalidRpcUrl(String),

    #[error("Invalid event type: {0}")]
    InvalidEventType(String),

    /// The node could not be reached.
    #[error("Chain unavailable: {0}")]
    Unavailable(String),

    #[error("RPC error: {0}")]
    Rpc(String),
}

impl ChainClientError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, b256, Bytes};

    const TRANSFER_TOPIC: B256 =
        b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

    #[test]
    fn parse_signature_only() {
        let filter: EventFilter = "Transfer(address,address,uint256)".parse().unwrap();
        assert_eq!(filter.contract, None);
        assert_eq!(filter.signature, "Transfer(address,address,uint256)");
        assert_eq!(filter.topic, TRANSFER_TOPIC);
    }

    #[test]
    fn parse_contract_and_signature() {
        let filter: EventFilter =
            "0x5425890298aed601595a70AB815c96711a31Bc65:Transfer(address,address,uint256)"
                .parse()
                .unwrap();
        assert_eq!(
            filter.contract,
            Some(address!("5425890298aed601595a70AB815c96711a31Bc65"))
        );
        assert_eq!(filter.topic, TRANSFER_TOPIC);
    }

    #[test]
    fn reject_malformed_event_types() {
        for raw in [
            "",
            "Transfer",
            "(address)",
            "Transfer(address, uint256)",
            "0xnothex:Transfer(address)",
        ] {
            let err = raw.parse::<EventFilter>().unwrap_err();
            assert!(matches!(err, ChainClientError::InvalidEventType(_)), "{raw}");
        }
    }

    #[test]
    fn transport_errors_are_unavailable() {
        let err = classify_rpc_error(RpcError::Transport(TransportErrorKind::BackendGone));
        assert!(err.is_unavailable());

        let err = classify_rpc_error(RpcError::NullResp);
        assert!(!err.is_unavailable());
        assert!(matches!(err, ChainClientError::Rpc(_)));
    }

    #[test]
    fn log_conversion() {
        let contract = address!("5425890298aed601595a70AB815c96711a31Bc65");
        let tx = B256::repeat_byte(0xab);
        let log = Log {
            inner: alloy::primitives::Log::new_unchecked(
                contract,
                vec![TRANSFER_TOPIC],
                Bytes::from_static(&[0x01]),
            ),
            block_number: Some(42),
            transaction_hash: Some(tx),
            log_index: Some(3),
            ..Default::default()
        };

        let event = log_to_event("Transfer(address,address,uint256)", &log).unwrap();
        assert_eq!(event.block_height, 42);
        assert_eq!(event.log_index, 3);
        assert_eq!(event.transaction_id, tx.to_string());
        assert_eq!(event.payload["data"], "0x01");
        assert_eq!(event.payload["topics"][0], TRANSFER_TOPIC.to_string());

        let pending = Log {
            block_number: None,
            ..log
        };
        assert!(log_to_event("Transfer(address,address,uint256)", &pending).is_none());
    }

    #[test]
    fn invalid_rpc_url() {
        assert!(matches!(
            EvmChainClient::new("not a url"),
            Err(ChainClientError::InvalidRpcUrl(_))
        ));
        assert!(EvmChainClient::new(DEFAULT_RPC_URL).is_ok());
    }
}
