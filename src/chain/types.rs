use alloy::{
    primitives::{Address, Bytes, LogData, B256},
    rpc::types::{Filter, Log},
    sol_types::SolEvent,
};

use crate::{abis::Transfer, db::models::RecordId};

/// A log as delivered by the node, with the positional fields the engine
/// needs already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: Option<B256>,
    /// Some nodes attach the block timestamp to each log.
    pub block_timestamp: Option<u64>,
    pub transaction_hash: B256,
    pub log_index: u64,
    /// Set by the node when a previously announced log was reorged out.
    pub removed: bool,
}

impl RawLog {
    /// Build from an RPC log. `block_number` is passed separately because the
    /// adapter may have recovered it from the transaction receipt.
    ///
    /// Returns `None` when the log has no transaction hash or log index
    /// (pending logs).
    pub fn from_rpc(log: &Log, block_number: u64) -> Option<Self> {
        Some(Self {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            block_number,
            block_hash: log.block_hash,
            block_timestamp: log.block_timestamp,
            transaction_hash: log.transaction_hash?,
            log_index: log.log_index?,
            removed: log.removed,
        })
    }

    pub fn id(&self) -> RecordId {
        RecordId::new(self.transaction_hash, self.log_index)
    }

    /// Sort key used for emission order.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    pub fn log_data(&self) -> LogData {
        LogData::new_unchecked(self.topics.clone(), self.data.clone())
    }
}

/// Predicate selecting the logs of one event on one contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topic0: B256,
}

impl LogFilter {
    /// Registry `Transfer(from, to, tokenId)` logs emitted by `address`.
    pub fn transfers(address: Address) -> Self {
        Self {
            address,
            topic0: Transfer::SIGNATURE_HASH,
        }
    }

    pub fn matches(&self, log: &RawLog) -> bool {
        log.address == self.address && log.topics.first() == Some(&self.topic0)
    }

    /// RPC filter without a block range (used for push subscriptions).
    pub fn to_rpc(&self) -> Filter {
        Filter::new()
            .address(self.address)
            .event_signature(self.topic0)
    }

    pub fn to_rpc_range(&self, from_block: u64, to_block: u64) -> Filter {
        self.to_rpc().from_block(from_block).to_block(to_block)
    }
}
