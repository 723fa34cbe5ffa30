use std::{sync::Arc, time::Duration};

use alloy::{primitives::Address, sol_types::SolEvent};
use log::{debug, warn};
use moka::future::Cache;
use thiserror::Error;

use crate::{
    abis::Transfer,
    chain::{ChainAdapter, ChainError, RawLog},
    db::models::{EventSource, TransferRecord},
    worker::DomainResolver,
};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("log {0} is not a registry Transfer")]
    NotATransfer(String),

    #[error("failed to decode Transfer log {id}: {reason}")]
    Decode { id: String, reason: String },
}

/// Turns raw Transfer logs into [`TransferRecord`]s.
///
/// Name and timestamp enrichment are best-effort: a slow or failing lookup
/// leaves the field empty and the record is still produced.
pub struct Normalizer {
    adapter: Arc<dyn ChainAdapter>,
    resolver: Arc<dyn DomainResolver>,
    resolver_timeout: Duration,
    timestamp_timeout: Duration,
    timestamps: Cache<u64, u64>,
}

impl Normalizer {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        resolver: Arc<dyn DomainResolver>,
        resolver_timeout: Duration,
        timestamp_timeout: Duration,
    ) -> Self {
        let timestamps = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(3600))
            .build();

        Self {
            adapter,
            resolver,
            resolver_timeout,
            timestamp_timeout,
            timestamps,
        }
    }

    pub async fn normalize(
        &self,
        log: &RawLog,
        source: EventSource,
    ) -> Result<TransferRecord, NormalizeError> {
        if log.topics.first() != Some(&Transfer::SIGNATURE_HASH) {
            return Err(NormalizeError::NotATransfer(log.id().to_string()));
        }

        let event = Transfer::decode_log_data(&log.log_data()).map_err(|e| {
            NormalizeError::Decode {
                id: log.id().to_string(),
                reason: e.to_string(),
            }
        })?;

        let (domain_name, block_timestamp) = tokio::join!(
            self.domain_name(&event),
            self.block_timestamp(log)
        );

        Ok(TransferRecord {
            from_address: event.from,
            to_address: event.to,
            token_id: event.tokenId,
            domain_name,
            block_number: log.block_number,
            block_timestamp,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
            // Typed comparison, so the hex case of the source is irrelevant.
            is_mint: event.from == Address::ZERO,
            source,
        })
    }

    async fn domain_name(&self, event: &Transfer) -> Option<String> {
        match tokio::time::timeout(self.resolver_timeout, self.resolver.resolve(event.tokenId))
            .await
        {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                warn!("[NORMALIZER] Domain lookup for token {} failed: {:#}", event.tokenId, e);
                None
            },
            Err(_) => {
                warn!(
                    "[NORMALIZER] Domain lookup for token {} timed out after {:?}",
                    event.tokenId, self.resolver_timeout
                );
                None
            },
        }
    }

    async fn block_timestamp(&self, log: &RawLog) -> Option<u64> {
        if let Some(ts) = log.block_timestamp {
            return Some(ts);
        }
        if let Some(ts) = self.timestamps.get(&log.block_number).await {
            return Some(ts);
        }

        let lookup = self.adapter.get_block_timestamp(log.block_number);
        match tokio::time::timeout(self.timestamp_timeout, lookup).await {
            Ok(Ok(ts)) => {
                self.timestamps.insert(log.block_number, ts).await;
                Some(ts)
            },
            Ok(Err(ChainError::BlockNotFound(n))) => {
                debug!("[NORMALIZER] Block {} not found, timestamp left empty", n);
                None
            },
            Ok(Err(e)) => {
                debug!("[NORMALIZER] Timestamp for block {} unavailable: {}", log.block_number, e);
                None
            },
            Err(_) => {
                debug!(
                    "[NORMALIZER] Timestamp for block {} timed out after {:?}",
                    log.block_number, self.timestamp_timeout
                );
                None
            },
        }
    }
}
