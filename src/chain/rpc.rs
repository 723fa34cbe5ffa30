use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy::{
    eips::BlockNumberOrTag,
    primitives::B256,
    providers::{DynProvider, Provider, ProviderBuilder, WsConnect},
    rpc::types::Log,
    transports::TransportError,
};
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use url::Url;

use super::{ChainAdapter, ChainError, LogFilter, LogStream, RawLog};
use crate::config::ChainSettings;

/// JSON-RPC error code many providers use for "limit exceeded".
const LIMIT_EXCEEDED_CODE: i64 = -32005;

/// Message fragments providers use when refusing an `eth_getLogs` span.
const RANGE_ERROR_HINTS: &[&str] = &[
    "block range",
    "range too large",
    "range is too wide",
    "more than",
    "too many",
    "response size exceeded",
    "limited to",
];

struct Endpoint {
    url: String,
    provider: DynProvider,
}

/// [`ChainAdapter`] backed by alloy providers.
///
/// Request/response calls go over HTTP and fail over round-robin across the
/// configured URLs. Push delivery uses `eth_subscribe("logs")` when a
/// WebSocket URL is configured, otherwise it is emulated by polling
/// `eth_getLogs`.
#[derive(Clone)]
pub struct RpcChainAdapter {
    endpoints: Arc<Vec<Endpoint>>,
    active: Arc<AtomicUsize>,
    ws_url: Option<String>,
    request_timeout: Duration,
    poll_interval: Duration,
}

impl RpcChainAdapter {
    pub fn new(settings: &ChainSettings, poll_interval: Duration) -> anyhow::Result<Self> {
        let endpoints = settings
            .rpc_urls
            .iter()
            .map(|raw| {
                let url = Url::parse(raw).with_context(|| format!("Invalid RPC URL: {raw}"))?;
                let provider = DynProvider::new(ProviderBuilder::new().connect_http(url));
                Ok(Endpoint {
                    url: raw.clone(),
                    provider,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        anyhow::ensure!(!endpoints.is_empty(), "At least one RPC URL is required");

        Ok(Self {
            endpoints: Arc::new(endpoints),
            active: Arc::new(AtomicUsize::new(0)),
            ws_url: settings.ws_url.clone(),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            poll_interval,
        })
    }

    /// Provider of the currently active endpoint, for contract reads.
    /// Callers should fetch it per request so failover applies to them too.
    pub fn provider(&self) -> DynProvider {
        self.active_endpoint().provider.clone()
    }

    fn active_endpoint(&self) -> &Endpoint {
        let index = self.active.load(Ordering::Acquire);
        &self.endpoints[index % self.endpoints.len()]
    }

    /// Move to the next endpoint unless another caller already did.
    fn fail_over(&self, failed: usize) {
        let count = self.endpoints.len();
        if count < 2 {
            return;
        }
        if self
            .active
            .compare_exchange(failed, failed.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            warn!(
                "[RPC] Switching endpoint {} -> {}",
                self.endpoints[failed % count].url,
                self.endpoints[failed.wrapping_add(1) % count].url
            );
        }
    }

    /// Run `op` against the active endpoint under the request timeout.
    async fn call<T, F, Fut>(&self, label: &'static str, op: F) -> Result<T, ChainError>
    where
        F: FnOnce(DynProvider) -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let index = self.active.load(Ordering::Acquire);
        let provider = self.endpoints[index % self.endpoints.len()].provider.clone();

        match tokio::time::timeout(self.request_timeout, op(provider)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if matches!(e, ChainError::EndpointUnavailable(_)) {
                    self.fail_over(index);
                }
                Err(e)
            },
            Err(_) => {
                self.fail_over(index);
                Err(ChainError::Timeout(label, self.request_timeout))
            },
        }
    }

    async fn receipt_block(&self, tx_hash: B256) -> Result<Option<u64>, ChainError> {
        self.call("eth_getTransactionReceipt", |p| async move {
            p.get_transaction_receipt(tx_hash)
                .await
                .map(|receipt| receipt.and_then(|r| r.block_number))
                .map_err(unavailable)
        })
        .await
    }

    /// Convert an RPC log, recovering a missing block number from the
    /// transaction receipt.
    async fn to_raw_log(&self, log: Log) -> Result<RawLog, ChainError> {
        let block_number = recover_block_number(&log, |tx_hash| self.receipt_block(tx_hash)).await?;
        RawLog::from_rpc(&log, block_number).ok_or_else(|| {
            ChainError::EndpointUnavailable(format!(
                "log in block {block_number} has no transaction hash or index"
            ))
        })
    }

    /// Pushed logs that cannot be positioned are dropped; the confirmation
    /// sweep delivers them later.
    async fn pushed_log(&self, log: Log) -> Option<RawLog> {
        match self.to_raw_log(log).await {
            Ok(log) => Some(log),
            Err(e) => {
                warn!("[RPC] Dropping pushed log: {}", e);
                None
            },
        }
    }

    async fn ws_stream(&self, url: &str, filter: &LogFilter) -> Result<LogStream, ChainError> {
        let connect = ProviderBuilder::new().connect_ws(WsConnect::new(url.to_string()));
        let ws = tokio::time::timeout(self.request_timeout, connect)
            .await
            .map_err(|_| ChainError::Timeout("ws connect", self.request_timeout))?
            .map_err(unavailable)?;
        let ws = DynProvider::new(ws);

        let subscription = ws
            .subscribe_logs(&filter.to_rpc())
            .await
            .map_err(unavailable)?;

        info!("[RPC] Log subscription opened on {}", url);

        let adapter = self.clone();
        let stream = subscription
            .into_stream()
            .filter_map(move |log| {
                // The connection lives as long as the stream.
                let _connection = &ws;
                let adapter = adapter.clone();
                async move { adapter.pushed_log(log).await }
            })
            .boxed();

        Ok(stream)
    }

    /// Poll-based stand-in for a push subscription: delivers logs of blocks
    /// mined after the stream was opened. Ends on the first failed query.
    async fn polling_stream(&self, filter: &LogFilter) -> Result<LogStream, ChainError> {
        struct PollState {
            adapter: RpcChainAdapter,
            filter: LogFilter,
            next_block: u64,
            pending: VecDeque<RawLog>,
        }

        let head = self.current_height().await?;
        let state = PollState {
            adapter: self.clone(),
            filter: *filter,
            next_block: head + 1,
            pending: VecDeque::new(),
        };

        debug!("[RPC] Polling for logs from block {}", head + 1);

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(log) = state.pending.pop_front() {
                    return Some((log, state));
                }

                tokio::time::sleep(state.adapter.poll_interval).await;

                let head = match state.adapter.current_height().await {
                    Ok(head) => head,
                    Err(e) => {
                        warn!("[RPC] Poll head query failed: {}", e);
                        return None;
                    },
                };
                if head < state.next_block {
                    continue;
                }

                match state.adapter.get_logs(&state.filter, state.next_block, head).await {
                    Ok(mut logs) => {
                        logs.sort_by_key(RawLog::position);
                        state.pending.extend(logs);
                        state.next_block = head + 1;
                    },
                    Err(e) => {
                        warn!("[RPC] Poll log query failed: {}", e);
                        return None;
                    },
                }
            }
        })
        .boxed();

        Ok(stream)
    }
}

#[async_trait]
impl ChainAdapter for RpcChainAdapter {
    async fn current_height(&self) -> Result<u64, ChainError> {
        self.call("eth_blockNumber", |p| async move {
            p.get_block_number().await.map_err(unavailable)
        })
        .await
    }

    async fn get_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError> {
        let rpc_filter = filter.to_rpc_range(from_block, to_block);
        let logs = self
            .call("eth_getLogs", |p| async move {
                p.get_logs(&rpc_filter)
                    .await
                    .map_err(|e| classify_logs_error(e, from_block, to_block))
            })
            .await?;

        // A log that cannot be positioned fails the whole range so the caller
        // retries it instead of confirming past a gap.
        let mut raw = Vec::with_capacity(logs.len());
        for log in logs {
            raw.push(self.to_raw_log(log).await?);
        }
        Ok(raw)
    }

    async fn get_block_timestamp(&self, block_number: u64) -> Result<u64, ChainError> {
        self.call("eth_getBlockByNumber", |p| async move {
            match p
                .get_block_by_number(BlockNumberOrTag::Number(block_number))
                .await
            {
                Ok(Some(block)) => Ok(block.header.timestamp),
                Ok(None) => Err(ChainError::BlockNotFound(block_number)),
                Err(e) => Err(unavailable(e)),
            }
        })
        .await
    }

    async fn open_log_stream(&self, filter: &LogFilter) -> Result<LogStream, ChainError> {
        match &self.ws_url {
            Some(url) => self.ws_stream(url, filter).await,
            None => self.polling_stream(filter).await,
        }
    }
}

/// Block number of `log`, looked up through `receipt_block` when the node
/// left it out.
async fn recover_block_number<F, Fut>(log: &Log, receipt_block: F) -> Result<u64, ChainError>
where
    F: FnOnce(B256) -> Fut,
    Fut: Future<Output = Result<Option<u64>, ChainError>>,
{
    if let Some(number) = log.block_number {
        return Ok(number);
    }

    let tx_hash = log.transaction_hash.ok_or_else(|| {
        ChainError::EndpointUnavailable("log without block number or transaction hash".to_string())
    })?;

    debug!("[RPC] Recovering block number of {} from its receipt", tx_hash);
    receipt_block(tx_hash)
        .await?
        .ok_or_else(|| ChainError::EndpointUnavailable(format!("no receipt yet for {tx_hash}")))
}

fn unavailable(err: TransportError) -> ChainError {
    ChainError::EndpointUnavailable(err.to_string())
}

fn classify_logs_error(err: TransportError, from: u64, to: u64) -> ChainError {
    if let Some(payload) = err.as_error_resp() {
        if is_range_rejection(payload.code, &payload.message) {
            return ChainError::RangeTooLarge {
                from,
                to,
                message: payload.message.to_string(),
            };
        }
    }
    unavailable(err)
}

fn is_range_rejection(code: i64, message: &str) -> bool {
    let message = message.to_lowercase();
    code == LIMIT_EXCEEDED_CODE || RANGE_ERROR_HINTS.iter().any(|hint| message.contains(hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_rejections_are_recognized() {
        assert!(is_range_rejection(-32005, "limit exceeded"));
        assert!(is_range_rejection(-32600, "query returned more than 10000 results"));
        assert!(is_range_rejection(-32000, "Block range is too wide"));
        assert!(is_range_rejection(-32602, "eth_getLogs is limited to a 10,000 range"));
        assert!(is_range_rejection(-32000, "Log response size exceeded."));
    }

    #[test]
    fn test_other_errors_are_not_range_rejections() {
        assert!(!is_range_rejection(-32601, "method not found"));
        assert!(!is_range_rejection(-32000, "header not found"));
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let settings = ChainSettings {
            chain_id: 1,
            rpc_urls: vec!["not a url".to_string()],
            ws_url: None,
            contract_address: "0x96db117d850f1ca2990374da4e027b9ae6716d81".to_string(),
            start_block: 0,
            request_timeout_ms: 1_000,
        };
        assert!(RpcChainAdapter::new(&settings, Duration::from_secs(1)).is_err());
    }

    fn unpositioned_log() -> Log {
        Log {
            transaction_hash: Some(B256::repeat_byte(0x42)),
            log_index: Some(0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_failed_receipt_lookup_is_an_error() {
        let result = recover_block_number(&unpositioned_log(), |_| async {
            Err(ChainError::Timeout("eth_getTransactionReceipt", Duration::from_secs(1)))
        })
        .await;

        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_missing_receipt_is_an_error() {
        let result = recover_block_number(&unpositioned_log(), |_| async { Ok(None) }).await;
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_block_number_recovered_from_receipt() {
        let log = unpositioned_log();
        let expected = log.transaction_hash.unwrap();
        let number = recover_block_number(&log, |tx_hash| async move {
            assert_eq!(tx_hash, expected);
            Ok(Some(7))
        })
        .await
        .unwrap();

        assert_eq!(number, 7);
    }

    #[tokio::test]
    async fn test_present_block_number_skips_receipt() {
        let mut log = unpositioned_log();
        log.block_number = Some(12);
        let number = recover_block_number(&log, |_| async { Err(ChainError::BlockNotFound(0)) })
            .await
            .unwrap();

        assert_eq!(number, 12);
    }

    #[test]
    fn test_provider_follows_failover() {
        let settings = ChainSettings {
            chain_id: 1,
            rpc_urls: vec![
                "http://127.0.0.1:8545".to_string(),
                "http://127.0.0.1:8546".to_string(),
            ],
            ws_url: None,
            contract_address: "0x96db117d850f1ca2990374da4e027b9ae6716d81".to_string(),
            start_block: 0,
            request_timeout_ms: 1_000,
        };
        let adapter = RpcChainAdapter::new(&settings, Duration::from_secs(1)).unwrap();
        let shared = adapter.clone();
        assert_eq!(adapter.active_endpoint().url, "http://127.0.0.1:8545");

        adapter.fail_over(0);
        assert_eq!(shared.active_endpoint().url, "http://127.0.0.1:8546");

        // A stale report of the old endpoint does not skip ahead again.
        adapter.fail_over(0);
        assert_eq!(shared.active_endpoint().url, "http://127.0.0.1:8546");
    }
}
