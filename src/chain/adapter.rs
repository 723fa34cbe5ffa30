use async_trait::async_trait;
use futures::stream::BoxStream;
use log::debug;

use super::{ChainError, LogFilter, RawLog};

/// Raw push stream from a single transport connection. It ends when the
/// connection drops; [`LiveSubscription`](super::LiveSubscription) restarts it.
pub type LogStream = BoxStream<'static, RawLog>;

/// Node connection contract used by the ingestion core.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Current head height. Fails with `EndpointUnavailable`/`Timeout` when
    /// the node cannot be reached.
    async fn current_height(&self) -> Result<u64, ChainError>;

    /// Logs matching `filter` in `from_block..=to_block`. Fails with
    /// `RangeTooLarge` when the node rejects the span.
    async fn get_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError>;

    /// Best-effort; `BlockNotFound` is not fatal to callers.
    async fn get_block_timestamp(&self, block_number: u64) -> Result<u64, ChainError>;

    /// Open one push subscription for `filter` on the current transport.
    async fn open_log_stream(&self, filter: &LogFilter) -> Result<LogStream, ChainError>;
}

/// Query `from_block..=to_block` in spans of at most `max_span` blocks,
/// halving the span whenever the node answers `RangeTooLarge`.
///
/// `max_span` is updated in place so callers can keep the reduced span for
/// later queries. Other errors are returned as-is.
pub async fn get_logs_split(
    adapter: &dyn ChainAdapter,
    filter: &LogFilter,
    from_block: u64,
    to_block: u64,
    max_span: &mut u64,
) -> Result<Vec<RawLog>, ChainError> {
    let mut logs = Vec::new();
    let mut cursor = from_block;

    while cursor <= to_block {
        let span = (*max_span).max(1);
        let end = to_block.min(cursor.saturating_add(span - 1));

        match adapter.get_logs(filter, cursor, end).await {
            Ok(mut batch) => {
                logs.append(&mut batch);
                if end == u64::MAX {
                    break;
                }
                cursor = end + 1;
            },
            Err(ChainError::RangeTooLarge { .. }) if end > cursor => {
                *max_span = ((end - cursor + 1) / 2).max(1);
                debug!(
                    "Node rejected range {}..={}, retrying with span {}",
                    cursor, end, max_span
                );
            },
            Err(e) => return Err(e),
        }
    }

    Ok(logs)
}
