//! Scripted in-memory chain used by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{ChainAdapter, ChainError, LogFilter, LogStream, RawLog};

pub const MOCK_CONTRACT: Address = Address::repeat_byte(0xd0);
pub const MOCK_RECIPIENT: Address = Address::repeat_byte(0x22);

/// Build a registry Transfer log at `block`/`log_index` in transaction
/// `0x{tx}{tx}…`.
pub fn mock_transfer(block: u64, log_index: u64, tx: u8, from: Address, token_id: u64) -> RawLog {
    RawLog {
        address: MOCK_CONTRACT,
        topics: vec![
            LogFilter::transfers(MOCK_CONTRACT).topic0,
            from.into_word(),
            MOCK_RECIPIENT.into_word(),
            B256::from(U256::from(token_id).to_be_bytes::<32>()),
        ],
        data: Bytes::new(),
        block_number: block,
        block_hash: Some(block_hash(block)),
        block_timestamp: None,
        transaction_hash: B256::repeat_byte(tx),
        log_index,
        removed: false,
    }
}

pub fn block_hash(block: u64) -> B256 {
    B256::from(U256::from(block).to_be_bytes::<32>())
}

#[derive(Default)]
struct State {
    head: u64,
    logs: Vec<RawLog>,
    max_span: Option<u64>,
    failing_heights: u32,
    failing_log_queries: u32,
    timestamps_missing: bool,
    accepted_ranges: Vec<(u64, u64)>,
    streams: VecDeque<mpsc::UnboundedReceiver<RawLog>>,
    streams_opened: u32,
}

pub struct MockChain {
    state: Mutex<State>,
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        Self {
            state: Mutex::new(State {
                head,
                ..Default::default()
            }),
        }
    }

    pub fn filter(&self) -> LogFilter {
        LogFilter::transfers(MOCK_CONTRACT)
    }

    pub fn push_log(&self, log: RawLog) {
        self.state.lock().unwrap().logs.push(log);
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn set_max_span(&self, max_span: Option<u64>) {
        self.state.lock().unwrap().max_span = max_span;
    }

    pub fn fail_next_heights(&self, count: u32) {
        self.state.lock().unwrap().failing_heights = count;
    }

    pub fn fail_next_log_queries(&self, count: u32) {
        self.state.lock().unwrap().failing_log_queries = count;
    }

    pub fn set_timestamps_missing(&self, missing: bool) {
        self.state.lock().unwrap().timestamps_missing = missing;
    }

    pub fn accepted_ranges(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().accepted_ranges.clone()
    }

    pub fn streams_opened(&self) -> u32 {
        self.state.lock().unwrap().streams_opened
    }

    /// Queue a push connection; the next `open_log_stream` call returns it.
    /// Dropping the sender simulates a transport drop.
    pub fn live_feed(&self) -> mpsc::UnboundedSender<RawLog> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().streams.push_back(rx);
        tx
    }
}

#[async_trait]
impl ChainAdapter for MockChain {
    async fn current_height(&self) -> Result<u64, ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_heights > 0 {
            state.failing_heights -= 1;
            return Err(ChainError::EndpointUnavailable("mock outage".into()));
        }
        Ok(state.head)
    }

    async fn get_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_log_queries > 0 {
            state.failing_log_queries -= 1;
            return Err(ChainError::Timeout("eth_getLogs", std::time::Duration::from_secs(1)));
        }
        if let Some(max) = state.max_span {
            if to_block - from_block + 1 > max {
                return Err(ChainError::RangeTooLarge {
                    from: from_block,
                    to: to_block,
                    message: "query returned more than 10000 results".into(),
                });
            }
        }
        state.accepted_ranges.push((from_block, to_block));
        // Insertion order, not chain order, so callers must sort.
        Ok(state
            .logs
            .iter()
            .filter(|l| filter.matches(l))
            .filter(|l| l.block_number >= from_block && l.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn get_block_timestamp(&self, block_number: u64) -> Result<u64, ChainError> {
        if self.state.lock().unwrap().timestamps_missing {
            return Err(ChainError::BlockNotFound(block_number));
        }
        Ok(1_700_000_000 + block_number * 12)
    }

    async fn open_log_stream(&self, _filter: &LogFilter) -> Result<LogStream, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.streams_opened += 1;
        match state.streams.pop_front() {
            Some(rx) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|log| (log, rx))
            })
            .boxed()),
            None => Ok(futures::stream::pending::<RawLog>().boxed()),
        }
    }
}
