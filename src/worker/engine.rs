use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use alloy::primitives::B256;
use anyhow::Context;
use futures::future::join_all;
use log::{debug, info, warn};
use rustc_hash::FxHashSet;
use tokio::{sync::Mutex, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{
        get_logs_split, sleep_or_cancel, Backoff, ChainAdapter, LiveEvent, LiveSubscription,
        LogFilter, RawLog, SubscriptionConfig,
    },
    config::Settings,
    db::{
        models::{EventSource, TransferRecord, Watermark, WatermarkKey},
        WatermarkStore,
    },
    utils::{hex_encode, parse_address, short_address},
    worker::{dedup::retention_floor, DedupWindow, Normalizer},
};

/// Interval for logging backfill progress (10 seconds)
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Records normalized concurrently per round; output order is preserved.
const NORMALIZE_CONCURRENCY: usize = 16;

/// Pushed logs waiting for the next sweep of their block, in emission order.
/// The transaction hash breaks ties between logs sharing a position.
type PendingLogs = BTreeMap<(u64, u64, B256), RawLog>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Backfilling,
    Live,
    Recovering,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backfilling => write!(f, "BACKFILLING"),
            Self::Live => write!(f, "LIVE"),
            Self::Recovering => write!(f, "RECOVERING"),
        }
    }
}

/// Receives every reconciled record exactly once, in emission order.
///
/// Must not block: the engine calls it while holding its ledger.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, record: TransferRecord);
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub key: WatermarkKey,
    pub filter: LogFilter,
    pub start_block: u64,
    pub confirmation_depth: u64,
    pub chunk_size: u64,
    pub poll_interval: Duration,
    pub staleness_timeout: Duration,
    pub dedup_margin: u64,
    pub dedup_capacity: usize,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl EngineSettings {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let contract = parse_address(&settings.chain.contract_address).with_context(|| {
            format!("Invalid contract address {}", settings.chain.contract_address)
        })?;
        let ingestion = &settings.ingestion;

        Ok(Self {
            key: WatermarkKey::new(settings.chain.chain_id, &hex_encode(contract.as_slice())),
            filter: LogFilter::transfers(contract),
            start_block: settings.chain.start_block,
            confirmation_depth: ingestion.confirmation_depth,
            chunk_size: ingestion.chunk_size.max(1),
            poll_interval: ingestion.poll_interval(),
            staleness_timeout: ingestion.staleness_timeout(),
            dedup_margin: ingestion.dedup_margin_blocks,
            dedup_capacity: ingestion.dedup_capacity,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
        })
    }
}

/// Read-only snapshot of the engine's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    /// Highest fully emitted block, if any block has been confirmed yet.
    pub watermark: Option<u64>,
    pub dedup_entries: usize,
    pub emitted: u64,
}

/// Shared mutable state. Only the engine task writes to it.
struct Ledger {
    state: EngineState,
    /// `watermark + 1`.
    next_block: u64,
    dedup: DedupWindow,
    block_hashes: BTreeMap<u64, B256>,
    emitted: u64,
}

impl Ledger {
    fn watermark(&self) -> Option<u64> {
        self.next_block.checked_sub(1)
    }

    /// Returns `false` when a different hash was already seen for `block`.
    fn record_hash(&mut self, block: u64, hash: Option<B256>) -> bool {
        match hash {
            Some(hash) => self
                .block_hashes
                .insert(block, hash)
                .map_or(true, |previous| previous == hash),
            None => true,
        }
    }
}

/// Per-run scratch state that never leaves the engine task.
struct Cursor {
    span: u64,
    backoff: Backoff,
    last_activity: Instant,
    last_progress_log: Instant,
}

enum LiveExit {
    Stopped,
    Recover(String),
}

/// Merges chunked backfill with the live subscription into one ordered,
/// duplicate-free stream of [`TransferRecord`]s and keeps the watermark.
pub struct ReconciliationEngine {
    adapter: Arc<dyn ChainAdapter>,
    normalizer: Normalizer,
    dispatcher: Arc<dyn Dispatch>,
    store: Arc<dyn WatermarkStore>,
    settings: EngineSettings,
    ledger: Mutex<Ledger>,
}

impl ReconciliationEngine {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        normalizer: Normalizer,
        dispatcher: Arc<dyn Dispatch>,
        store: Arc<dyn WatermarkStore>,
        settings: EngineSettings,
    ) -> Self {
        let ledger = Ledger {
            state: EngineState::Backfilling,
            next_block: settings.start_block,
            dedup: DedupWindow::new(settings.dedup_capacity),
            block_hashes: BTreeMap::new(),
            emitted: 0,
        };

        Self {
            adapter,
            normalizer,
            dispatcher,
            store,
            settings,
            ledger: Mutex::new(ledger),
        }
    }

    pub async fn status(&self) -> EngineStatus {
        let ledger = self.ledger.lock().await;
        EngineStatus {
            state: ledger.state,
            watermark: ledger.watermark(),
            dedup_entries: ledger.dedup.len(),
            emitted: ledger.emitted,
        }
    }

    /// Drive the pipeline until `cancellation_token` fires. The watermark is
    /// persisted before returning.
    pub async fn run(&self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        self.restore().await?;

        let mut cursor = Cursor {
            span: self.settings.chunk_size,
            backoff: Backoff::new(self.settings.retry_base, self.settings.retry_cap),
            last_activity: Instant::now(),
            last_progress_log: Instant::now(),
        };
        let mut subscription: Option<LiveSubscription> = None;
        let mut state = EngineState::Backfilling;

        loop {
            self.enter(state).await;

            match state {
                EngineState::Backfilling | EngineState::Recovering => {
                    if !self
                        .backfill(&mut cursor, &mut subscription, &cancellation_token)
                        .await
                    {
                        break;
                    }
                    state = EngineState::Live;
                },
                EngineState::Live => {
                    let Some(live) = subscription.as_mut() else {
                        state = EngineState::Recovering;
                        continue;
                    };

                    match self.follow(live, &mut cursor, &cancellation_token).await {
                        LiveExit::Stopped => break,
                        LiveExit::Recover(reason) => {
                            warn!("[ENGINE] {}: {}", self.settings.key, reason);
                            if let Some(live) = subscription.take() {
                                live.close().await;
                            }
                            let mut ledger = self.ledger.lock().await;
                            let unconfirmed = ledger.next_block;
                            let _discarded = ledger.block_hashes.split_off(&unconfirmed);
                            state = EngineState::Recovering;
                        },
                    }
                },
            }
        }

        if let Some(live) = subscription.take() {
            live.close().await;
        }
        self.persist().await;

        let status = self.status().await;
        info!(
            "[ENGINE] {} stopped at watermark {:?} after emitting {} record(s)",
            self.settings.key, status.watermark, status.emitted
        );
        Ok(())
    }

    async fn restore(&self) -> anyhow::Result<()> {
        let key = &self.settings.key;
        let stored = self
            .store
            .load(key)
            .await
            .with_context(|| format!("Failed to load watermark for {}", key))?;

        let next_block = match stored {
            Some(watermark) => {
                info!(
                    "[ENGINE] {}: resuming after persisted watermark {}",
                    key, watermark.last_confirmed_block
                );
                watermark
                    .last_confirmed_block
                    .saturating_add(1)
                    .max(self.settings.start_block)
            },
            None => {
                info!(
                    "[ENGINE] {}: no watermark stored, starting at block {}",
                    key, self.settings.start_block
                );
                self.settings.start_block
            },
        };

        self.ledger.lock().await.next_block = next_block;
        Ok(())
    }

    async fn enter(&self, state: EngineState) {
        let mut ledger = self.ledger.lock().await;
        if ledger.state != state {
            info!(
                "[ENGINE] {}: {} -> {} (watermark {:?})",
                self.settings.key,
                ledger.state,
                state,
                ledger.watermark()
            );
            ledger.state = state;
        }
    }

    /// Chunked `eth_getLogs` from the watermark up to `head - depth`. The live
    /// subscription is opened before the last chunk is fetched so nothing
    /// mined in between is missed. Returns `false` if cancelled.
    async fn backfill(
        &self,
        cursor: &mut Cursor,
        subscription: &mut Option<LiveSubscription>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }

            let Some(head) = self.head_with_retry(cursor, cancel).await else {
                return false;
            };
            let target = head.saturating_sub(self.settings.confirmation_depth);
            let from = self.ledger.lock().await.next_block;

            if from > target {
                self.ensure_subscription(subscription, from, cancel);
                return true;
            }

            let to = target.min(from.saturating_add(self.settings.chunk_size - 1));
            if to == target {
                self.ensure_subscription(subscription, from, cancel);
            }

            let Some(logs) = self.logs_with_retry(cursor, from, to, cancel).await else {
                return false;
            };
            let fetched = logs.len();

            {
                let mut ledger = self.ledger.lock().await;
                for log in &logs {
                    ledger.record_hash(log.block_number, log.block_hash);
                }
            }

            let emitted = self.emit(logs, EventSource::History).await;
            self.advance(to).await;

            if cursor.last_progress_log.elapsed() >= PROGRESS_LOG_INTERVAL || to == target {
                info!(
                    "[BACKFILL] {}: blocks {}..={} ({} log(s), {} emitted), {} block(s) behind target {}",
                    self.settings.key,
                    from,
                    to,
                    fetched,
                    emitted,
                    target - to,
                    target
                );
                cursor.last_progress_log = Instant::now();
            }
        }
    }

    fn ensure_subscription(
        &self,
        subscription: &mut Option<LiveSubscription>,
        resume_from: u64,
        cancel: &CancellationToken,
    ) {
        if subscription.is_some() {
            return;
        }

        debug!(
            "[ENGINE] {}: opening live subscription (replay from {})",
            self.settings.key, resume_from
        );
        let config = SubscriptionConfig {
            reconnect_base: self.settings.retry_base,
            reconnect_cap: self.settings.retry_cap,
            replay_span: self.settings.chunk_size,
            ..Default::default()
        };
        *subscription = Some(LiveSubscription::spawn(
            self.adapter.clone(),
            self.settings.filter,
            resume_from,
            config,
            cancel,
        ));
    }

    /// Steady state: collect pushed logs, then on every poll tick emit them
    /// through a sweep that also advances the watermark.
    async fn follow(
        &self,
        live: &mut LiveSubscription,
        cursor: &mut Cursor,
        cancel: &CancellationToken,
    ) -> LiveExit {
        let mut pending = PendingLogs::new();
        let mut tick = tokio::time::interval(self.settings.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        cursor.last_activity = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return LiveExit::Stopped,

                event = live.recv() => match event {
                    Some(LiveEvent::Log(log)) => {
                        cursor.last_activity = Instant::now();
                        if let Err(reason) = self.accept_live(log, &mut pending).await {
                            return LiveExit::Recover(reason);
                        }
                    },
                    Some(LiveEvent::Resumed { from_block, head, replayed }) => {
                        cursor.last_activity = Instant::now();
                        debug!(
                            "[LIVE] {}: subscription resumed, {} log(s) replayed from {}..={}",
                            self.settings.key, replayed, from_block, head
                        );
                    },
                    None => return LiveExit::Recover("live subscription closed".to_string()),
                },

                _ = tick.tick() => {
                    match self.adapter.current_height().await {
                        Ok(head) => {
                            cursor.last_activity = Instant::now();
                            if let Err(reason) = self.confirm(head, cursor, &mut pending).await {
                                return LiveExit::Recover(reason);
                            }
                        },
                        Err(e) => warn!("[LIVE] {}: head query failed: {}", self.settings.key, e),
                    }

                    let idle = cursor.last_activity.elapsed();
                    if idle > self.settings.staleness_timeout {
                        return LiveExit::Recover(format!(
                            "no successful endpoint call for {:?}",
                            idle
                        ));
                    }
                },
            }
        }
    }

    async fn accept_live(&self, log: RawLog, pending: &mut PendingLogs) -> Result<(), String> {
        if !self.settings.filter.matches(&log) {
            return Ok(());
        }
        if log.removed {
            return Err(format!(
                "log {} in block {} was removed by a reorg",
                log.id(),
                log.block_number
            ));
        }

        {
            let mut ledger = self.ledger.lock().await;
            if log.block_number < ledger.next_block {
                debug!("[LIVE] Ignoring {} at or below the watermark", log.id());
                return Ok(());
            }
            if !ledger.record_hash(log.block_number, log.block_hash) {
                return Err(format!("block {} changed hash", log.block_number));
            }
            if ledger.dedup.contains(&log.id()) {
                debug!("[LIVE] Dropping re-delivered {}", log.id());
                return Ok(());
            }
        }

        pending.insert((log.block_number, log.log_index, log.transaction_hash), log);
        Ok(())
    }

    /// Sweep `watermark+1 ..= head` and emit it merged with the pushed logs.
    /// Blocks up to `head - depth` are emitted in full and confirmed. Above
    /// that only blocks announced by the push path are emitted, each together
    /// with its swept logs, so in-block order holds whichever path saw a log
    /// first.
    async fn confirm(
        &self,
        head: u64,
        cursor: &mut Cursor,
        pending: &mut PendingLogs,
    ) -> Result<(), String> {
        let confirmed = head.saturating_sub(self.settings.confirmation_depth);
        let from = self.ledger.lock().await.next_block;
        if from > head {
            return Ok(());
        }

        let swept = match get_logs_split(
            self.adapter.as_ref(),
            &self.settings.filter,
            from,
            head,
            &mut cursor.span,
        )
        .await
        {
            Ok(logs) => logs,
            Err(e) => {
                warn!(
                    "[LIVE] {}: sweep {}..={} failed: {}",
                    self.settings.key, from, head, e
                );
                return Ok(());
            },
        };

        {
            let mut ledger = self.ledger.lock().await;
            for log in &swept {
                if !ledger.record_hash(log.block_number, log.block_hash) {
                    return Err(format!("block {} changed hash", log.block_number));
                }
            }
        }

        let announced = take_below(pending, head.saturating_add(1));
        let live_blocks: BTreeSet<u64> = announced.keys().map(|(block, ..)| *block).collect();

        // Pending entries first so their LIVE tag wins on overlap.
        let mut batch: Vec<(RawLog, EventSource)> = announced
            .into_values()
            .map(|log| (log, EventSource::Live))
            .collect();
        batch.extend(
            swept
                .into_iter()
                .filter(|log| {
                    log.block_number <= confirmed || live_blocks.contains(&log.block_number)
                })
                .map(|log| (log, EventSource::History)),
        );

        self.emit_tagged(batch).await;
        if from <= confirmed {
            self.advance(confirmed).await;
        }
        Ok(())
    }

    async fn emit(&self, logs: Vec<RawLog>, source: EventSource) -> usize {
        self.emit_tagged(logs.into_iter().map(|log| (log, source)).collect())
            .await
    }

    /// Normalize and dispatch in `(block, logIndex)` order, skipping anything
    /// the dedup window already holds.
    async fn emit_tagged(&self, mut batch: Vec<(RawLog, EventSource)>) -> usize {
        batch.retain(|(log, _)| self.settings.filter.matches(log) && !log.removed);
        batch.sort_by_key(|(log, _)| log.position());

        {
            let ledger = self.ledger.lock().await;
            let mut seen = FxHashSet::default();
            batch.retain(|(log, _)| {
                let id = log.id();
                !ledger.dedup.contains(&id) && seen.insert(id)
            });
        }
        if batch.is_empty() {
            return 0;
        }

        let mut records = Vec::with_capacity(batch.len());
        for round in batch.chunks(NORMALIZE_CONCURRENCY) {
            let results = join_all(
                round
                    .iter()
                    .map(|(log, source)| self.normalizer.normalize(log, *source)),
            )
            .await;

            for result in results {
                match result {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("[ENGINE] Skipping undecodable log: {}", e),
                }
            }
        }

        let mut ledger = self.ledger.lock().await;
        let mut emitted = 0;
        for record in records {
            if ledger.dedup.insert(record.id(), record.block_number) {
                debug!(
                    "[{}] block {} token {} {} -> {}",
                    record.source,
                    record.block_number,
                    record.token_id,
                    short_address(&record.from_address),
                    short_address(&record.to_address)
                );
                self.dispatcher.dispatch(record);
                emitted += 1;
            } else {
                debug!("[ENGINE] Dropping duplicate {}", record.id());
            }
        }
        ledger.emitted += emitted as u64;
        emitted
    }

    /// Move the watermark to `confirmed` and expire what it leaves behind.
    async fn advance(&self, confirmed: u64) {
        let watermark = {
            let mut ledger = self.ledger.lock().await;
            if confirmed < ledger.next_block {
                return;
            }
            ledger.next_block = confirmed + 1;

            let floor = retention_floor(
                confirmed,
                self.settings.confirmation_depth,
                self.settings.dedup_margin,
            );
            let expired = ledger.dedup.prune_below(floor);
            ledger.block_hashes = ledger.block_hashes.split_off(&floor);
            if expired > 0 {
                debug!("[ENGINE] Expired {} dedup entries below block {}", expired, floor);
            }

            Watermark::new(&self.settings.key, confirmed)
        };

        self.save(&watermark).await;
    }

    async fn persist(&self) {
        let watermark = self.ledger.lock().await.watermark();
        if let Some(block) = watermark {
            self.save(&Watermark::new(&self.settings.key, block)).await;
        }
    }

    async fn save(&self, watermark: &Watermark) {
        if let Err(e) = self.store.save(watermark).await {
            warn!(
                "[ENGINE] Failed to persist watermark {} for {}: {:#}",
                watermark.last_confirmed_block, self.settings.key, e
            );
        }
    }

    async fn head_with_retry(&self, cursor: &mut Cursor, cancel: &CancellationToken) -> Option<u64> {
        loop {
            match self.adapter.current_height().await {
                Ok(head) => {
                    cursor.backoff.reset();
                    cursor.last_activity = Instant::now();
                    return Some(head);
                },
                Err(e) => {
                    let delay = cursor.backoff.next_delay();
                    warn!(
                        "[ENGINE] {}: head query failed (attempt {}): {}, retrying in {:?}",
                        self.settings.key,
                        cursor.backoff.attempts(),
                        e,
                        delay
                    );
                    if !sleep_or_cancel(cancel, delay).await {
                        return None;
                    }
                },
            }
        }
    }

    async fn logs_with_retry(
        &self,
        cursor: &mut Cursor,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Option<Vec<RawLog>> {
        loop {
            match get_logs_split(
                self.adapter.as_ref(),
                &self.settings.filter,
                from,
                to,
                &mut cursor.span,
            )
            .await
            {
                Ok(logs) => {
                    cursor.backoff.reset();
                    cursor.last_activity = Instant::now();
                    return Some(logs);
                },
                Err(e) => {
                    let delay = cursor.backoff.next_delay();
                    warn!(
                        "[BACKFILL] {}: log query {}..={} failed (attempt {}): {}, retrying in {:?}",
                        self.settings.key,
                        from,
                        to,
                        cursor.backoff.attempts(),
                        e,
                        delay
                    );
                    if !sleep_or_cancel(cancel, delay).await {
                        return None;
                    }
                },
            }
        }
    }
}

/// Remove and return every pending log whose block is below `block`.
fn take_below(pending: &mut PendingLogs, block: u64) -> PendingLogs {
    let rest = pending.split_off(&(block, 0, B256::ZERO));
    std::mem::replace(pending, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{mock_transfer, MockChain, MOCK_CONTRACT};
    use crate::db::MemoryWatermarkStore;
    use crate::worker::resolver::stub::{Behavior, StubResolver};
    use alloy::primitives::Address;

    #[derive(Default)]
    struct Recorder {
        records: std::sync::Mutex<Vec<TransferRecord>>,
    }

    impl Recorder {
        fn records(&self) -> Vec<TransferRecord> {
            self.records.lock().unwrap().clone()
        }

        fn ids(&self) -> Vec<(B256, u64)> {
            self.records()
                .iter()
                .map(|r| (r.transaction_hash, r.log_index))
                .collect()
        }
    }

    impl Dispatch for Recorder {
        fn dispatch(&self, record: TransferRecord) {
            self.records.lock().unwrap().push(record);
        }
    }

    fn settings(start_block: u64, confirmation_depth: u64, chunk_size: u64) -> EngineSettings {
        EngineSettings {
            key: WatermarkKey::new(1, &hex_encode(MOCK_CONTRACT.as_slice())),
            filter: LogFilter::transfers(MOCK_CONTRACT),
            start_block,
            confirmation_depth,
            chunk_size,
            poll_interval: Duration::from_millis(10),
            staleness_timeout: Duration::from_secs(30),
            dedup_margin: 64,
            dedup_capacity: 10_000,
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(5),
        }
    }

    struct Harness {
        engine: Arc<ReconciliationEngine>,
        recorder: Arc<Recorder>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    impl Harness {
        fn start(
            chain: Arc<MockChain>,
            store: Arc<MemoryWatermarkStore>,
            behavior: Behavior,
            settings: EngineSettings,
        ) -> Self {
            let normalizer = Normalizer::new(
                chain.clone(),
                Arc::new(StubResolver::new(behavior)),
                Duration::from_millis(50),
                Duration::from_millis(50),
            );
            let recorder = Arc::new(Recorder::default());
            let engine = Arc::new(ReconciliationEngine::new(
                chain,
                normalizer,
                recorder.clone(),
                store,
                settings,
            ));

            let cancel = CancellationToken::new();
            let runner = engine.clone();
            let token = cancel.clone();
            let handle = tokio::spawn(async move { runner.run(token).await });

            Self {
                engine,
                recorder,
                cancel,
                handle,
            }
        }

        async fn wait_for(&self, what: &str, check: impl Fn(&EngineStatus, &[TransferRecord]) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let status = self.engine.status().await;
                if check(&status, &self.recorder.records()) {
                    return;
                }
                assert!(Instant::now() < deadline, "timed out waiting for {what}: {status:?}");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn stop(self) -> Vec<TransferRecord> {
            self.cancel.cancel();
            self.handle.await.unwrap().unwrap();
            self.recorder.records()
        }
    }

    fn assert_unique(records: &[TransferRecord]) {
        let mut ids: Vec<_> = records.iter().map(|r| r.id()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total, "duplicate emission");
    }

    #[tokio::test]
    async fn test_backfill_emits_in_order_and_confirms() {
        let chain = Arc::new(MockChain::new(105));
        let sender = Address::repeat_byte(0x11);
        chain.push_log(mock_transfer(101, 0, 0xaa, sender, 1));
        chain.push_log(mock_transfer(101, 0, 0xbb, sender, 2));
        chain.push_log(mock_transfer(104, 0, 0xcc, Address::ZERO, 3));
        let store = Arc::new(MemoryWatermarkStore::new());

        let harness = Harness::start(chain.clone(), store.clone(), Behavior::Name("doma"), settings(100, 2, 2_000));

        harness
            .wait_for("backfill to 103", |s, _| s.state == EngineState::Live && s.watermark == Some(103))
            .await;
        assert_eq!(harness.recorder.records().len(), 2);

        chain.set_head(107);
        harness
            .wait_for("C to confirm", |s, r| r.len() == 3 && s.watermark >= Some(104))
            .await;

        let records = harness.stop().await;
        assert_eq!(
            records.iter().map(|r| r.transaction_hash).collect::<Vec<_>>(),
            vec![B256::repeat_byte(0xaa), B256::repeat_byte(0xbb), B256::repeat_byte(0xcc)]
        );
        assert!(!records[0].is_mint);
        assert!(!records[1].is_mint);
        assert!(records[2].is_mint);
        assert_eq!(records[2].domain_name.as_deref(), Some("3.doma"));
        assert!(records.iter().all(|r| r.source == EventSource::History));

        let key = WatermarkKey::new(1, &hex_encode(MOCK_CONTRACT.as_slice()));
        let persisted = store.load(&key).await.unwrap().unwrap();
        assert!(persisted.last_confirmed_block >= 104);
    }

    #[tokio::test]
    async fn test_live_replay_overlapping_backfill_is_not_reemitted() {
        let chain = Arc::new(MockChain::new(110));
        let first = mock_transfer(105, 0, 0x01, Address::ZERO, 1);
        let second = mock_transfer(108, 1, 0x02, Address::ZERO, 2);
        chain.push_log(first.clone());
        chain.push_log(second.clone());
        let feed = chain.live_feed();
        let store = Arc::new(MemoryWatermarkStore::new());

        let harness = Harness::start(chain.clone(), store, Behavior::Missing, settings(100, 0, 3));
        harness
            .wait_for("backfill", |s, r| s.state == EngineState::Live && r.len() == 2)
            .await;

        // The subscription re-announces both after a reconnect, then a new one.
        let third = mock_transfer(111, 0, 0x03, Address::ZERO, 3);
        feed.send(first).unwrap();
        feed.send(second).unwrap();
        feed.send(third.clone()).unwrap();
        chain.push_log(third);
        chain.set_head(111);

        harness
            .wait_for("third record", |s, r| r.len() == 3 && s.watermark == Some(111))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = harness.stop().await;
        assert_eq!(records.len(), 3);
        assert_unique(&records);
    }

    #[tokio::test]
    async fn test_out_of_order_live_arrival_is_emitted_in_log_order() {
        let chain = Arc::new(MockChain::new(100));
        let feed = chain.live_feed();
        let store = Arc::new(MemoryWatermarkStore::new());

        let harness = Harness::start(chain.clone(), store, Behavior::Missing, settings(100, 3, 2_000));
        harness.wait_for("live", |s, _| s.state == EngineState::Live).await;

        let later = mock_transfer(101, 2, 0x0b, Address::ZERO, 2);
        let earlier = mock_transfer(101, 1, 0x0a, Address::ZERO, 1);
        let next_block = mock_transfer(102, 0, 0x0c, Address::ZERO, 3);
        for log in [&later, &earlier, &next_block] {
            chain.push_log(log.clone());
        }
        feed.send(later).unwrap();
        feed.send(earlier).unwrap();
        feed.send(next_block).unwrap();

        chain.set_head(102);
        harness.wait_for("blocks 101 and 102", |_, r| r.len() == 3).await;
        chain.set_head(110);
        harness
            .wait_for("everything confirmed", |s, r| r.len() == 3 && s.watermark == Some(107))
            .await;

        let records = harness.stop().await;
        assert_eq!(
            records.iter().map(|r| r.position()).collect::<Vec<_>>(),
            vec![(101, 1), (101, 2), (102, 0)]
        );
        assert_unique(&records);
    }

    #[tokio::test]
    async fn test_live_block_gap_filled_in_log_order() {
        let chain = Arc::new(MockChain::new(100));
        let feed = chain.live_feed();
        let store = Arc::new(MemoryWatermarkStore::new());

        let missed = mock_transfer(101, 1, 0x0a, Address::ZERO, 1);
        let pushed = mock_transfer(101, 2, 0x0b, Address::ZERO, 2);
        let next_block = mock_transfer(102, 0, 0x0c, Address::ZERO, 3);
        for log in [&missed, &pushed, &next_block] {
            chain.push_log(log.clone());
        }

        let harness = Harness::start(chain.clone(), store, Behavior::Missing, settings(100, 3, 2_000));
        harness.wait_for("live", |s, _| s.state == EngineState::Live).await;

        // The push path never delivers (101, 1).
        feed.send(pushed).unwrap();
        feed.send(next_block).unwrap();
        chain.set_head(102);

        harness.wait_for("unconfirmed blocks", |_, r| r.len() == 3).await;
        assert_eq!(
            harness.recorder.records().iter().map(|r| r.position()).collect::<Vec<_>>(),
            vec![(101, 1), (101, 2), (102, 0)]
        );
        assert_eq!(harness.engine.status().await.watermark, Some(99));

        chain.set_head(110);
        harness
            .wait_for("everything confirmed", |s, _| s.watermark == Some(107))
            .await;

        let records = harness.stop().await;
        assert_eq!(records.len(), 3);
        assert_unique(&records);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_persisted_watermark() {
        let chain = Arc::new(MockChain::new(160));
        chain.push_log(mock_transfer(105, 0, 0x01, Address::ZERO, 1));
        chain.push_log(mock_transfer(150, 0, 0x02, Address::ZERO, 2));
        chain.push_log(mock_transfer(190, 0, 0x03, Address::ZERO, 3));
        let store = Arc::new(MemoryWatermarkStore::new());

        let first_run = Harness::start(chain.clone(), store.clone(), Behavior::Missing, settings(100, 0, 10));
        first_run
            .wait_for("first run", |s, _| s.watermark == Some(160))
            .await;
        let before = first_run.stop().await;
        let ranges_before = chain.accepted_ranges().len();

        chain.set_head(200);
        let second_run = Harness::start(chain.clone(), store.clone(), Behavior::Missing, settings(100, 0, 10));
        second_run
            .wait_for("second run", |s, _| s.watermark == Some(200))
            .await;
        let after = second_run.stop().await;

        assert_eq!(before.len(), 2);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].block_number, 190);
        assert!(chain.accepted_ranges()[ranges_before..]
            .iter()
            .all(|(from, _)| *from >= 161));

        let mut all = before;
        all.extend(after);
        assert_unique(&all);
    }

    #[tokio::test]
    async fn test_failing_resolver_never_stalls() {
        let chain = Arc::new(MockChain::new(50));
        for block in 10..20 {
            chain.push_log(mock_transfer(block, 0, block as u8, Address::ZERO, block));
        }
        let store = Arc::new(MemoryWatermarkStore::new());

        let harness = Harness::start(chain, store, Behavior::Fail, settings(0, 0, 5));
        harness
            .wait_for("all records", |s, r| r.len() == 10 && s.watermark == Some(50))
            .await;

        let records = harness.stop().await;
        assert!(records.iter().all(|r| r.domain_name.is_none()));
    }

    #[tokio::test]
    async fn test_backfill_survives_endpoint_outage_and_range_limits() {
        let chain = Arc::new(MockChain::new(1_000));
        chain.push_log(mock_transfer(10, 0, 0x01, Address::ZERO, 1));
        chain.push_log(mock_transfer(990, 0, 0x02, Address::ZERO, 2));
        chain.fail_next_heights(3);
        chain.fail_next_log_queries(2);
        chain.set_max_span(Some(300));
        let store = Arc::new(MemoryWatermarkStore::new());

        let harness = Harness::start(chain.clone(), store, Behavior::Missing, settings(0, 0, 2_000));
        harness
            .wait_for("backfill", |s, r| r.len() == 2 && s.watermark == Some(1_000))
            .await;
        harness.stop().await;

        assert!(chain
            .accepted_ranges()
            .iter()
            .all(|(from, to)| to - from + 1 <= 300));
    }

    #[tokio::test]
    async fn test_removed_log_triggers_recovery() {
        let chain = Arc::new(MockChain::new(100));
        let feed = chain.live_feed();
        let store = Arc::new(MemoryWatermarkStore::new());

        let harness = Harness::start(chain.clone(), store, Behavior::Missing, settings(90, 5, 2_000));
        harness.wait_for("live", |s, _| s.state == EngineState::Live).await;

        let mut reorged = mock_transfer(99, 0, 0x09, Address::ZERO, 1);
        reorged.removed = true;
        feed.send(reorged).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while chain.streams_opened() < 2 {
            assert!(Instant::now() < deadline, "engine never resubscribed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        harness.wait_for("live again", |s, _| s.state == EngineState::Live).await;

        let records = harness.stop().await;
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_stale_endpoint_triggers_recovery() {
        let chain = Arc::new(MockChain::new(100));
        let store = Arc::new(MemoryWatermarkStore::new());
        let mut settings = settings(90, 5, 2_000);
        settings.staleness_timeout = Duration::from_millis(100);

        let harness = Harness::start(chain.clone(), store, Behavior::Missing, settings);
        harness.wait_for("live", |s, _| s.state == EngineState::Live).await;

        chain.fail_next_heights(200);
        harness
            .wait_for("recovery", |s, _| s.state == EngineState::Recovering)
            .await;
        harness.wait_for("live again", |s, _| s.state == EngineState::Live).await;
        assert!(chain.streams_opened() >= 2);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_block_hash_change_triggers_recovery() {
        let chain = Arc::new(MockChain::new(100));
        let feed = chain.live_feed();
        let store = Arc::new(MemoryWatermarkStore::new());
        let canonical = mock_transfer(101, 0, 0x0a, Address::ZERO, 1);
        chain.push_log(canonical.clone());

        let harness = Harness::start(chain.clone(), store, Behavior::Missing, settings(100, 3, 2_000));
        harness.wait_for("live", |s, _| s.state == EngineState::Live).await;

        // Same log announced from a competing block 101.
        let mut forked = canonical;
        forked.block_hash = Some(B256::repeat_byte(0xee));
        chain.set_head(101);
        feed.send(forked).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while chain.streams_opened() < 2 {
            assert!(Instant::now() < deadline, "engine never resubscribed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        harness.wait_for("live again", |s, _| s.state == EngineState::Live).await;
        assert!(harness.recorder.records().is_empty());

        chain.set_head(110);
        harness
            .wait_for("canonical log confirmed", |s, r| r.len() == 1 && s.watermark == Some(107))
            .await;

        let records = harness.stop().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].block_number, 101);
        assert_eq!(records[0].source, EventSource::History);
    }

    #[tokio::test]
    async fn test_shutdown_persists_watermark() {
        let chain = Arc::new(MockChain::new(30));
        let store = Arc::new(MemoryWatermarkStore::new());

        let harness = Harness::start(chain, store.clone(), Behavior::Missing, settings(0, 0, 10));
        harness.wait_for("caught up", |s, _| s.watermark == Some(30)).await;
        harness.stop().await;

        let key = WatermarkKey::new(1, &hex_encode(MOCK_CONTRACT.as_slice()));
        assert_eq!(store.load(&key).await.unwrap().unwrap().last_confirmed_block, 30);
    }
}
