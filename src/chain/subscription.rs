use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use log::{info, warn};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{get_logs_split, sleep_or_cancel, Backoff, ChainAdapter, LogFilter, LogStream, RawLog};

/// Items delivered by a [`LiveSubscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Log(RawLog),
    /// The transport was re-established and `from_block..=head` was replayed
    /// through `eth_getLogs`. The replayed logs precede this marker.
    Resumed { from_block: u64, head: u64, replayed: usize },
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// Largest span used for replay queries.
    pub replay_span: u64,
    pub channel_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            replay_span: 2_000,
            channel_capacity: 4_096,
        }
    }
}

/// Lazy, infinite, restartable log subscription.
///
/// A background pump owns the transport stream. When it drops, the pump
/// reconnects with full-jitter backoff, re-subscribes, and replays
/// `eth_getLogs` from the last height it delivered up to the new head before
/// resuming push delivery. Replay overlaps what was already delivered; the
/// consumer is expected to de-duplicate.
pub struct LiveSubscription {
    rx: mpsc::Receiver<LiveEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LiveSubscription {
    /// `resume_from` is the first height a replay would cover if the very
    /// first connection drops before delivering anything.
    pub fn spawn(
        adapter: Arc<dyn ChainAdapter>,
        filter: LogFilter,
        resume_from: u64,
        config: SubscriptionConfig,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let cancel = parent.child_token();

        let pump = Pump {
            adapter,
            filter,
            tx,
            last_delivered: resume_from,
            backoff: Backoff::new(config.reconnect_base, config.reconnect_cap),
            replay_span: config.replay_span,
        };
        let handle = tokio::spawn(pump.run(cancel.clone()));

        Self { rx, cancel, handle }
    }

    /// Next event, or `None` once the pump has stopped.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.rx.recv().await
    }

    pub async fn close(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum StreamEnd {
    Dropped,
    Stopped,
}

struct Pump {
    adapter: Arc<dyn ChainAdapter>,
    filter: LogFilter,
    tx: mpsc::Sender<LiveEvent>,
    last_delivered: u64,
    backoff: Backoff,
    replay_span: u64,
}

impl Pump {
    async fn run(mut self, cancel: CancellationToken) {
        let mut connected_before = false;

        while !cancel.is_cancelled() {
            match self.adapter.open_log_stream(&self.filter).await {
                Ok(stream) => {
                    // Subscribe first, then replay: the overlap is harmless,
                    // a gap would not be.
                    if connected_before {
                        match self.replay().await {
                            Ok(true) => {},
                            Ok(false) => return,
                            Err(e) => {
                                warn!("[LIVE] Replay after reconnect failed: {}", e);
                                if !self.wait(&cancel).await {
                                    return;
                                }
                                continue;
                            },
                        }
                    } else {
                        info!("[LIVE] Subscription established");
                    }

                    connected_before = true;
                    self.backoff.reset();

                    match self.forward(stream, &cancel).await {
                        StreamEnd::Stopped => return,
                        StreamEnd::Dropped => {
                            warn!(
                                "[LIVE] Transport dropped after block {}, reconnecting",
                                self.last_delivered
                            );
                        },
                    }
                },
                Err(e) => {
                    warn!("[LIVE] Failed to open subscription: {}", e);
                },
            }

            if !self.wait(&cancel).await {
                return;
            }
        }
    }

    async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.backoff.next_delay();
        if self.backoff.attempts() > 1 {
            warn!(
                "[LIVE] Reconnect attempt {} in {:?}",
                self.backoff.attempts(),
                delay
            );
        }
        sleep_or_cancel(cancel, delay).await
    }

    /// Returns `Ok(false)` when the consumer is gone.
    async fn replay(&mut self) -> Result<bool, super::ChainError> {
        let head = self.adapter.current_height().await?;
        let from_block = self.last_delivered;
        if head < from_block {
            return Ok(true);
        }

        let mut logs = get_logs_split(
            self.adapter.as_ref(),
            &self.filter,
            from_block,
            head,
            &mut self.replay_span,
        )
        .await?;
        logs.sort_by_key(RawLog::position);

        let replayed = logs.len();
        for log in logs {
            self.last_delivered = self.last_delivered.max(log.block_number);
            if self.tx.send(LiveEvent::Log(log)).await.is_err() {
                return Ok(false);
            }
        }
        self.last_delivered = self.last_delivered.max(head);

        info!(
            "[LIVE] Resumed: replayed {} log(s) from blocks {}..={}",
            replayed, from_block, head
        );

        Ok(self
            .tx
            .send(LiveEvent::Resumed {
                from_block,
                head,
                replayed,
            })
            .await
            .is_ok())
    }

    async fn forward(&mut self, mut stream: LogStream, cancel: &CancellationToken) -> StreamEnd {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Stopped,
                item = stream.next() => match item {
                    Some(log) => {
                        if !self.filter.matches(&log) {
                            continue;
                        }
                        self.last_delivered = self.last_delivered.max(log.block_number);
                        if self.tx.send(LiveEvent::Log(log)).await.is_err() {
                            return StreamEnd::Stopped;
                        }
                    },
                    None => return StreamEnd::Dropped,
                },
            }
        }
    }
}
