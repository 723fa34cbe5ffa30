//! Best-effort delivery of reconciled transfers to external collaborators.
//!
//! - [`push`] - WebSocket broadcast for live dashboards
//! - [`telegram`] - Markdown alerts through the Telegram Bot API
//! - [`autolist`] - Fixed-price marketplace listing of received domains
//!
//! Sink failures are logged and never reach the reconciliation engine.

use std::{sync::Arc, time::Duration};

use alloy::primitives::Address;
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{config::SinkSettings, db::models::TransferRecord, worker::Dispatch};

pub mod autolist;
pub mod push;
pub mod telegram;

pub use autolist::AutoLister;
pub use push::{PushChannel, PushServer};
pub use telegram::TelegramNotifier;

/// Pause between attempts of the same delivery.
const RETRY_DELAY: Duration = Duration::from_millis(250);

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, record: &TransferRecord) -> anyhow::Result<()>;
}

/// Engine-facing side of the dispatcher. Never blocks: when the queue is full
/// the record is dropped for the sinks and a warning is logged.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<TransferRecord>,
}

impl Dispatch for DispatchHandle {
    fn dispatch(&self, record: TransferRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {},
            Err(TrySendError::Full(record)) => {
                warn!("[SINKS] Queue full, dropping delivery of {}", record.id());
            },
            Err(TrySendError::Closed(record)) => {
                debug!("[SINKS] Dispatcher stopped, dropping delivery of {}", record.id());
            },
        }
    }
}

/// Fans every queued record out to all sinks concurrently, one record at a
/// time so each sink sees records in emission order.
pub struct SinkDispatcher {
    rx: mpsc::Receiver<TransferRecord>,
    sinks: Vec<Arc<dyn Sink>>,
    timeout: Duration,
    max_attempts: u32,
}

impl SinkDispatcher {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, settings: &SinkSettings) -> (DispatchHandle, Self) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let dispatcher = Self {
            rx,
            sinks,
            timeout: settings.timeout(),
            max_attempts: settings.max_attempts.max(1),
        };
        (DispatchHandle { tx }, dispatcher)
    }

    /// Deliver until cancelled, then drain what is already queued.
    pub async fn run(mut self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        let names: Vec<_> = self.sinks.iter().map(|s| s.name()).collect();
        info!("[SINKS] Dispatching to: {}", names.join(", "));

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                record = self.rx.recv() => match record {
                    Some(record) => self.fan_out(&record).await,
                    None => return Ok(()),
                },
            }
        }

        self.rx.close();
        let mut drained = 0;
        while let Some(record) = self.rx.recv().await {
            self.fan_out(&record).await;
            drained += 1;
        }
        if drained > 0 {
            info!("[SINKS] Delivered {} queued record(s) during shutdown", drained);
        }
        Ok(())
    }

    async fn fan_out(&self, record: &TransferRecord) {
        join_all(
            self.sinks
                .iter()
                .map(|sink| self.deliver_with_retry(sink.as_ref(), record)),
        )
        .await;
    }

    async fn deliver_with_retry(&self, sink: &dyn Sink, record: &TransferRecord) -> bool {
        for attempt in 1..=self.max_attempts {
            let failure = match tokio::time::timeout(self.timeout, sink.deliver(record)).await {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!("timed out after {:?}", self.timeout),
            };

            warn!(
                "[SINKS] {} failed for {} (attempt {}/{}): {}",
                sink.name(),
                record.id(),
                attempt,
                self.max_attempts,
                failure
            );

            if attempt < self.max_attempts {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        false
    }
}

/// Sinks enabled by configuration plus the push server that still has to be
/// spawned.
pub struct SinkSet {
    pub sinks: Vec<Arc<dyn Sink>>,
    pub push_server: Option<PushServer>,
}

pub async fn build_sinks(settings: &SinkSettings, contract: Address) -> anyhow::Result<SinkSet> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    let mut push_server = None;

    if settings.push.enabled {
        let channel = PushChannel::new(settings.queue_capacity);
        let server = PushServer::bind(&settings.push.listen_addr, channel.clone()).await?;
        sinks.push(Arc::new(channel));
        push_server = Some(server);
    }

    if let Some(telegram) = &settings.telegram {
        sinks.push(Arc::new(TelegramNotifier::new(telegram, settings.timeout())?));
        info!("[SINKS] Telegram notifications enabled for chat {}", telegram.chat_id);
    }

    if let Some(autolist) = &settings.autolist {
        sinks.push(Arc::new(AutoLister::new(autolist, contract, settings.timeout())?));
        info!("[SINKS] Auto-listing enabled at {}", autolist.api_base);
    }

    if sinks.is_empty() {
        warn!("[SINKS] No sinks configured, reconciled transfers are only logged");
    }

    Ok(SinkSet { sinks, push_server })
}
