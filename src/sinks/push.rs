use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast::{self, error::RecvError},
};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::Sink;
use crate::{db::models::TransferRecord, utils::hex_encode};

/// JSON frame sent to every connected dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub from: String,
    pub to: String,
    pub token_id: String,
    pub block_number: u64,
    pub timestamp: Option<u64>,
    pub domain_name: Option<String>,
    pub is_mint: bool,
    pub is_live: bool,
    pub transaction_hash: String,
    pub log_index: u64,
}

impl From<&TransferRecord> for PushPayload {
    fn from(record: &TransferRecord) -> Self {
        Self {
            from: hex_encode(record.from_address.as_slice()),
            to: hex_encode(record.to_address.as_slice()),
            token_id: record.token_id.to_string(),
            block_number: record.block_number,
            timestamp: record.block_timestamp,
            domain_name: record.domain_name.clone(),
            is_mint: record.is_mint,
            is_live: record.is_live(),
            transaction_hash: hex_encode(record.transaction_hash.as_slice()),
            log_index: record.log_index,
        }
    }
}

/// Broadcast side of the push channel. Having no listeners is not a failure.
#[derive(Clone)]
pub struct PushChannel {
    tx: broadcast::Sender<String>,
}

impl PushChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Sink for PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn deliver(&self, record: &TransferRecord) -> anyhow::Result<()> {
        let frame = serde_json::to_string(&PushPayload::from(record))?;
        let reached = self.tx.send(frame).unwrap_or(0);
        debug!("[PUSH] {} sent to {} listener(s)", record.id(), reached);
        Ok(())
    }
}

/// WebSocket listener feeding connected clients from a [`PushChannel`].
pub struct PushServer {
    listener: TcpListener,
    channel: PushChannel,
}

impl PushServer {
    pub async fn bind(addr: &str, channel: PushChannel) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind push channel on {addr}"))?;
        Ok(Self { listener, channel })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        info!("[PUSH] Listening on ws://{}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let rx = self.channel.subscribe();
                        let token = cancellation_token.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = serve_client(stream, peer, rx, token).await {
                                debug!("[PUSH] Client {} ended: {:#}", peer, e);
                            }
                        });
                    },
                    Err(e) => warn!("[PUSH] Accept failed: {}", e),
                },
            }
        }

        info!("[PUSH] Listener stopped");
        Ok(())
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<String>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut outgoing, mut incoming) = ws.split();
    info!("[PUSH] Client connected: {}", peer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = outgoing.send(Message::Close(None)).await;
                break;
            },
            frame = rx.recv() => match frame {
                Ok(text) => outgoing.send(Message::Text(text)).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[PUSH] Client {} lagging, skipped {} frame(s)", peer, skipped);
                },
                Err(RecvError::Closed) => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {},
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }

    info!("[PUSH] Client disconnected: {}", peer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy::primitives::{Address, B256, U256};

    use super::*;
    use crate::db::models::EventSource;

    fn record() -> TransferRecord {
        TransferRecord {
            from_address: Address::ZERO,
            to_address: Address::repeat_byte(0xab),
            token_id: U256::from(10).pow(U256::from(30)),
            domain_name: Some("alice.doma".to_string()),
            block_number: 104,
            block_timestamp: Some(1_700_001_248),
            transaction_hash: B256::repeat_byte(0xcc),
            log_index: 3,
            is_mint: true,
            source: EventSource::Live,
        }
    }

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(PushPayload::from(&record())).unwrap();

        assert_eq!(json["from"], "0x0000000000000000000000000000000000000000");
        assert_eq!(json["to"], "0xabababababababababababababababababababab");
        assert_eq!(json["tokenId"], "1000000000000000000000000000000");
        assert_eq!(json["blockNumber"], 104);
        assert_eq!(json["timestamp"], 1_700_001_248u64);
        assert_eq!(json["domainName"], "alice.doma");
        assert_eq!(json["isMint"], true);
        assert_eq!(json["isLive"], true);
        assert_eq!(json["logIndex"], 3);
    }

    #[tokio::test]
    async fn test_delivery_without_listeners_succeeds() {
        let channel = PushChannel::new(8);
        assert_eq!(channel.listeners(), 0);
        channel.deliver(&record()).await.unwrap();
    }

    #[tokio::test]
    async fn test_connected_client_receives_frames() {
        let channel = PushChannel::new(8);
        let server = PushServer::bind("127.0.0.1:0", channel.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(server.run(cancel.clone()));

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while channel.listeners() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "client never registered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        channel.deliver(&record()).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(json["domainName"], "alice.doma");

        cancel.cancel();
        server_task.await.unwrap().unwrap();
    }
}
