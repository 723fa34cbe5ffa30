use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use log::debug;
use serde::Serialize;

use super::Sink;
use crate::{config::TelegramSettings, db::models::TransferRecord, utils::hex_encode};

const DIVIDER: &str = "────────────────────────";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Posts a Markdown alert per transfer to a Telegram chat.
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
    explorer_base_url: String,
}

impl TelegramNotifier {
    pub fn new(settings: &TelegramSettings, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!(
            "{}/bot{}/sendMessage",
            settings.api_base.trim_end_matches('/'),
            settings.bot_token
        );

        Ok(Self {
            client,
            endpoint,
            chat_id: settings.chat_id.clone(),
            explorer_base_url: settings.explorer_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Sink for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, record: &TransferRecord) -> anyhow::Result<()> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: format_message(record, &self.explorer_base_url),
            parse_mode: "Markdown",
            disable_web_page_preview: true,
        };

        self.client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        debug!("[TELEGRAM] Alert sent for {}", record.id());
        Ok(())
    }
}

/// Renders the alert text with explorer links for both parties, the block and
/// the transaction.
pub fn format_message(record: &TransferRecord, explorer: &str) -> String {
    let from = hex_encode(record.from_address.as_slice());
    let to = hex_encode(record.to_address.as_slice());
    let tx = hex_encode(record.transaction_hash.as_slice());
    let kind = if record.is_mint { "Mint" } else { "Transfer" };
    let time = record
        .block_timestamp
        .and_then(|ts| DateTime::from_timestamp(i64::try_from(ts).ok()?, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "N/A".to_string());

    let mut lines = vec![
        "*DOMAIN TRANSFER ALERT*".to_string(),
        DIVIDER.to_string(),
        format!("*Type:* {kind}"),
        format!("*From:* [{from}]({explorer}/address/{from})"),
        format!("*To:* [{to}]({explorer}/address/{to})"),
        format!("*Token ID:* `{}`", record.token_id),
        format!("*Domain:* `{}`", record.domain_name.as_deref().unwrap_or("N/A")),
        format!(
            "*Block:* [{n}]({explorer}/block/{n})",
            n = record.block_number
        ),
        format!("*Time:* {time}"),
        format!("*Tx:* [View Transaction]({explorer}/tx/{tx})"),
    ];

    if record.is_live() {
        lines.push("_live_".to_string());
    }

    lines.join("\n")
}
