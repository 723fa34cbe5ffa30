use std::time::Duration;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde::Serialize;

use super::Sink;
use crate::{
    config::AutoListSettings,
    db::models::TransferRecord,
    utils::{hex_encode, ZERO_ADDRESS},
};

const ORDERBOOK: &str = "DOMA";
const ZERO_BYTES32: B256 = B256::ZERO;

/// Seaport item kinds used by a fixed-price listing.
const ITEM_NATIVE: u8 = 0;
const ITEM_ERC721: u8 = 2;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingRequest {
    pub orderbook: &'static str,
    pub chain_id: String,
    pub parameters: OrderParameters,
    pub signature: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderParameters {
    pub offerer: String,
    pub zone: String,
    pub order_type: u8,
    pub start_time: String,
    pub end_time: String,
    pub zone_hash: String,
    pub salt: String,
    pub offer: Vec<OfferItem>,
    pub consideration: Vec<ConsiderationItem>,
    pub total_original_consideration_items: usize,
    pub conduit_key: String,
    pub counter: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferItem {
    pub item_type: u8,
    pub token: String,
    pub identifier: String,
    pub start_amount: String,
    pub end_amount: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsiderationItem {
    pub item_type: u8,
    pub token: String,
    pub identifier: String,
    pub start_amount: String,
    pub end_amount: String,
    pub recipient: String,
}

/// Lists freshly received domains on the marketplace orderbook at a fixed
/// price, with the recipient as offerer.
pub struct AutoLister {
    client: reqwest::Client,
    endpoint: String,
    contract: Address,
    settings: AutoListSettings,
}

impl AutoLister {
    pub fn new(
        settings: &AutoListSettings,
        contract: Address,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!(
            "{}/v1/orderbook/list",
            settings.api_base.trim_end_matches('/')
        );

        Ok(Self {
            client,
            endpoint,
            contract,
            settings: settings.clone(),
        })
    }

    pub fn build_order(
        &self,
        record: &TransferRecord,
        start_time: u64,
        salt: B256,
    ) -> ListingRequest {
        let offerer = hex_encode(record.to_address.as_slice());
        let price = self.settings.price_wei.clone();

        ListingRequest {
            orderbook: ORDERBOOK,
            chain_id: self.settings.caip_chain_id.clone(),
            parameters: OrderParameters {
                offerer: offerer.clone(),
                zone: ZERO_ADDRESS.to_string(),
                order_type: 0,
                start_time: start_time.to_string(),
                end_time: start_time
                    .saturating_add(self.settings.duration_secs)
                    .to_string(),
                zone_hash: ZERO_BYTES32.to_string(),
                salt: salt.to_string(),
                offer: vec![OfferItem {
                    item_type: ITEM_ERC721,
                    token: hex_encode(self.contract.as_slice()),
                    identifier: record.token_id.to_string(),
                    start_amount: "1".to_string(),
                    end_amount: "1".to_string(),
                }],
                consideration: vec![ConsiderationItem {
                    item_type: ITEM_NATIVE,
                    token: ZERO_ADDRESS.to_string(),
                    identifier: "0".to_string(),
                    start_amount: price.clone(),
                    end_amount: price,
                    recipient: offerer,
                }],
                total_original_consideration_items: 1,
                conduit_key: ZERO_BYTES32.to_string(),
                counter: "0".to_string(),
            },
            signature: self.settings.signature.clone(),
        }
    }

    fn wants(&self, record: &TransferRecord) -> bool {
        !self.settings.only_mints || record.is_mint
    }
}

#[async_trait]
impl Sink for AutoLister {
    fn name(&self) -> &'static str {
        "autolist"
    }

    async fn deliver(&self, record: &TransferRecord) -> anyhow::Result<()> {
        if !self.wants(record) {
            debug!("[AUTOLIST] Skipping non-mint {}", record.id());
            return Ok(());
        }

        let start_time = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        let salt = B256::from(rand::random::<[u8; 32]>());
        let order = self.build_order(record, start_time, salt);

        self.client
            .post(&self.endpoint)
            .header("Api-Key", &self.settings.api_key)
            .json(&order)
            .send()
            .await?
            .error_for_status()?;

        info!(
            "[AUTOLIST] Listed {} (token {}) for {}",
            record.domain_name.as_deref().unwrap_or("unnamed domain"),
            record.token_id,
            order.parameters.offerer
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::U256;
    use serde_json::json;

    use super::*;
    use crate::db::models::EventSource;

    fn settings() -> AutoListSettings {
        AutoListSettings {
            api_base: "https://api-testnet.doma.xyz/".to_string(),
            api_key: "key".to_string(),
            caip_chain_id: "eip155:11155111".to_string(),
            price_wei: "20000000000000000".to_string(),
            duration_secs: 604_800,
            only_mints: true,
            signature: format!("0x{:f>130}", "deadbeef"),
        }
    }

    fn record(is_mint: bool) -> TransferRecord {
        TransferRecord {
            from_address: if is_mint { Address::ZERO } else { Address::repeat_byte(0x33) },
            to_address: Address::repeat_byte(0x22),
            token_id: U256::from(77u64),
            domain_name: Some("alice.doma".to_string()),
            block_number: 104,
            block_timestamp: None,
            transaction_hash: B256::repeat_byte(0xcc),
            log_index: 0,
            is_mint,
            source: EventSource::Live,
        }
    }

    fn lister() -> AutoLister {
        AutoLister::new(&settings(), Address::repeat_byte(0x99), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_order_lists_token_for_recipient() {
        let lister = lister();
        let order = lister.build_order(&record(true), 1_700_000_000, B256::repeat_byte(0x05));
        let json = serde_json::to_value(&order).unwrap();

        let recipient = "0x2222222222222222222222222222222222222222";
        assert_eq!(json["orderbook"], "DOMA");
        assert_eq!(json["chainId"], "eip155:11155111");
        assert_eq!(json["parameters"]["offerer"], recipient);
        assert_eq!(json["parameters"]["startTime"], "1700000000");
        assert_eq!(json["parameters"]["endTime"], "1700604800");
        assert_eq!(json["parameters"]["salt"], format!("0x{}", "05".repeat(32)));
        assert_eq!(json["parameters"]["zone"], ZERO_ADDRESS);
        assert_eq!(
            json["parameters"]["offer"],
            json!([{
                "itemType": 2,
                "token": "0x9999999999999999999999999999999999999999",
                "identifier": "77",
                "startAmount": "1",
                "endAmount": "1",
            }])
        );
        assert_eq!(json["parameters"]["consideration"][0]["recipient"], recipient);
        assert_eq!(
            json["parameters"]["consideration"][0]["startAmount"],
            "20000000000000000"
        );
        assert_eq!(json["parameters"]["totalOriginalConsiderationItems"], 1);
        assert_eq!(json["parameters"]["counter"], "0");

        let signature = json["signature"].as_str().unwrap();
        assert_eq!(signature.len(), 132);
        assert!(signature.ends_with("ffdeadbeef"));
    }

    #[test]
    fn test_only_mints_filter() {
        let lister = lister();
        assert!(lister.wants(&record(true)));
        assert!(!lister.wants(&record(false)));

        let mut all = settings();
        all.only_mints = false;
        let lister = AutoLister::new(&all, Address::ZERO, Duration::from_secs(1)).unwrap();
        assert!(lister.wants(&record(false)));
    }

    #[tokio::test]
    async fn test_non_mint_is_skipped_without_request() {
        let mut unreachable = settings();
        unreachable.api_base = "http://127.0.0.1:1".to_string();
        let lister =
            AutoLister::new(&unreachable, Address::ZERO, Duration::from_millis(200)).unwrap();

        lister.deliver(&record(false)).await.unwrap();
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        assert_eq!(lister().endpoint, "https://api-testnet.doma.xyz/v1/orderbook/list");
    }
}
