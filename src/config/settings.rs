use std::{net::SocketAddr, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use url::Url;

use crate::utils::parse_address;

/// Environment variable that points at an alternative config file.
const CONFIG_PATH_VAR: &str = "DOMWATCH_CONFIG";

/// Chain endpoint and tracked registry contract.
#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
    pub chain_id: u64,
    /// HTTP JSON-RPC endpoints, tried round-robin on transport failure.
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    /// Push subscriptions use this endpoint; without it they are emulated by
    /// polling.
    #[serde(default)]
    pub ws_url: Option<String>,
    pub contract_address: String,
    /// First block scanned when no watermark has been persisted.
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

/// Backfill, confirmation and de-duplication tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestionSettings {
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_staleness_timeout_secs")]
    pub staleness_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Extra blocks kept in the dedup window below the confirmed range.
    #[serde(default = "default_dedup_margin_blocks")]
    pub dedup_margin_blocks: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_resolver_timeout_ms")]
    pub resolver_timeout_ms: u64,
    #[serde(default = "default_timestamp_timeout_ms")]
    pub timestamp_timeout_ms: u64,
}

fn default_confirmation_depth() -> u64 {
    12
}

fn default_chunk_size() -> u64 {
    2_000
}

fn default_staleness_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_dedup_margin_blocks() -> u64 {
    64
}

fn default_dedup_capacity() -> usize {
    100_000
}

fn default_resolver_timeout_ms() -> u64 {
    3_000
}

fn default_timestamp_timeout_ms() -> u64 {
    1_500
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            confirmation_depth: default_confirmation_depth(),
            chunk_size: default_chunk_size(),
            staleness_timeout_secs: default_staleness_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            dedup_margin_blocks: default_dedup_margin_blocks(),
            dedup_capacity: default_dedup_capacity(),
            resolver_timeout_ms: default_resolver_timeout_ms(),
            timestamp_timeout_ms: default_timestamp_timeout_ms(),
        }
    }
}

impl IngestionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_secs(self.staleness_timeout_secs)
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver_timeout_ms)
    }

    pub fn timestamp_timeout(&self) -> Duration {
        Duration::from_millis(self.timestamp_timeout_ms)
    }
}

/// PostgreSQL connection used by the `postgres` watermark backend.
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Postgres,
    Memory,
}

/// Where the watermark is persisted.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default)]
    pub postgres: Option<PostgresSettings>,
}

fn default_storage_path() -> String {
    "watermark.json".to_string()
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            postgres: None,
        }
    }
}

/// WebSocket push channel for live dashboards.
#[derive(Debug, Deserialize, Clone)]
pub struct PushSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "0.0.0.0:4001".to_string()
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_listen_addr(),
        }
    }
}

/// Telegram bot notifications.
#[derive(Debug, Deserialize, Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default = "default_explorer_base_url")]
    pub explorer_base_url: String,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

fn default_explorer_base_url() -> String {
    "https://explorer-testnet.doma.xyz".to_string()
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

/// Marketplace auto-listing of received domains.
#[derive(Debug, Deserialize, Clone)]
pub struct AutoListSettings {
    pub api_base: String,
    pub api_key: String,
    #[serde(default = "default_caip_chain_id")]
    pub caip_chain_id: String,
    /// Listing price in wei, as a decimal string.
    #[serde(default = "default_price_wei")]
    pub price_wei: String,
    #[serde(default = "default_listing_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_true")]
    pub only_mints: bool,
    /// Pre-computed order signature sent with every listing.
    #[serde(default = "default_order_signature")]
    pub signature: String,
}

fn default_caip_chain_id() -> String {
    "eip155:11155111".to_string()
}

fn default_price_wei() -> String {
    "20000000000000000".to_string()
}

fn default_listing_duration_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_order_signature() -> String {
    format!("0x{:f>130}", "deadbeef")
}

/// Sink dispatcher fan-out.
#[derive(Debug, Deserialize, Clone)]
pub struct SinkSettings {
    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_sink_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub push: PushSettings,
    #[serde(default)]
    pub telegram: Option<TelegramSettings>,
    #[serde(default)]
    pub autolist: Option<AutoListSettings>,
}

fn default_sink_timeout_ms() -> u64 {
    5_000
}

fn default_sink_max_attempts() -> u32 {
    2
}

fn default_queue_capacity() -> usize {
    1_024
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_sink_timeout_ms(),
            max_attempts: default_sink_max_attempts(),
            queue_capacity: default_queue_capacity(),
            push: PushSettings::default(),
            telegram: None,
            autolist: None,
        }
    }
}

impl SinkSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Root application configuration.
///
/// Loaded from `config.yaml` (or the file named by `DOMWATCH_CONFIG`) and
/// overridden by `DOMWATCH_*` environment variables, e.g.
/// `DOMWATCH_SINKS__TELEGRAM__BOT_TOKEN`.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub chain: ChainSettings,
    #[serde(default)]
    pub ingestion: IngestionSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub sinks: SinkSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| "config".to_string());
        Self::from_path(&path)
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::with_name(path)).add_source(
            Environment::with_prefix("DOMWATCH")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("chain.rpc_urls")
                .try_parsing(true),
        );

        Self::load(builder)
    }

    fn load(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the pipeline cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.rpc_urls.iter().all(|url| url.trim().is_empty()) {
            return Err(ConfigError::Message(
                "chain.rpc_urls must contain at least one endpoint".to_string(),
            ));
        }
        for url in &self.chain.rpc_urls {
            check_url("chain.rpc_urls", url)?;
        }
        if let Some(ws_url) = &self.chain.ws_url {
            check_url("chain.ws_url", ws_url)?;
        }
        if parse_address(&self.chain.contract_address).is_none() {
            return Err(ConfigError::Message(format!(
                "chain.contract_address is not a 20-byte hex address: {}",
                self.chain.contract_address
            )));
        }
        if self.ingestion.chunk_size == 0 {
            return Err(ConfigError::Message(
                "ingestion.chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Postgres && self.storage.postgres.is_none() {
            return Err(ConfigError::Message(
                "storage.backend is postgres but storage.postgres is missing".to_string(),
            ));
        }
        if self.sinks.push.enabled && !is_listen_addr(&self.sinks.push.listen_addr) {
            return Err(ConfigError::Message(format!(
                "sinks.push.listen_addr is not a host:port address: {}",
                self.sinks.push.listen_addr
            )));
        }
        if let Some(telegram) = &self.sinks.telegram {
            check_url("sinks.telegram.api_base", &telegram.api_base)?;
            check_url("sinks.telegram.explorer_base_url", &telegram.explorer_base_url)?;
        }
        if let Some(autolist) = &self.sinks.autolist {
            check_url("sinks.autolist.api_base", &autolist.api_base)?;
            if autolist.price_wei.parse::<alloy::primitives::U256>().is_err() {
                return Err(ConfigError::Message(format!(
                    "sinks.autolist.price_wei is not a decimal amount: {}",
                    autolist.price_wei
                )));
            }
        }
        Ok(())
    }
}

fn check_url(field: &str, raw: &str) -> Result<(), ConfigError> {
    Url::parse(raw)
        .map(|_| ())
        .map_err(|e| ConfigError::Message(format!("{field} has an invalid URL {raw:?}: {e}")))
}

/// `ip:port` or `hostname:port`; names are resolved when the listener binds.
fn is_listen_addr(raw: &str) -> bool {
    raw.parse::<SocketAddr>().is_ok()
        || raw
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}
