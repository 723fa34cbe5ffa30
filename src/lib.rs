pub mod abis;
pub mod chain;
pub mod config;
pub mod db;
pub mod sinks;
pub mod utils;
pub mod worker;

pub use chain::{ChainAdapter, RpcChainAdapter};
pub use config::Settings;
pub use db::{open_watermark_store, WatermarkStore};
pub use sinks::{build_sinks, SinkDispatcher};
pub use worker::{CachedResolver, ContractDomainResolver, Normalizer, ReconciliationEngine};
