use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resumable ingestion position for one contract on one chain.
///
/// `last_confirmed_block` is the highest height whose transfers have all been
/// emitted. On restart ingestion resumes at `last_confirmed_block + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub chain_id: u64,
    /// Lowercase 0x-prefixed hex.
    pub contract_address: String,
    pub last_confirmed_block: u64,
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(key: &WatermarkKey, last_confirmed_block: u64) -> Self {
        Self {
            chain_id: key.chain_id,
            contract_address: key.contract_address.clone(),
            last_confirmed_block,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> WatermarkKey {
        WatermarkKey {
            chain_id: self.chain_id,
            contract_address: self.contract_address.clone(),
        }
    }
}

/// What a watermark applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatermarkKey {
    pub chain_id: u64,
    pub contract_address: String,
}

impl WatermarkKey {
    pub fn new(chain_id: u64, contract_address: &str) -> Self {
        Self {
            chain_id,
            contract_address: contract_address.to_lowercase(),
        }
    }
}

impl std::fmt::Display for WatermarkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.contract_address)
    }
}
