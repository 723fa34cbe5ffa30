pub mod dedup;
pub mod engine;
pub mod normalizer;
pub mod resolver;

pub use dedup::DedupWindow;
pub use engine::{Dispatch, EngineSettings, EngineState, EngineStatus, ReconciliationEngine};
pub use normalizer::{NormalizeError, Normalizer};
pub use resolver::{CachedResolver, ContractDomainResolver, DomainResolver};
