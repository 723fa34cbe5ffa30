//! Chain Endpoint Adapter.
//!
//! Wraps the node connection behind [`ChainAdapter`] (head height, log range
//! queries, block timestamps, raw push stream) and builds the restartable
//! [`LiveSubscription`] on top of it.

mod adapter;
mod backoff;
mod error;
mod rpc;
mod subscription;
mod types;

#[cfg(test)]
pub mod mock;

pub use adapter::{get_logs_split, ChainAdapter, LogStream};
pub use backoff::{sleep_or_cancel, Backoff};
pub use error::ChainError;
pub use rpc::RpcChainAdapter;
pub use subscription::{LiveEvent, LiveSubscription, SubscriptionConfig};
pub use types::{LogFilter, RawLog};
