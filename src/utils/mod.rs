//! Utility functions for the domwatch indexer.
//!
//! - [`conversion`] - Address parsing, hex encoding and 256-bit id formatting

mod conversion;

// ============================================
// Common Constants
// ============================================

/// The Ethereum zero address (0x0000000000000000000000000000000000000000)
/// Transfers from this address are mints.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

// ============================================
// Re-exports
// ============================================

pub use conversion::{hex_encode, parse_address, serialize_u256_decimal, short_address};
