//! Type conversion and formatting utilities.

use alloy::primitives::{hex, Address, U256};
use serde::Serializer;

// ============================================
// Hex Encoding
// ============================================

/// Encode bytes as a lowercase hex string with 0x prefix.
pub fn hex_encode(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Shorten an address for human-facing text, e.g. `0x96db…6d81`.
pub fn short_address(address: &Address) -> String {
    let full = hex_encode(address.as_slice());
    format!("{}…{}", &full[..6], &full[full.len() - 4..])
}

// ============================================
// Addresses
// ============================================

/// Parse a 20-byte account identifier from its text hex form.
///
/// Letter case is ignored: mixed-case input is accepted without EIP-55
/// checksum validation, and the `0x` prefix is optional.
pub fn parse_address(text: &str) -> Option<Address> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.len() != 40 {
        return None;
    }

    let bytes = hex::decode(digits.to_ascii_lowercase()).ok()?;
    Some(Address::from_slice(&bytes))
}

// ============================================
// U256 Formatting
// ============================================

/// Serialize a U256 as a base-10 string.
///
/// Token ids routinely exceed 2^53, so consumers reading JSON numbers would
/// lose precision.
pub fn serialize_u256_decimal<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}
