//! 24-bit INSTEON device addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors from parsing a device address.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressParseError {
    /// Input was not 6 hex digits (with or without dot separators).
    #[error("invalid device address '{0}': expected 6 hex digits")]
    Malformed(String),
}

/// A 24-bit INSTEON device identifier.
///
/// The all-zero address is a sentinel meaning "no device": it shows up as the
/// target of hub-addressed commands and in broadcast contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress([u8; 3]);

impl DeviceAddress {
    /// The "no device" sentinel (00.00.00).
    pub const NONE: DeviceAddress = DeviceAddress([0, 0, 0]);

    /// Create an address from its three id bytes, high byte first.
    pub const fn new(high: u8, middle: u8, low: u8) -> Self {
        DeviceAddress([high, middle, low])
    }

    /// Create an address from a 3-byte slice.
    ///
    /// Returns `None` when the slice is not exactly 3 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 3] = bytes.try_into().ok()?;
        Some(DeviceAddress(arr))
    }

    /// The raw id bytes, high byte first.
    pub const fn bytes(&self) -> [u8; 3] {
        self.0
    }

    /// Whether this is the "no device" sentinel.
    pub const fn is_none(&self) -> bool {
        self.0[0] == 0 && self.0[1] == 0 && self.0[2] == 0
    }

    /// Six uppercase hex digits, no separators (the form used on the wire).
    pub fn to_hex(&self) -> String {
        format!("{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{:02X}.{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    /// Accepts `AA.BB.CC` or `AABBCC`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != '.').collect();
        if compact.len() != 6 {
            return Err(AddressParseError::Malformed(s.to_string()));
        }
        let bytes = hex::decode(&compact).map_err(|_| AddressParseError::Malformed(s.to_string()))?;
        Ok(DeviceAddress([bytes[0], bytes[1], bytes[2]]))
    }
}
