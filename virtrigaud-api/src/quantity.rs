//! Binary-suffix resource quantities.
//!
//! Quantities are stored as strings ("4Gi", "512Mi", "1073741824") so that
//! served-version conversion is lossless, and parsed to bytes on use.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity {0:?}")]
    Invalid(String),

    #[error("quantity {0:?} overflows u64 bytes")]
    Overflow(String),
}

/// A resource quantity such as "4Gi" or "512Mi".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(pub String);

impl Quantity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn from_mib(mib: u64) -> Self {
        Self(format!("{}Mi", mib))
    }

    pub fn from_gib(gib: u64) -> Self {
        Self(format!("{}Gi", gib))
    }

    /// Parse to bytes. Accepts plain byte counts and the binary suffixes
    /// Ki, Mi, Gi, Ti.
    pub fn as_bytes(&self) -> Result<u64, QuantityError> {
        parse_bytes(&self.0)
    }
}

impl Default for Quantity {
    fn default() -> Self {
        Quantity::new("0")
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn parse_bytes(s: &str) -> Result<u64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (digits, multiplier) = match s {
        _ if s.ends_with("Ki") => (&s[..s.len() - 2], 1u64 << 10),
        _ if s.ends_with("Mi") => (&s[..s.len() - 2], 1u64 << 20),
        _ if s.ends_with("Gi") => (&s[..s.len() - 2], 1u64 << 30),
        _ if s.ends_with("Ti") => (&s[..s.len() - 2], 1u64 << 40),
        _ => (s, 1u64),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| QuantityError::Invalid(s.to_string()))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| QuantityError::Overflow(s.to_string()))
}

/// Convert bytes to whole mebibytes, clamped to the 32-bit limit.
///
/// Providers take memory sizes as 32-bit MiB counts; anything larger is
/// clamped with a warning so a misconfigured class cannot wrap around.
pub fn bytes_to_mib_clamped(bytes: u64) -> u32 {
    let mib = bytes / (1 << 20);
    if mib > u32::MAX as u64 {
        warn!(bytes, mib, "memory quantity exceeds 32-bit MiB limit, clamping");
        u32::MAX
    } else {
        mib as u32
    }
}

/// Convert bytes to whole gibibytes, clamped to the 32-bit limit.
pub fn bytes_to_gib_clamped(bytes: u64) -> u32 {
    let gib = bytes / (1 << 30);
    if gib > u32::MAX as u64 {
        warn!(bytes, gib, "disk quantity exceeds 32-bit GiB limit, clamping");
        u32::MAX
    } else {
        gib as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(Quantity::new("4Gi").as_bytes().unwrap(), 4 << 30);
        assert_eq!(Quantity::new("512Mi").as_bytes().unwrap(), 512 << 20);
        assert_eq!(Quantity::new("1Ki").as_bytes().unwrap(), 1024);
        assert_eq!(Quantity::new("2Ti").as_bytes().unwrap(), 2 << 40);
        assert_eq!(Quantity::new("1048576").as_bytes().unwrap(), 1 << 20);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Quantity::new("").as_bytes(), Err(QuantityError::Empty));
        assert!(matches!(
            Quantity::new("4GiB").as_bytes(),
            Err(QuantityError::Invalid(_))
        ));
        assert!(matches!(
            Quantity::new("-1Gi").as_bytes(),
            Err(QuantityError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_overflow() {
        assert!(matches!(
            Quantity::new("99999999999Ti").as_bytes(),
            Err(QuantityError::Overflow(_))
        ));
    }

    #[test]
    fn test_mib_clamp() {
        assert_eq!(bytes_to_mib_clamped(4 << 30), 4096);
        assert_eq!(bytes_to_mib_clamped(u64::MAX), u32::MAX);
    }

    #[test]
    fn test_gib_clamp() {
        assert_eq!(bytes_to_gib_clamped(10 << 30), 10);
        assert_eq!(bytes_to_gib_clamped(u64::MAX), u32::MAX);
    }
}
