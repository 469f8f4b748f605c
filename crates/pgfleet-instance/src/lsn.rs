// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Write-ahead log positions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A position in the write-ahead log, as reported by PostgreSQL in `X/Y` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lsn(u64);

impl Lsn {
    /// Build from the raw 64-bit position.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw 64-bit position.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::InvalidLsn(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
        Ok(Self((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl TryFrom<String> for Lsn {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> Self {
        lsn.to_string()
    }
}

/// Parse an optional LSN column where the empty string stands for NULL.
pub fn parse_optional(raw: &str) -> Result<Option<Lsn>, Error> {
    if raw.is_empty() {
        Ok(None)
    } else {
        raw.parse().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.as_u64(), (0x16 << 32) | 0xB374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn::new(0));
    }

    #[test]
    fn test_ordering_crosses_segment_boundary() {
        let a: Lsn = "0/FFFFFFFF".parse().unwrap();
        let b: Lsn = "1/0".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_invalid() {
        assert!("nonsense".parse::<Lsn>().is_err());
        assert!("0/XYZ".parse::<Lsn>().is_err());
        assert!("1/2/3".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_parse_optional() {
        assert_eq!(parse_optional("").unwrap(), None);
        assert_eq!(parse_optional("0/10").unwrap(), Some(Lsn::new(0x10)));
    }

    #[test]
    fn test_serde_as_string() {
        let lsn = Lsn::new(0x3_0000_0028);
        assert_eq!(serde_json::to_string(&lsn).unwrap(), "\"3/28\"");
        assert_eq!(serde_json::from_str::<Lsn>("\"3/28\"").unwrap(), lsn);
    }
}
