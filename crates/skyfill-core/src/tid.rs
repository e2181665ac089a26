//! Timestamp identifiers (TIDs) used as record keys.
//!
//! A TID is 13 characters of sortable base32 (`234567a-z`) encoding a 64-bit
//! integer whose top bit is zero. The next 53 bits are microseconds since the
//! UNIX epoch and the low 10 bits are a clock identifier.

use crate::{Error, Result};
use chrono::{DateTime, Utc};

const ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";
const TID_LEN: usize = 13;

/// A parsed timestamp identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u64);

impl Tid {
    /// Parse a TID string.
    pub fn parse(key: &str) -> Result<Self> {
        let bytes = key.as_bytes();
        if bytes.len() != TID_LEN {
            return Err(Error::InvalidKey {
                key: key.to_string(),
                reason: "wrong length",
            });
        }

        let mut value: u64 = 0;
        for &b in bytes {
            let digit = ALPHABET
                .iter()
                .position(|&c| c == b)
                .ok_or_else(|| Error::InvalidKey {
                    key: key.to_string(),
                    reason: "character outside the base32-sortable alphabet",
                })?;
            value = (value << 5) | digit as u64;
        }

        // 13 * 5 = 65 bits; the first character may only carry 4 of them.
        if digit_value(bytes[0]) >= 16 {
            return Err(Error::InvalidKey {
                key: key.to_string(),
                reason: "high bit set",
            });
        }

        Ok(Self(value))
    }

    /// Build a TID from its parts.
    pub fn from_parts(timestamp_micros: u64, clock_id: u16) -> Self {
        Self(((timestamp_micros & ((1 << 53) - 1)) << 10) | u64::from(clock_id & 0x3ff))
    }

    /// Microseconds since the UNIX epoch.
    pub fn timestamp_micros(&self) -> u64 {
        self.0 >> 10
    }

    /// Clock identifier (low 10 bits).
    pub fn clock_id(&self) -> u16 {
        (self.0 & 0x3ff) as u16
    }

    /// The embedded timestamp as a UTC datetime.
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(i64::try_from(self.timestamp_micros()).ok()?)
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = [0u8; TID_LEN];
        let mut v = self.0;
        for slot in out.iter_mut().rev() {
            *slot = ALPHABET[(v & 0x1f) as usize];
            v >>= 5;
        }
        // ALPHABET is ASCII so this cannot fail.
        f.write_str(std::str::from_utf8(&out).map_err(|_| std::fmt::Error)?)
    }
}

fn digit_value(b: u8) -> usize {
    ALPHABET.iter().position(|&c| c == b).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_tid() {
        let tid = Tid::parse("3jzfcijpj2z2a").unwrap();
        let dt = tid.datetime().unwrap();
        // Keys minted in 2022-2023 by the reference PDS.
        assert!(dt.timestamp() > 1_600_000_000);
        assert!(dt.timestamp() < 1_800_000_000);
    }

    #[test]
    fn test_display_matches_input() {
        let key = "3jzfcijpj2z2a";
        assert_eq!(Tid::parse(key).unwrap().to_string(), key);
    }

    #[test]
    fn test_from_parts() {
        let micros = 1_700_000_000_123_456u64;
        let tid = Tid::from_parts(micros, 7);
        assert_eq!(tid.timestamp_micros(), micros);
        assert_eq!(tid.clock_id(), 7);

        let reparsed = Tid::parse(&tid.to_string()).unwrap();
        assert_eq!(reparsed, tid);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(matches!(
            Tid::parse("self"),
            Err(Error::InvalidKey { reason: "wrong length", .. })
        ));
    }

    #[test]
    fn test_rejects_bad_alphabet() {
        assert!(Tid::parse("3jzfcijpj2z2!").is_err());
        assert!(Tid::parse("3JZFCIJPJ2Z2A").is_err());
    }

    #[test]
    fn test_rejects_high_bit() {
        assert!(Tid::parse("zzzzzzzzzzzzz").is_err());
    }
}
