//! Radio link addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a radio link address in bytes.
pub const MAC_LEN: usize = 6;

/// 6-byte radio link address. Displayed as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct MacAddr([u8; MAC_LEN]);

impl MacAddr {
    /// The all-ones broadcast address.
    pub const BROADCAST: MacAddr = MacAddr([0xff; MAC_LEN]);

    pub const fn new(bytes: [u8; MAC_LEN]) -> Self {
        MacAddr(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Read an address from the first six bytes of `bytes`. Caller checks length.
    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&bytes[..MAC_LEN]);
        MacAddr(out)
    }
}

impl From<[u8; MAC_LEN]> for MacAddr {
    fn from(bytes: [u8; MAC_LEN]) -> Self {
        MacAddr(bytes)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid mac address: {0:?}")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    /// Accepts six hex octets separated by `:` or `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; MAC_LEN];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for slot in out.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(MacAddr(out))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
