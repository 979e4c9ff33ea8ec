//! Feed identity: an ed25519 public key.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddressError;

/// Canonical suffix for rendered feed ids.
const FEED_SUFFIX: &str = ".ed25519";

/// A peer's long-lived public identity: a 32-byte ed25519 key.
///
/// Rendered canonically as `@<base64>.ed25519`. Inside multiserver
/// addresses the same key appears as the bare base64 segment after `~shs:`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId([u8; 32]);

impl FeedId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the bare base64 key segment of a multiserver address.
    pub fn from_base64(s: &str) -> Result<Self, AddressError> {
        let bytes = BASE64
            .decode(s)
            .map_err(|_| AddressError::InvalidKey(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AddressError::InvalidKey(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// The bare base64 form used inside addresses.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}{}", self.to_base64(), FEED_SUFFIX)
    }
}

impl fmt::Debug for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedId({})", self)
    }
}

impl FromStr for FeedId {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix('@')
            .and_then(|s| s.strip_suffix(FEED_SUFFIX))
            .ok_or_else(|| AddressError::InvalidKey(s.to_string()))?;
        Self::from_base64(inner)
    }
}

impl Serialize for FeedId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FeedId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
