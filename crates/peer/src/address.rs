//! Multiserver address parsing and rendering.
//!
//! Canonical form is `transport:host:port~shs:base64key`. Onion addresses
//! use the `onion:` prefix and `.onion` hostnames, Bluetooth addresses are
//! `bt:<mac-no-colons>~shs:<key>`, DHT tunnels are `dht:<seed>:<remoteId>~noauth`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddressError;
use crate::feed::FeedId;

/// Recognized multiserver transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Net,
    Onion,
    Bt,
    Dht,
    Lan,
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Net => "net",
            Self::Onion => "onion",
            Self::Bt => "bt",
            Self::Dht => "dht",
            Self::Lan => "lan",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "net" => Some(Self::Net),
            "onion" => Some(Self::Onion),
            "bt" => Some(Self::Bt),
            "dht" => Some(Self::Dht),
            "lan" => Some(Self::Lan),
            _ => None,
        }
    }
}

/// Transport-specific location coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// Hostname or IP plus TCP port (net, onion, lan).
    Host { host: String, port: u16 },
    /// Bluetooth MAC with colons stripped.
    Device(String),
    /// DHT tunnel through a seed towards a remote id.
    Tunnel { seed: String, remote: String },
}

/// Authentication segment of an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Auth {
    /// Secret-handshake with the peer's ed25519 key.
    Shs(FeedId),
    /// No authentication (DHT tunnels).
    NoAuth,
}

/// A parsed multiserver address.
///
/// Equality and hashing are structural, so the same address in different
/// textual spellings of the key compares equal after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    transport: Transport,
    location: Location,
    auth: Auth,
}

impl Address {
    pub fn new(transport: Transport, location: Location, auth: Auth) -> Self {
        Self {
            transport,
            location,
            auth,
        }
    }

    /// Build the canonical net address for a host/port/key triple.
    pub fn net(host: impl Into<String>, port: u16, key: FeedId) -> Self {
        Self {
            transport: Transport::Net,
            location: Location::Host {
                host: host.into(),
                port,
            },
            auth: Auth::Shs(key),
        }
    }

    /// Synthesize a Bluetooth address from a device id and key.
    pub fn bt(device_hex: impl Into<String>, key: FeedId) -> Self {
        Self {
            transport: Transport::Bt,
            location: Location::Device(device_hex.into()),
            auth: Auth::Shs(key),
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// The peer key, when the address authenticates with one.
    pub fn key(&self) -> Option<&FeedId> {
        match &self.auth {
            Auth::Shs(key) => Some(key),
            Auth::NoAuth => None,
        }
    }

    /// Host segment used for debounce grouping; the device id for Bluetooth
    /// and the seed for DHT tunnels.
    pub fn host(&self) -> Option<&str> {
        match &self.location {
            Location::Host { host, .. } => Some(host),
            Location::Device(device) => Some(device),
            Location::Tunnel { seed, .. } => Some(seed),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match &self.location {
            Location::Host { port, .. } => Some(*port),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.transport.name())?;
        match &self.location {
            Location::Host { host, port } => write!(f, "{host}:{port}")?,
            Location::Device(device) => write!(f, "{device}")?,
            Location::Tunnel { seed, remote } => write!(f, "{seed}:{remote}")?,
        }
        match &self.auth {
            Auth::Shs(key) => write!(f, "~shs:{}", key.to_base64()),
            Auth::NoAuth => write!(f, "~noauth"),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressError::InvalidAddress(s.to_string());

        let (location_str, auth_str) = s.split_once('~').ok_or_else(invalid)?;
        let (transport_str, rest) = location_str.split_once(':').ok_or_else(invalid)?;
        let transport = Transport::parse(transport_str).ok_or_else(invalid)?;

        let auth = match auth_str.split_once(':') {
            Some(("shs", key)) => Auth::Shs(FeedId::from_base64(key)?),
            None if auth_str == "noauth" => Auth::NoAuth,
            _ => return Err(invalid()),
        };

        let location = match transport {
            Transport::Net | Transport::Onion | Transport::Lan => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
                if host.is_empty() {
                    return Err(invalid());
                }
                if transport == Transport::Onion && !host.ends_with(".onion") {
                    return Err(invalid());
                }
                let port: u16 = port.parse().map_err(|_| invalid())?;
                Location::Host {
                    host: host.to_string(),
                    port,
                }
            }
            Transport::Bt => {
                if rest.is_empty() || rest.contains(':') {
                    return Err(invalid());
                }
                Location::Device(rest.to_string())
            }
            Transport::Dht => {
                let (seed, remote) = rest.split_once(':').ok_or_else(invalid)?;
                if seed.is_empty() || remote.is_empty() {
                    return Err(invalid());
                }
                Location::Tunnel {
                    seed: seed.to_string(),
                    remote: remote.to_string(),
                }
            }
        };

        // Every transport except dht authenticates with a key.
        if transport != Transport::Dht && matches!(auth, Auth::NoAuth) {
            return Err(AddressError::MissingKey(s.to_string()));
        }

        Ok(Self {
            transport,
            location,
            auth,
        })
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
