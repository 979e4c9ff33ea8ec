//! Connection state machine.

use serde::{Deserialize, Serialize};

/// State of an address in the hub. Absence of an entry is the idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    ConnectingFailed,
}

impl ConnectionState {
    /// Connecting or connected: the address is considered live.
    pub fn is_in_connection(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}
