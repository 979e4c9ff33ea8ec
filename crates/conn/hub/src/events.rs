//! Hub lifecycle events.

use tangle_peer::{Address, FeedId};

use crate::state::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubEventKind {
    Connecting,
    ConnectingFailed,
    Connected,
    Disconnected,
}

impl HubEventKind {
    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Connecting => ConnectionState::Connecting,
            Self::ConnectingFailed => ConnectionState::ConnectingFailed,
            Self::Connected => ConnectionState::Connected,
            Self::Disconnected => ConnectionState::Disconnected,
        }
    }
}

/// One observed transition of one address. Every listener sees every
/// transition in the order the hub applied it.
#[derive(Debug, Clone)]
pub struct HubEvent {
    pub kind: HubEventKind,
    pub address: Address,
    pub key: Option<FeedId>,
    /// Failure detail for `ConnectingFailed`.
    pub details: Option<String>,
}
