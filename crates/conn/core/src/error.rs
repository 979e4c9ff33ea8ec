//! Unified error surface of the connection core.

use tangle_peer::{AddressError, FeedId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnError {
    /// Malformed address or missing/invalid key.
    #[error(transparent)]
    Address(#[from] AddressError),
    /// No address book entry carries this identity.
    #[error("unknown peer: {0}")]
    UnknownPeer(FeedId),
    /// Dial control errors (already connected, transport, shutdown).
    #[error(transparent)]
    Hub(#[from] tangle_conn_hub::HubError),
    /// Address book errors (persistence, shutdown).
    #[error(transparent)]
    Store(#[from] tangle_conn_db::StoreError),
    /// A legacy entry point refused the request.
    #[error("{0}")]
    Legacy(&'static str),
}
