//! The transport seam: dialing and live connection handles.

use async_trait::async_trait;
use tangle_peer::{Address, PeerRecord};
use thiserror::Error;

/// Transport-level dial failures. These surface as `connecting-failed`
/// events and rejected connect results; they never crash the hub.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// A live transport connection produced by a successful dial.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Tear the transport down. Must be safe to call once.
    async fn close(self: Box<Self>);
}

/// Opens transport connections and runs the cryptographic handshake.
///
/// Implemented by the transport layer; the connection core only observes
/// the outcome.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        addr: &Address,
        record: &PeerRecord,
    ) -> Result<Box<dyn Connection>, DialError>;
}
