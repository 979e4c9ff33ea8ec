//! Address parsing and validation errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Malformed multiserver address.
    #[error("invalid multiserver address: {0}")]
    InvalidAddress(String),
    /// Address lacks an ed25519 key where one is required.
    #[error("address is missing an ed25519 key: {0}")]
    MissingKey(String),
    /// Key segment is not a base64-encoded 32-byte value.
    #[error("invalid ed25519 key: {0}")]
    InvalidKey(String),
}
