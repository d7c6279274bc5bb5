//! Error types for the pony-rpc crate.

use pony_types::Identity;

use crate::address::AddressError;
use crate::codec::CodecError;

/// Failures of the socket layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Address already in use: {0}")]
    AddrInUse(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Connection closed")]
    Closed,
}

/// Failures surfaced by the router to its callers.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The listening endpoint could not be opened. Fatal at startup.
    #[error("Bind failed: {0}")]
    Bind(#[source] TransportError),

    /// The upstream endpoint is unusable. Fatal at startup.
    #[error("Connect failed: {0}")]
    Connect(#[source] TransportError),

    /// Routing error: no explicit recipient and no default configured.
    #[error("No recipient")]
    NoRecipient,

    /// Delivery error: the recipient is not currently connected.
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(Identity),
}

impl RouterError {
    /// True for errors that mean the daemon cannot start.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, RouterError::Bind(_) | RouterError::Connect(_))
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
