//! Crate-level error type.

use thiserror::Error;

use crate::address::{AddressError, Multiaddr};
use crate::channel::ChannelError;
use crate::wire::FrameEncodeError;

/// Errors surfaced by dial, listen and sub-dial operations.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The channel closed while the operation was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// The remote side sent malformed or unexpected data.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A set-once field was set a second time.
    #[error("{0} is already configured")]
    AlreadyConfigured(&'static str),

    /// A required field was never set.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// No protocol is registered under the requested id.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// No transport handles the address.
    #[error("no transport for address {0}")]
    UnsupportedAddress(Multiaddr),

    /// More than one transport claims the address.
    #[error("more than one transport for address {0}")]
    AmbiguousAddress(Multiaddr),

    /// Transport-level failure (refused, address in use, ...).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("address error: {0}")]
    Address(#[from] AddressError),

    #[error("frame encode error: {0}")]
    Encode(#[from] FrameEncodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ChannelError> for PeerError {
    fn from(_: ChannelError) -> Self {
        PeerError::ConnectionClosed
    }
}

impl PeerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PeerError::Cancelled)
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, PeerError::ConnectionClosed)
    }
}

/// Result type for peer operations.
pub type PeerResult<T> = Result<T, PeerError>;
