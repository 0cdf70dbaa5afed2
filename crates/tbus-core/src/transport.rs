//! The byte-stream seam between the protocol layer and the outside world.
//!
//! # Why a trait? (for beginners)
//!
//! The master and the device host both need to *write bytes somewhere*: a TCP
//! socket, a serial port, or simply another object in the same process during
//! tests.  Depending on a trait instead of a concrete socket lets each of
//! those be plugged in, and lets unit tests substitute a mock.
//!
//! Reading is not part of the trait.  Whoever owns the read half of a
//! connection pushes the bytes it receives into the endpoint's `receive`
//! method.

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// No link has been attached yet, or it has been detached.
    #[error("not connected")]
    NotConnected,

    /// The other side closed the link.
    #[error("link closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes encoded messages to the other end of a link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes `bytes` in full, or fails.
    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
}
