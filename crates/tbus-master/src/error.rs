//! Error type returned to callers of the master.

use tbus_core::{ErrorDescriptor, ErrorKind, PayloadError, TransportError};
use thiserror::Error;

/// Why an invocation did not produce a reply payload.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The request could not be routed to its target device.
    #[error("routing error: {0}")]
    Routing(String),

    /// The target device rejected the method or the method failed.
    #[error("method error: {0}")]
    Method(String),

    /// The request or its reply was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The link went away while the call was in flight.
    #[error("link disconnected before a reply arrived")]
    Disconnected,

    /// A typed request or reply could not go through the payload codec.
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),
}

impl From<ErrorDescriptor> for InvokeError {
    fn from(descriptor: ErrorDescriptor) -> Self {
        match descriptor.kind {
            ErrorKind::Routing => InvokeError::Routing(descriptor.message),
            ErrorKind::Method => InvokeError::Method(descriptor.message),
            ErrorKind::Protocol => InvokeError::Protocol(descriptor.message),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
