//! Error types for the device side.

use tbus_core::{ErrorDescriptor, ErrorKind, PayloadError, ProtocolError};
use thiserror::Error;

/// A request could not be delivered to a method.
///
/// Whoever holds the reply path for the request (the [`HostPort`]) turns it
/// into an error reply with [`DispatchError::to_descriptor`].
///
/// [`HostPort`]: crate::host::HostPort
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No device is plugged in at this address.
    #[error("invalid address {0}")]
    InvalidAddress(u8),

    /// The route continues past a device that cannot forward messages.
    #[error("routing not supported")]
    RoutingNotSupported,

    #[error("unknown method {0}")]
    UnknownMethod(u8),

    /// The bus has no representative device to answer for it.
    #[error("device not attached")]
    NotAttached,

    /// A built-in reply payload could not be encoded.
    #[error("failed to encode reply: {0}")]
    Payload(#[from] PayloadError),

    /// A message for a remote device could not be re-encoded.
    #[error("cannot forward message: {0}")]
    Forward(#[from] ProtocolError),
}

impl DispatchError {
    /// Converts the error into the descriptor sent back to the caller.
    pub fn to_descriptor(&self) -> ErrorDescriptor {
        let kind = match self {
            DispatchError::InvalidAddress(_)
            | DispatchError::RoutingNotSupported
            | DispatchError::NotAttached => ErrorKind::Routing,
            DispatchError::UnknownMethod(_) => ErrorKind::Method,
            DispatchError::Payload(_) | DispatchError::Forward(_) => ErrorKind::Protocol,
        };
        ErrorDescriptor::new(kind, self.to_string())
    }
}

/// Errors returned when plugging devices into or out of a bus.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    /// All 255 addresses of this bus have been handed out.
    #[error("bus address space exhausted")]
    AddressExhausted,

    #[error("device is already attached to a bus")]
    AlreadyAttached,

    #[error("device is not plugged into this bus")]
    NotPlugged,

    /// The device is this bus's representative or one of its ancestors.
    #[error("cannot plug a bus into itself")]
    Cycle,
}

/// A method handler failed.
///
/// The error text travels back to the caller as a `Method` error descriptor.
#[derive(Debug, Error)]
pub enum MethodError {
    /// The request payload could not be decoded, or the reply encoded.
    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("{0}")]
    Failed(String),
}

impl MethodError {
    pub fn failed(message: impl Into<String>) -> Self {
        MethodError::Failed(message.into())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_address_message_names_the_address() {
        let d = DispatchError::InvalidAddress(7).to_descriptor();
        assert_eq!(d.kind, ErrorKind::Routing);
        assert_eq!(d.message, "invalid address 7");
    }

    #[test]
    fn test_unknown_method_is_a_method_error() {
        let d = DispatchError::UnknownMethod(9).to_descriptor();
        assert_eq!(d.kind, ErrorKind::Method);
        assert_eq!(d.message, "unknown method 9");
    }

    #[test]
    fn test_routing_not_supported_is_a_routing_error() {
        let d = DispatchError::RoutingNotSupported.to_descriptor();
        assert_eq!(d.kind, ErrorKind::Routing);
        assert_eq!(d.message, "routing not supported");
    }
}
