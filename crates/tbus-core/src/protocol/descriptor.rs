//! Error descriptors carried in the body of error replies.
//!
//! When a request cannot be answered normally the receiving side replies with
//! the body flag [`BF_ERROR`](super::message::BF_ERROR) set and a payload
//! holding an [`ErrorDescriptor`].  The kind tells the caller *where* the
//! request failed, the message says *why*.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::payload::{self, PayloadError};

/// Which layer rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The route could not be followed (unknown address, device cannot route).
    Routing,
    /// The target device was reached but the method failed or does not exist.
    Method,
    /// The request could not be decoded or answered at the protocol level.
    Protocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Routing => "routing",
            ErrorKind::Method => "method",
            ErrorKind::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

/// Wire form of an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn routing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Routing, message)
    }

    pub fn method(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Method, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Encodes the descriptor as a reply payload.
    ///
    /// A descriptor holds only an enum and a string, so encoding cannot fail in
    /// practice; if it ever does the reply carries an empty payload and the
    /// receiver reports a payload error instead.
    pub fn to_payload(&self) -> Vec<u8> {
        payload::encode(self).unwrap_or_else(|e| {
            tracing::warn!("failed to encode error descriptor: {e}");
            Vec::new()
        })
    }

    /// Decodes a descriptor from an error-reply payload.
    pub fn from_payload(bytes: &[u8]) -> Result<Self, PayloadError> {
        payload::decode(bytes)
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_survives_payload_encoding() {
        // Arrange
        let original = ErrorDescriptor::routing("invalid address 9");

        // Act
        let decoded = ErrorDescriptor::from_payload(&original.to_payload())
            .expect("descriptor must decode");

        // Assert
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let bytes = ErrorDescriptor::method("boom").to_payload();
        assert!(ErrorDescriptor::from_payload(&bytes[..2]).is_err());
    }

    #[test]
    fn test_display_names_the_kind() {
        let d = ErrorDescriptor::method("unknown method 7");
        assert_eq!(d.to_string(), "method error: unknown method 7");
    }
}
