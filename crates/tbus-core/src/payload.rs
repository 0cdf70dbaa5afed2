//! Payload codec.
//!
//! The wire codec treats payloads as opaque bytes.  The built-in payloads
//! (device info, bus enumeration, error descriptors and the LED demo types)
//! are serialized with `bincode`, and applications are free to use the same
//! helpers for their own method arguments.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// A payload could not be serialized or deserialized.
#[derive(Debug, Error)]
#[error("payload codec error: {0}")]
pub struct PayloadError(#[from] bincode::Error);

/// Serializes `value` into a payload.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, PayloadError> {
    Ok(bincode::serialize(value)?)
}

/// Deserializes a payload into `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    Ok(bincode::deserialize(bytes)?)
}
