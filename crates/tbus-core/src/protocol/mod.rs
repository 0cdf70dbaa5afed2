//! Protocol module containing message types and the wire codec.

pub mod codec;
pub mod descriptor;
pub mod message;
pub mod route;

pub use codec::{decode_all, encode_message, DecodeEvent, Decoder, ProtocolError};
pub use descriptor::{ErrorDescriptor, ErrorKind};
pub use message::{Body, Flags, Message, MessageHead, BF_ERROR, MAX_BODY_BYTES, MAX_PAYLOAD_BYTES};
pub use route::{RoutePath, MAX_HOPS};
