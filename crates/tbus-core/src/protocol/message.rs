//! Message types and wire-format constants.
//!
//! Wire format (all multi-byte integers are little-endian):
//!
//! ```text
//! [route prefix:1][addrs:N]                 optional, N = 1..=32
//! [flags:1][msg id:1..=4][body units:1..=2]
//! [body flag:1][payload:M][pad:0|1]         2 * units bytes in total
//! ```
//!
//! # The flags byte
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! [ revision ][enc][ id w-1 ][sw][pad]
//! ```
//!
//! - **revision** – protocol revision; only [`REVISION`] is understood.
//! - **enc** – payload-encoding kind; must be [`ENCODING_SCHEMA`].
//! - **id w-1** – width of the message id in bytes, minus one.
//! - **sw** – width of the body-size field: clear = 1 byte, set = 2 bytes.
//! - **pad** – the body ends with one pad byte that is not part of the payload.
//!
//! The body size is counted in 2-byte units, which is why odd bodies need a
//! pad byte.  With a 2-byte size field a body can be up to 131070 bytes.

use super::descriptor::ErrorDescriptor;
use super::route::RoutePath;

// ── Route prefix ──────────────────────────────────────────────────────────────

/// Mask selecting the bits that identify a route prefix byte.
pub const PFX_ROUTING_MASK: u8 = 0xE0;
/// Value of the masked bits in a route prefix byte.
pub const PFX_ROUTING: u8 = 0xC0;
/// Mask selecting the hop count (minus one) in a route prefix byte.
pub const PFX_ROUTING_ADDR_NUM: u8 = 0x1F;

// ── Flags byte ────────────────────────────────────────────────────────────────

pub const REVISION_MASK: u8 = 0xE0;
/// The only supported protocol revision (stored in bits 7..5).
pub const REVISION: u8 = 0x00;

pub const ENCODING_MASK: u8 = 0x10;
/// Payloads are encoded by the external schema codec.
pub const ENCODING_SCHEMA: u8 = 0x10;

/// Revision and encoding together: every supported flags byte has this high nibble.
pub const FORMAT_MASK: u8 = 0xF0;
pub const FORMAT: u8 = REVISION | ENCODING_SCHEMA;

pub const ID_WIDTH_MASK: u8 = 0x0C;
pub const ID_WIDTH_SHIFT: u8 = 2;

/// Set when the body-size field is two bytes wide.
pub const SIZE_WIDE: u8 = 0x02;

/// Set when the body carries one trailing pad byte.
pub const BODY_PAD: u8 = 0x01;

// ── Body ──────────────────────────────────────────────────────────────────────

/// Body flag bit marking the payload as an error descriptor.
pub const BF_ERROR: u8 = 0x80;

/// Largest body (flag byte + payload + pad) a message can carry.
pub const MAX_BODY_BYTES: usize = u16::MAX as usize * 2;

/// Largest payload a message can carry (one body byte is the flag).
pub const MAX_PAYLOAD_BYTES: usize = MAX_BODY_BYTES - 1;

/// The decoded flags byte.
///
/// The flags are derived from the message when encoding, and describe the
/// field widths when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(pub u8);

impl Flags {
    /// Computes the flags for a message with the given id and body length
    /// (flag byte + payload, before padding).
    pub fn for_body(msg_id: u32, body_len: usize) -> Self {
        let mut bits = FORMAT;
        bits |= (id_width(msg_id) - 1) << ID_WIDTH_SHIFT;
        if body_units(body_len) > u8::MAX as usize {
            bits |= SIZE_WIDE;
        }
        if body_len % 2 == 1 {
            bits |= BODY_PAD;
        }
        Flags(bits)
    }

    pub fn revision(self) -> u8 {
        (self.0 & REVISION_MASK) >> 5
    }

    pub fn is_supported_revision(self) -> bool {
        self.0 & REVISION_MASK == REVISION
    }

    pub fn is_supported_encoding(self) -> bool {
        self.0 & ENCODING_MASK == ENCODING_SCHEMA
    }

    /// Width of the message-id field in bytes (1..=4).
    pub fn id_width(self) -> usize {
        (((self.0 & ID_WIDTH_MASK) >> ID_WIDTH_SHIFT) + 1) as usize
    }

    /// Width of the body-size field in bytes (1 or 2).
    pub fn size_width(self) -> usize {
        if self.0 & SIZE_WIDE != 0 {
            2
        } else {
            1
        }
    }

    pub fn has_pad(self) -> bool {
        self.0 & BODY_PAD != 0
    }
}

/// Minimal number of bytes needed to represent `msg_id` (at least one).
pub fn id_width(msg_id: u32) -> u8 {
    match msg_id {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

/// Number of 2-byte units needed to carry `body_len` bytes.
pub fn body_units(body_len: usize) -> usize {
    (body_len + 1) / 2
}

/// Message body: a flag byte followed by an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Body {
    /// Method index for requests, 0 for successful replies, or
    /// [`BF_ERROR`] for error replies.
    pub flag: u8,
    /// Opaque payload owned by the external payload codec.
    pub payload: Vec<u8>,
}

impl Body {
    pub fn new(flag: u8, payload: Vec<u8>) -> Self {
        Self { flag, payload }
    }

    /// `true` when the payload is an error descriptor.
    pub fn is_error(&self) -> bool {
        self.flag & BF_ERROR != 0
    }

    /// Encoded length before padding (flag byte + payload).
    pub fn len(&self) -> usize {
        1 + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Everything known about a message once its header has been decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub route: RoutePath,
    pub flags: Flags,
    pub msg_id: u32,
    /// Body length in bytes, excluding the pad byte.
    pub body_len: usize,
}

/// A complete protocol message.
///
/// # Examples
///
/// ```rust
/// use tbus_core::protocol::{decode_all, encode_message, Message, RoutePath};
///
/// let msg = Message::request(100, RoutePath::new([1, 1, 3]), 20, vec![1, 2, 3, 4]);
/// let bytes = encode_message(&msg).unwrap();
/// let decoded = decode_all(&bytes).unwrap();
/// assert_eq!(decoded, vec![msg]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub route: RoutePath,
    pub msg_id: u32,
    pub body: Body,
}

impl Message {
    /// Builds a request invoking `method` on the device reached by `route`.
    pub fn request(msg_id: u32, route: RoutePath, method: u8, payload: Vec<u8>) -> Self {
        Self {
            route,
            msg_id,
            body: Body::new(method, payload),
        }
    }

    /// Builds a successful reply to request `msg_id`.
    pub fn reply(msg_id: u32, payload: Vec<u8>) -> Self {
        Self {
            route: RoutePath::local(),
            msg_id,
            body: Body::new(0, payload),
        }
    }

    /// Builds an error reply to request `msg_id`.
    pub fn error_reply(msg_id: u32, error: &ErrorDescriptor) -> Self {
        Self {
            route: RoutePath::local(),
            msg_id,
            body: Body::new(BF_ERROR, error.to_payload()),
        }
    }

    /// The flags byte this message is encoded with.
    pub fn flags(&self) -> Flags {
        Flags::for_body(self.msg_id, self.body.len())
    }

    /// Returns a copy of this message with one routing hop removed.
    pub fn strip_hop(&self) -> Self {
        Self {
            route: self.route.stripped(),
            msg_id: self.msg_id,
            body: self.body.clone(),
        }
    }

    /// Total encoded length in bytes, as implied by the flags.
    pub fn encoded_len(&self) -> usize {
        let flags = self.flags();
        let prefix = if self.route.is_empty() {
            0
        } else {
            1 + self.route.len()
        };
        prefix + 1 + flags.id_width() + flags.size_width() + body_units(self.body.len()) * 2
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
