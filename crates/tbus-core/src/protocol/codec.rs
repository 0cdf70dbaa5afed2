//! Incremental decoder and encoder for tbus messages.
//!
//! See [`super::message`] for the byte layout.
//!
//! # Why an incremental decoder? (for beginners)
//!
//! A byte stream (serial port, TCP socket) does not preserve message
//! boundaries.  One `read()` may return half a message, or three and a bit.
//! The [`Decoder`] therefore keeps its position in the current message between
//! calls, and reports progress as a list of [`DecodeEvent`]s:
//!
//! ```text
//! chunk 1: [C2 01 01 03 11]      -> Route([1,1,3])
//! chunk 2: [64 03 14 01]         -> Head { msg_id: 100, body_len: 5 }
//! chunk 3: [02 03 04 00]         -> Message { .. }
//! ```
//!
//! # Error recovery
//!
//! A malformed header produces one `Err(ProtocolError)` entry, the decoder
//! resets, and decoding resumes with the very next byte of the same chunk.
//! The bytes of the malformed message are lost.

use thiserror::Error;
use tracing::{trace, warn};

use super::message::{
    body_units, Body, Flags, Message, MessageHead, MAX_BODY_BYTES, PFX_ROUTING,
    PFX_ROUTING_ADDR_NUM, PFX_ROUTING_MASK,
};
use super::route::{RoutePath, MAX_HOPS};

/// Errors that can occur while encoding or decoding messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The flags byte names a protocol revision this implementation does not speak.
    #[error("unsupported protocol revision: {0}")]
    UnsupportedRevision(u8),

    /// The flags byte does not select the schema payload encoding.
    #[error("unsupported payload encoding in flags 0x{0:02X}")]
    UnsupportedEncoding(u8),

    /// The pad bit is set but the body is empty, so there is nothing to pad.
    #[error("pad bit set on an empty body")]
    PadWithoutBody,

    /// The route has more hops than a route prefix can describe.
    #[error("route has {0} hops, at most {MAX_HOPS} are allowed")]
    TooManyHops(usize),

    /// The body does not fit in the 16-bit unit count.
    #[error("body of {0} bytes exceeds the maximum of {MAX_BODY_BYTES}")]
    BodyTooLarge(usize),

    /// The input ended part-way through a message.
    #[error("input ended in the middle of a message")]
    Incomplete,
}

/// Progress reported by [`Decoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// The route prefix and all its addresses have been read.
    Route(RoutePath),
    /// Flags, message id and body size have been read.
    Head(MessageHead),
    /// A complete message, body included.
    Message(Message),
}

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Encodes a [`Message`] into its wire form.
///
/// A route prefix is written only when the route is non-empty.  The message id
/// and body size use the smallest field width that fits, and odd bodies are
/// padded with one `0x00` byte.
///
/// # Errors
///
/// - [`ProtocolError::TooManyHops`] for routes longer than 32 hops.
/// - [`ProtocolError::BodyTooLarge`] for bodies over 131070 bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let hops = msg.route.hops();
    if hops.len() > MAX_HOPS {
        return Err(ProtocolError::TooManyHops(hops.len()));
    }

    let body_len = msg.body.len();
    if body_len > MAX_BODY_BYTES {
        return Err(ProtocolError::BodyTooLarge(body_len));
    }

    let flags = msg.flags();
    let mut buf = Vec::with_capacity(msg.encoded_len());

    if !hops.is_empty() {
        buf.push(PFX_ROUTING | (hops.len() - 1) as u8);
        buf.extend_from_slice(hops);
    }

    buf.push(flags.0);
    buf.extend_from_slice(&msg.msg_id.to_le_bytes()[..flags.id_width()]);

    // Bounded by MAX_BODY_BYTES above, so the unit count fits in 16 bits.
    let units = body_units(body_len) as u16;
    buf.extend_from_slice(&units.to_le_bytes()[..flags.size_width()]);

    buf.push(msg.body.flag);
    buf.extend_from_slice(&msg.body.payload);
    if flags.has_pad() {
        buf.push(0x00);
    }

    Ok(buf)
}

// ── Decoder ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the first byte of a message.
    Prefix,
    /// Reading route addresses; the value is the number still expected.
    Addrs(usize),
    /// Waiting for the flags byte after a route prefix.
    Flags,
    MsgId,
    BodySize,
    Body,
}

/// Incremental message decoder.
///
/// Feed it chunks of any size with [`Decoder::decode`]; partial state is kept
/// until the next call.
#[derive(Debug)]
pub struct Decoder {
    state: State,
    hops: Vec<u8>,
    route: RoutePath,
    flags: Flags,
    msg_id: u32,
    /// Number of bytes read in the current multi-byte field.
    field_read: usize,
    units: usize,
    body: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::Prefix,
            hops: Vec::new(),
            route: RoutePath::local(),
            flags: Flags(0),
            msg_id: 0,
            field_read: 0,
            units: 0,
            body: Vec::new(),
        }
    }

    /// Discards any partially decoded message.
    pub fn reset(&mut self) {
        self.state = State::Prefix;
        self.hops.clear();
        self.route = RoutePath::local();
        self.flags = Flags(0);
        self.msg_id = 0;
        self.field_read = 0;
        self.units = 0;
        self.body = Vec::new();
    }

    /// `true` when the decoder sits between messages.
    pub fn is_idle(&self) -> bool {
        self.state == State::Prefix
    }

    /// Consumes `chunk` and returns every event and error it produced, in order.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<DecodeEvent, ProtocolError>> {
        let mut events = Vec::new();
        for &byte in chunk {
            match self.step(byte) {
                Ok(Some(event)) => {
                    trace!(?event, "decoded");
                    events.push(Ok(event));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("protocol error, dropping message: {e}");
                    self.reset();
                    events.push(Err(e));
                }
            }
        }
        events
    }

    fn step(&mut self, byte: u8) -> Result<Option<DecodeEvent>, ProtocolError> {
        match self.state {
            State::Prefix => {
                if byte & PFX_ROUTING_MASK == PFX_ROUTING {
                    let count = (byte & PFX_ROUTING_ADDR_NUM) as usize + 1;
                    self.hops.reserve(count);
                    self.state = State::Addrs(count);
                    Ok(None)
                } else {
                    self.read_flags(byte)
                }
            }
            State::Addrs(remaining) => {
                self.hops.push(byte);
                if remaining > 1 {
                    self.state = State::Addrs(remaining - 1);
                    return Ok(None);
                }
                self.route = RoutePath::new(std::mem::take(&mut self.hops));
                self.state = State::Flags;
                Ok(Some(DecodeEvent::Route(self.route.clone())))
            }
            State::Flags => self.read_flags(byte),
            State::MsgId => {
                self.msg_id |= (byte as u32) << (8 * self.field_read);
                self.field_read += 1;
                if self.field_read == self.flags.id_width() {
                    self.field_read = 0;
                    self.state = State::BodySize;
                }
                Ok(None)
            }
            State::BodySize => {
                self.units |= (byte as usize) << (8 * self.field_read);
                self.field_read += 1;
                if self.field_read < self.flags.size_width() {
                    return Ok(None);
                }
                self.field_read = 0;
                self.read_head()
            }
            State::Body => {
                self.body.push(byte);
                if self.body.len() < self.units * 2 {
                    return Ok(None);
                }
                let message = self.take_message();
                self.reset();
                Ok(Some(DecodeEvent::Message(message)))
            }
        }
    }

    fn read_flags(&mut self, byte: u8) -> Result<Option<DecodeEvent>, ProtocolError> {
        let flags = Flags(byte);
        if !flags.is_supported_revision() {
            return Err(ProtocolError::UnsupportedRevision(flags.revision()));
        }
        if !flags.is_supported_encoding() {
            return Err(ProtocolError::UnsupportedEncoding(byte));
        }
        self.flags = flags;
        self.field_read = 0;
        self.state = State::MsgId;
        Ok(None)
    }

    fn read_head(&mut self) -> Result<Option<DecodeEvent>, ProtocolError> {
        let pad = usize::from(self.flags.has_pad());
        if self.units == 0 && pad == 1 {
            return Err(ProtocolError::PadWithoutBody);
        }

        let head = MessageHead {
            route: self.route.clone(),
            flags: self.flags,
            msg_id: self.msg_id,
            body_len: self.units * 2 - pad,
        };

        if self.units == 0 {
            // Nothing follows the header; the next byte starts a new message.
            self.reset();
        } else {
            self.body = Vec::with_capacity(self.units * 2);
            self.state = State::Body;
        }
        Ok(Some(DecodeEvent::Head(head)))
    }

    fn take_message(&mut self) -> Message {
        let mut body = std::mem::take(&mut self.body);
        if self.flags.has_pad() {
            body.pop();
        }
        // units > 0, so the body holds at least the flag byte.
        let flag = body.first().copied().unwrap_or_default();
        let payload = body.get(1..).map(<[u8]>::to_vec).unwrap_or_default();
        Message {
            route: std::mem::take(&mut self.route),
            msg_id: self.msg_id,
            body: Body::new(flag, payload),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a buffer that holds only complete messages.
///
/// Convenience wrapper for tests and tools that already have whole frames.
///
/// # Errors
///
/// Returns the first [`ProtocolError`] encountered, or
/// [`ProtocolError::Incomplete`] when the buffer ends inside a message.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Message>, ProtocolError> {
    let mut decoder = Decoder::new();
    let mut messages = Vec::new();
    for event in decoder.decode(bytes) {
        if let DecodeEvent::Message(msg) = event? {
            messages.push(msg);
        }
    }
    if !decoder.is_idle() {
        return Err(ProtocolError::Incomplete);
    }
    Ok(messages)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
