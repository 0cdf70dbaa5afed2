//! # tbus-core
//!
//! Shared library for tbus containing the wire codec, route paths, the
//! message-id allocator, device descriptions and the transport seam.
//!
//! This crate is used by both the device host and the master.  It has no
//! dependency on sockets or on a particular async runtime.
//!
//! # Architecture overview (for beginners)
//!
//! tbus connects a *master* (the program that wants to control hardware) to a
//! tree of *devices* (LEDs, motors, servos) reachable through nested *buses*.
//! The master sends a request addressed by a path of bus addresses, the bus
//! tree forwards it hop by hop, and the target device answers with a reply
//! carrying the same message id.
//!
//! This crate (`tbus-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the link.  Messages carry an
//!   optional route prefix, a variable-width id and a size-bounded body, and
//!   are decoded incrementally from arbitrary chunks.
//!
//! - **`id_alloc`** – A bitmap allocator that hands out message ids that are
//!   unique among the requests still waiting for a reply.
//!
//! - **`domain`** – What devices say about themselves (`DeviceInfo`) and the
//!   well-known class and method numbers.
//!
//! - **`payload`** – The `bincode` codec used for built-in payloads.
//!
//! - **`transport`** – The `Transport` trait both endpoints write through.

pub mod domain;
pub mod id_alloc;
pub mod payload;
pub mod protocol;
pub mod transport;

// Re-export the most-used types at the crate root so callers can write
// `tbus_core::Message` instead of `tbus_core::protocol::message::Message`.
pub use domain::classes::{
    LedPowerState, MotorBrakeState, MotorDirection, MotorDriveState, ServoPosition, BUS_CLASS_ID,
    BUS_METHOD_ENUMERATE, LED_CLASS_ID, LED_METHOD_SET_POWER_STATE, METHOD_DEVICE_INFO,
    MOTOR_CLASS_ID, MOTOR_DEFAULT_SPEED, MOTOR_METHOD_BRAKE, MOTOR_METHOD_START,
    MOTOR_METHOD_STOP, SERVO_CLASS_ID, SERVO_METHOD_SET_POSITION, SERVO_METHOD_STOP,
};
pub use domain::device_info::{BusEnumeration, DeviceInfo};
pub use id_alloc::IdAllocator;
pub use payload::PayloadError;
pub use protocol::{
    encode_message, DecodeEvent, Decoder, ErrorDescriptor, ErrorKind, Message, ProtocolError,
    RoutePath,
};
pub use transport::{Transport, TransportError};
