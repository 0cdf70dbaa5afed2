//! tbus-device library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does tbus-device do? (for beginners)
//!
//! This crate is the *hardware side* of tbus.  It models the tree of buses and
//! devices that a master talks to:
//!
//! 1. A [`device::Device`] owns a table of numbered methods.  Method 0 always
//!    answers the device's `DeviceInfo`; the rest come from a
//!    [`device::DeviceLogic`] such as [`logic::LedLogic`].
//! 2. A [`bus::Bus`] hands out addresses to the devices plugged into it and
//!    forwards routed messages one hop at a time.  Buses nest by plugging a
//!    bus's representative device into another bus.
//! 3. A [`host::HostPort`] connects the root device to a byte stream, decodes
//!    incoming requests and writes replies back.
//! 4. [`server`] runs a [`host::HostPort`] per TCP connection, one master at a
//!    time.
//! 5. [`remote::RemoteDevice`] stands in on a local bus for a device that lives
//!    in another process and connected with [`host::HostPort::announce`].

pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod logic;
pub mod remote;
pub mod server;

pub use bus::Bus;
pub use device::{
    BusPort, Device, DeviceBuilder, DeviceLogic, HandlerTask, MethodTable, MsgRouter,
};
pub use error::{BusError, DispatchError, MethodError};
pub use host::HostPort;
pub use remote::RemoteDevice;
