//! Device descriptions shared by both ends of a link.
//!
//! # What lives here (for beginners)
//!
//! Nothing in this module touches sockets or tasks.  It defines the data a
//! device reports about itself ([`device_info::DeviceInfo`]) and the well-known
//! class and method numbers ([`classes`]) that the device host and the master
//! must agree on.  Both sides depend on this module; it depends on neither.

pub mod classes;
pub mod device_info;
