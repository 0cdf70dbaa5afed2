//! Concrete device behaviours.
//!
//! Each logic implements [`DeviceLogic`](crate::device::DeviceLogic) and is
//! turned into a device with [`DeviceBuilder`](crate::device::DeviceBuilder).

pub mod led;
pub mod motor;
pub mod servo;

pub use led::LedLogic;
pub use motor::{MotorLogic, MotorState};
pub use servo::ServoLogic;
