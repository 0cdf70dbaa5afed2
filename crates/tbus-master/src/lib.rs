//! tbus-master library entry point.
//!
//! # What does tbus-master do? (for beginners)
//!
//! This crate is the *calling side* of tbus.  A [`Master`] turns method calls
//! into request messages, writes them to a link, and matches each reply back
//! to the call that is waiting for it by message id.
//!
//! ```rust,no_run
//! use tbus_master::{BusCtl, Controller, LedCtl, Master, TcpLink};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let master = Master::new();
//! TcpLink::connect("127.0.0.1:7600", &master).await?;
//!
//! let root = BusCtl::new(Controller::root(master));
//! for device in root.enumerate().await? {
//!     println!("{} -> class {:#06x}", device.address, device.class_id);
//! }
//! LedCtl::new(root.controller_for(1)).on().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod controller;
pub mod error;
pub mod master;

pub use connection::{LinkError, TcpLink};
pub use controller::{BusCtl, Controller, LedCtl, MotorCtl, ServoCtl};
pub use error::InvokeError;
pub use master::Master;
