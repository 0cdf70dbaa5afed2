//! TOML configuration for the device host.
//!
//! The config describes the device tree the host serves: a root bus and, in
//! address order, the devices plugged into it.  A `bus` entry nests another
//! bus with its own device list.  Example:
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:7600"
//! device_bind_address = "0.0.0.0:7601"   # optional, for remote devices
//!
//! [bus]
//! device_id = 1
//! labels = { name = "bench" }
//!
//! [[bus.devices]]                # address 1
//! kind = "led"
//! device_id = 10
//! labels = { name = "status", color = "green" }
//!
//! [[bus.devices]]                # address 2
//! kind = "bus"
//! device_id = 20
//!
//! [[bus.devices.devices]]        # route [2, 1]
//! kind = "motor"
//! device_id = 21
//!
//! [[bus.devices.devices]]        # route [2, 2]
//! kind = "servo"
//! device_id = 22
//! ```
//!
//! # Serde default values
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! host with a bare root bus listening on `127.0.0.1:7600`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::bus::Bus;
use crate::device::Device;
use crate::error::BusError;
use crate::logic::{LedLogic, MotorLogic, ServoLogic};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// `host:port` the TCP device server binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// When set, remote devices connecting here are plugged into the root bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_bind_address: Option<String>,
}

/// A bus and the devices plugged into it, in address order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    #[serde(default = "default_bus_device_id")]
    pub device_id: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// One device plugged into a bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceEntry {
    Led(LeafEntry),
    Motor(LeafEntry),
    Servo(LeafEntry),
    Bus(BusConfig),
}

/// Identity of a leaf device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeafEntry {
    pub device_id: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl LeafEntry {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            labels: BTreeMap::new(),
        }
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "127.0.0.1:7600".to_string()
}
fn default_bus_device_id() -> u32 {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            device_bind_address: None,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device_id: default_bus_device_id(),
            labels: BTreeMap::new(),
            devices: Vec::new(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HostConfig {
    /// Reads the config at `path`.  A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no config at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Builds the configured tree.
    pub fn build_device_tree(&self) -> Result<DeviceTree, BusError> {
        let (bus, root) = build_bus(&self.bus)?;
        Ok(DeviceTree { bus, root })
    }
}

impl BusConfig {
    /// Number of devices below this bus, nested buses included.
    pub fn device_count(&self) -> usize {
        self.devices
            .iter()
            .map(|entry| match entry {
                DeviceEntry::Bus(bus) => 1 + bus.device_count(),
                _ => 1,
            })
            .sum()
    }
}

fn build_bus(config: &BusConfig) -> Result<(Arc<Bus>, Arc<Device>), BusError> {
    let bus = Bus::new();
    for entry in &config.devices {
        let device = match entry {
            DeviceEntry::Led(leaf) => LedLogic::device(leaf.device_id, leaf.labels.clone()).0,
            DeviceEntry::Motor(leaf) => MotorLogic::device(leaf.device_id, leaf.labels.clone()).0,
            DeviceEntry::Servo(leaf) => ServoLogic::device(leaf.device_id, leaf.labels.clone()).0,
            DeviceEntry::Bus(nested) => build_bus(nested)?.1,
        };
        bus.plug(&device)?;
    }
    let device = bus.into_device(config.device_id, config.labels.clone());
    Ok((bus, device))
}

/// The root bus and its representative device.
///
/// Holding `root` keeps the whole tree alive.
pub struct DeviceTree {
    pub bus: Arc<Bus>,
    pub root: Arc<Device>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
