//! Self-descriptions reported by devices.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What a device reports when asked for method 0.
///
/// `address` is the device's address on the bus it is attached to, or 0 when
/// the device is not attached (or is the bus's own representative).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub address: u8,
    pub class_id: u32,
    pub device_id: u32,
    /// Free-form key/value labels such as `name` or `location`.
    pub labels: BTreeMap<String, String>,
}

impl DeviceInfo {
    pub fn new(class_id: u32, device_id: u32) -> Self {
        Self {
            address: 0,
            class_id,
            device_id,
            labels: BTreeMap::new(),
        }
    }

    /// Adds a label, builder style.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Reply payload of the bus `Enumerate` method: every attached device in
/// ascending address order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusEnumeration {
    pub devices: Vec<DeviceInfo>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;

    #[test]
    fn test_new_device_info_is_unattached() {
        let info = DeviceInfo::new(0x10, 7);
        assert_eq!(info.address, 0);
        assert!(info.labels.is_empty());
    }

    #[test]
    fn test_labels_survive_payload_encoding() {
        // Arrange
        let info = DeviceInfo::new(0x10, 7)
            .with_label("name", "status")
            .with_label("color", "green");

        // Act
        let bytes = payload::encode(&info).unwrap();
        let decoded: DeviceInfo = payload::decode(&bytes).unwrap();

        // Assert
        assert_eq!(decoded, info);
        assert_eq!(decoded.label("color"), Some("green"));
        assert_eq!(decoded.label("missing"), None);
    }
}
