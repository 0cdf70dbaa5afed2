//! Reference servo device.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use tbus_core::{ServoPosition, SERVO_CLASS_ID, SERVO_METHOD_SET_POSITION, SERVO_METHOD_STOP};
use tracing::info;

use crate::device::{Device, DeviceBuilder, DeviceLogic, MethodTable};

/// Holds the angle the servo was last told to move to.  `Stop` releases it.
#[derive(Default)]
pub struct ServoLogic {
    target: Mutex<Option<u32>>,
    device: Mutex<Weak<Device>>,
}

impl ServoLogic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Builds a servo device driven by a fresh `ServoLogic`.
    pub fn device(device_id: u32, labels: BTreeMap<String, String>) -> (Arc<Device>, Arc<Self>) {
        let logic = Self::new();
        let device = DeviceBuilder::new(SERVO_CLASS_ID, device_id)
            .labels(labels)
            .build(Arc::clone(&logic));
        (device, logic)
    }

    /// The angle being held, `None` when released.
    pub fn target(&self) -> Option<u32> {
        *self.target.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_target(&self, target: Option<u32>) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = target;
        let device_id = self
            .device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
            .map(|d| d.device_id());
        info!(?device_id, ?target, "servo target changed");
    }
}

impl DeviceLogic for ServoLogic {
    fn set_device(&self, device: Weak<Device>) {
        *self.device.lock().unwrap_or_else(|e| e.into_inner()) = device;
    }

    fn methods(self: Arc<Self>, table: &mut MethodTable) {
        let logic = Arc::clone(&self);
        table.register_typed(SERVO_METHOD_SET_POSITION, move |position: ServoPosition| {
            logic.set_target(Some(position.angle));
            async { Ok(()) }
        });
        table.register_typed(SERVO_METHOD_STOP, move |(): ()| {
            self.set_target(None);
            async { Ok(()) }
        });
    }
}
