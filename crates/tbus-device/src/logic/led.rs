//! Reference LED device.
//!
//! Keeps its power state in memory and logs every change.  Real hardware
//! would drive a GPIO or PWM pin where this logs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use tbus_core::{LedPowerState, LED_CLASS_ID, LED_METHOD_SET_POWER_STATE};
use tracing::info;

use crate::device::{Device, DeviceBuilder, DeviceLogic, MethodTable};

#[derive(Default)]
pub struct LedLogic {
    state: Mutex<LedPowerState>,
    device: Mutex<Weak<Device>>,
}

impl LedLogic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Builds an LED device driven by a fresh `LedLogic`.
    pub fn device(device_id: u32, labels: BTreeMap<String, String>) -> (Arc<Device>, Arc<Self>) {
        let logic = Self::new();
        let device = DeviceBuilder::new(LED_CLASS_ID, device_id)
            .labels(labels)
            .build(Arc::clone(&logic));
        (device, logic)
    }

    /// The last state a master set.
    pub fn state(&self) -> LedPowerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_power_state(&self, requested: LedPowerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = requested;
        let device_id = self
            .device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
            .map(|d| d.device_id());
        info!(
            ?device_id,
            on = requested.on,
            brightness = requested.brightness,
            "LED power state changed"
        );
    }
}

impl DeviceLogic for LedLogic {
    fn set_device(&self, device: Weak<Device>) {
        *self.device.lock().unwrap_or_else(|e| e.into_inner()) = device;
    }

    fn methods(self: Arc<Self>, table: &mut MethodTable) {
        table.register_typed(LED_METHOD_SET_POWER_STATE, move |requested: LedPowerState| {
            self.set_power_state(requested);
            async { Ok(()) }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
