//! Reference motor device.
//!
//! Tracks the drive and brake state a master requested.  Real hardware would
//! drive an H-bridge where this logs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use tbus_core::{
    MotorBrakeState, MotorDriveState, MOTOR_CLASS_ID, MOTOR_METHOD_BRAKE, MOTOR_METHOD_START,
    MOTOR_METHOD_STOP,
};
use tracing::info;

use crate::device::{Device, DeviceBuilder, DeviceLogic, MethodTable};
use crate::error::MethodError;

/// What the motor is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotorState {
    /// `None` while stopped.
    pub drive: Option<MotorDriveState>,
    pub brake: bool,
}

#[derive(Default)]
pub struct MotorLogic {
    state: Mutex<MotorState>,
    device: Mutex<Weak<Device>>,
}

impl MotorLogic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Builds a motor device driven by a fresh `MotorLogic`.
    pub fn device(device_id: u32, labels: BTreeMap<String, String>) -> (Arc<Device>, Arc<Self>) {
        let logic = Self::new();
        let device = DeviceBuilder::new(MOTOR_CLASS_ID, device_id)
            .labels(labels)
            .build(Arc::clone(&logic));
        (device, logic)
    }

    pub fn state(&self) -> MotorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, change: impl FnOnce(&mut MotorState)) {
        let state = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            change(&mut state);
            *state
        };
        let device_id = self
            .device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
            .map(|d| d.device_id());
        info!(
            ?device_id,
            speed = state.drive.map(|d| d.signed_speed()).unwrap_or(0),
            brake = state.brake,
            "motor state changed"
        );
    }
}

impl DeviceLogic for MotorLogic {
    fn set_device(&self, device: Weak<Device>) {
        *self.device.lock().unwrap_or_else(|e| e.into_inner()) = device;
    }

    fn methods(self: Arc<Self>, table: &mut MethodTable) {
        let logic = Arc::clone(&self);
        table.register_typed(MOTOR_METHOD_START, move |drive: MotorDriveState| {
            let result = if drive.speed == 0 {
                Err(MethodError::failed("start needs a non-zero speed"))
            } else {
                logic.update(|s| s.drive = Some(drive));
                Ok(())
            };
            async move { result }
        });

        let logic = Arc::clone(&self);
        table.register_typed(MOTOR_METHOD_STOP, move |(): ()| {
            logic.update(|s| s.drive = None);
            async { Ok(()) }
        });

        table.register_typed(MOTOR_METHOD_BRAKE, move |brake: MotorBrakeState| {
            self.update(|s| s.brake = brake.on);
            async { Ok(()) }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tbus_core::{payload, MotorDirection};

    async fn call<T: serde::Serialize>(
        device: &Device,
        method: u8,
        request: &T,
    ) -> Result<Vec<u8>, MethodError> {
        let handler = device.methods().get(method).expect("method registered");
        handler(payload::encode(request).unwrap()).await
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        // Arrange
        let (device, logic) = MotorLogic::device(1, BTreeMap::new());
        let drive = MotorDriveState {
            direction: MotorDirection::Reverse,
            speed: 90,
        };

        // Act
        call(&device, MOTOR_METHOD_START, &drive).await.unwrap();
        let running = logic.state();
        call(&device, MOTOR_METHOD_STOP, &()).await.unwrap();

        // Assert
        assert_eq!(running.drive, Some(drive));
        assert_eq!(logic.state().drive, None);
    }

    #[tokio::test]
    async fn test_brake_is_independent_of_drive() {
        let (device, logic) = MotorLogic::device(1, BTreeMap::new());

        call(&device, MOTOR_METHOD_BRAKE, &MotorBrakeState { on: true })
            .await
            .unwrap();

        assert_eq!(logic.state(), MotorState { drive: None, brake: true });
    }

    #[tokio::test]
    async fn test_start_at_zero_speed_fails() {
        let (device, logic) = MotorLogic::device(1, BTreeMap::new());

        let result = call(&device, MOTOR_METHOD_START, &MotorDriveState::default()).await;

        assert_eq!(result.unwrap_err().to_string(), "start needs a non-zero speed");
        assert_eq!(logic.state(), MotorState::default());
    }
}
