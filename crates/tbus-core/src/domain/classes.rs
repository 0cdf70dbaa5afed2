//! Well-known device classes, method indices and their payload types.
//!
//! Method index 0 is reserved on every device and answers with the device's
//! [`DeviceInfo`](super::device_info::DeviceInfo).  Indices with the top bit
//! set collide with the error body flag and are never valid method numbers.

use serde::{Deserialize, Serialize};

/// Reserved method answering every device's `DeviceInfo`.
pub const METHOD_DEVICE_INFO: u8 = 0;

/// First method index that can never be registered.
pub const METHOD_INDEX_LIMIT: u8 = 0x80;

// ── Bus ───────────────────────────────────────────────────────────────────────

/// Class id of a bus's representative device.
pub const BUS_CLASS_ID: u32 = 0x0001;

/// Bus method returning a `BusEnumeration` of all attached devices.
pub const BUS_METHOD_ENUMERATE: u8 = 1;

// ── LED ───────────────────────────────────────────────────────────────────────

pub const LED_CLASS_ID: u32 = 0x0010;

/// LED method taking an [`LedPowerState`] and returning nothing.
pub const LED_METHOD_SET_POWER_STATE: u8 = 1;

/// Requested LED state.  A brightness of 0 means "device default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedPowerState {
    pub on: bool,
    pub brightness: u32,
}

impl LedPowerState {
    pub fn on() -> Self {
        Self {
            on: true,
            brightness: 0,
        }
    }

    pub fn off() -> Self {
        Self::default()
    }

    pub fn with_brightness(brightness: u32) -> Self {
        Self {
            on: true,
            brightness,
        }
    }
}

// ── Motor ─────────────────────────────────────────────────────────────────────

pub const MOTOR_CLASS_ID: u32 = 0x0020;

/// Takes a [`MotorDriveState`].
pub const MOTOR_METHOD_START: u8 = 1;
/// No payload.
pub const MOTOR_METHOD_STOP: u8 = 2;
/// Takes a [`MotorBrakeState`].
pub const MOTOR_METHOD_BRAKE: u8 = 3;

/// Speed used by the motor helpers when the caller gives none.
pub const MOTOR_DEFAULT_SPEED: u32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MotorDirection {
    #[default]
    Forward,
    Reverse,
}

/// Requested motor drive: direction plus a non-zero speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotorDriveState {
    pub direction: MotorDirection,
    pub speed: u32,
}

impl MotorDriveState {
    /// Converts a signed speed into a drive state.
    ///
    /// Positive means forward, negative means reverse.  Returns `None` for 0,
    /// which callers express as a `Stop` instead.
    pub fn from_signed(speed: i64) -> Option<Self> {
        if speed == 0 {
            return None;
        }
        let direction = if speed > 0 {
            MotorDirection::Forward
        } else {
            MotorDirection::Reverse
        };
        let speed = u32::try_from(speed.unsigned_abs()).unwrap_or(u32::MAX);
        Some(Self { direction, speed })
    }

    /// The drive as a signed speed, the inverse of [`MotorDriveState::from_signed`].
    pub fn signed_speed(&self) -> i64 {
        match self.direction {
            MotorDirection::Forward => i64::from(self.speed),
            MotorDirection::Reverse => -i64::from(self.speed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotorBrakeState {
    pub on: bool,
}

// ── Servo ─────────────────────────────────────────────────────────────────────

pub const SERVO_CLASS_ID: u32 = 0x0024;

/// Takes a [`ServoPosition`].
pub const SERVO_METHOD_SET_POSITION: u8 = 1;
/// No payload.
pub const SERVO_METHOD_STOP: u8 = 2;

/// Target angle in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServoPosition {
    pub angle: u32,
}

/// `true` when `index` may be registered as an application method.
pub fn is_registrable_method(index: u8) -> bool {
    index != METHOD_DEVICE_INFO && index < METHOD_INDEX_LIMIT
}

// ── Tests ─────────────────────────────────────────────────────────────────────
