//! Typed handles on remote devices.
//!
//! A [`Controller`] pins a [`RoutePath`] to a shared [`Master`], so callers
//! talk to "the device at route `[2, 1]`" instead of passing routes around.
//! [`BusCtl`], [`LedCtl`], [`MotorCtl`] and [`ServoCtl`] wrap a controller
//! with the methods of their device class.
//!
//! ```text
//!  BusCtl (route [])
//!    ├─ controller_for(1) ──► Controller (route [1])   ── LedCtl
//!    └─ bus_for(2)        ──► BusCtl     (route [2])
//!                               └─ controller_for(1) ──► route [2, 1]
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tbus_core::{
    payload, BusEnumeration, DeviceInfo, LedPowerState, MotorBrakeState, MotorDriveState,
    RoutePath, ServoPosition, BUS_METHOD_ENUMERATE, LED_METHOD_SET_POWER_STATE,
    METHOD_DEVICE_INFO, MOTOR_METHOD_BRAKE, MOTOR_METHOD_START, MOTOR_METHOD_STOP,
    SERVO_METHOD_SET_POSITION, SERVO_METHOD_STOP,
};

use crate::error::InvokeError;
use crate::master::Master;

/// A remote device reached through a fixed route.
#[derive(Clone)]
pub struct Controller {
    master: Arc<Master>,
    route: RoutePath,
}

impl Controller {
    pub fn new(master: Arc<Master>, route: RoutePath) -> Self {
        Self { master, route }
    }

    /// A controller for the device directly attached to the master's link.
    pub fn root(master: Arc<Master>) -> Self {
        Self::new(master, RoutePath::local())
    }

    pub fn route(&self) -> &RoutePath {
        &self.route
    }

    pub fn master(&self) -> &Arc<Master> {
        &self.master
    }

    /// Invokes `method` with a raw payload.
    pub async fn invoke(&self, method: u8, payload: Vec<u8>) -> Result<Vec<u8>, InvokeError> {
        self.master.invoke(method, payload, &self.route).await
    }

    /// Invokes `method` with request and reply going through the payload codec.
    pub async fn call<Req, Resp>(&self, method: u8, request: &Req) -> Result<Resp, InvokeError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let reply = self.invoke(method, payload::encode(request)?).await?;
        Ok(payload::decode(&reply)?)
    }

    pub async fn device_info(&self) -> Result<DeviceInfo, InvokeError> {
        self.call(METHOD_DEVICE_INFO, &()).await
    }

    /// A controller for the device at `address` on the bus this one controls.
    pub fn child(&self, address: u8) -> Controller {
        Controller::new(Arc::clone(&self.master), self.route.join(address))
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("route", &self.route.hops())
            .finish()
    }
}

// ── Bus ───────────────────────────────────────────────────────────────────────

/// Controller for a bus device.
#[derive(Debug, Clone)]
pub struct BusCtl {
    ctl: Controller,
}

impl BusCtl {
    pub fn new(ctl: Controller) -> Self {
        Self { ctl }
    }

    pub fn controller(&self) -> &Controller {
        &self.ctl
    }

    /// Lists the devices attached to the bus, in ascending address order.
    pub async fn enumerate(&self) -> Result<Vec<DeviceInfo>, InvokeError> {
        let enumeration: BusEnumeration = self.ctl.call(BUS_METHOD_ENUMERATE, &()).await?;
        Ok(enumeration.devices)
    }

    pub async fn device_info(&self) -> Result<DeviceInfo, InvokeError> {
        self.ctl.device_info().await
    }

    /// The device at `address` on this bus.
    pub fn controller_for(&self, address: u8) -> Controller {
        self.ctl.child(address)
    }

    /// The bus device at `address` on this bus.
    pub fn bus_for(&self, address: u8) -> BusCtl {
        BusCtl::new(self.ctl.child(address))
    }
}

// ── LED ───────────────────────────────────────────────────────────────────────

/// Controller for an LED device.
#[derive(Debug, Clone)]
pub struct LedCtl {
    ctl: Controller,
}

impl LedCtl {
    pub fn new(ctl: Controller) -> Self {
        Self { ctl }
    }

    pub async fn on(&self) -> Result<(), InvokeError> {
        self.set_power_state(LedPowerState::on()).await
    }

    pub async fn off(&self) -> Result<(), InvokeError> {
        self.set_power_state(LedPowerState::off()).await
    }

    /// Turns the LED on at `brightness`.
    pub async fn set_brightness(&self, brightness: u32) -> Result<(), InvokeError> {
        self.set_power_state(LedPowerState::with_brightness(brightness))
            .await
    }

    pub async fn set_power_state(&self, state: LedPowerState) -> Result<(), InvokeError> {
        self.ctl.call(LED_METHOD_SET_POWER_STATE, &state).await
    }
}

// ── Motor ─────────────────────────────────────────────────────────────────────

/// Controller for a motor device.
///
/// The signed helpers map onto the class methods: a positive speed starts
/// the motor forward, a negative one in reverse, and 0 stops it.
#[derive(Debug, Clone)]
pub struct MotorCtl {
    ctl: Controller,
}

impl MotorCtl {
    pub fn new(ctl: Controller) -> Self {
        Self { ctl }
    }

    pub async fn start(&self, drive: MotorDriveState) -> Result<(), InvokeError> {
        self.ctl.call(MOTOR_METHOD_START, &drive).await
    }

    pub async fn stop(&self) -> Result<(), InvokeError> {
        self.ctl.call(MOTOR_METHOD_STOP, &()).await
    }

    pub async fn brake(&self, brake: MotorBrakeState) -> Result<(), InvokeError> {
        self.ctl.call(MOTOR_METHOD_BRAKE, &brake).await
    }

    pub async fn forward(&self, speed: u32) -> Result<(), InvokeError> {
        self.set_speed(i64::from(speed)).await
    }

    pub async fn reverse(&self, speed: u32) -> Result<(), InvokeError> {
        self.set_speed(-i64::from(speed)).await
    }

    /// Starts or stops the motor according to the sign of `speed`.
    pub async fn set_speed(&self, speed: i64) -> Result<(), InvokeError> {
        match MotorDriveState::from_signed(speed) {
            Some(drive) => self.start(drive).await,
            None => self.stop().await,
        }
    }

    pub async fn set_brake(&self, on: bool) -> Result<(), InvokeError> {
        self.brake(MotorBrakeState { on }).await
    }
}

// ── Servo ─────────────────────────────────────────────────────────────────────

/// Controller for a servo device.
#[derive(Debug, Clone)]
pub struct ServoCtl {
    ctl: Controller,
}

impl ServoCtl {
    pub fn new(ctl: Controller) -> Self {
        Self { ctl }
    }

    pub async fn set_position(&self, position: ServoPosition) -> Result<(), InvokeError> {
        self.ctl.call(SERVO_METHOD_SET_POSITION, &position).await
    }

    /// Moves the servo to `angle` degrees.
    pub async fn move_to(&self, angle: u32) -> Result<(), InvokeError> {
        self.set_position(ServoPosition { angle }).await
    }

    /// Releases the servo.
    pub async fn stop(&self) -> Result<(), InvokeError> {
        self.ctl.call(SERVO_METHOD_STOP, &()).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tbus_core::protocol::decode_all;
    use tbus_core::{encode_message, Message, Transport, TransportError};

    /// Answers every request synchronously with `reply_payload`, echoing its id.
    struct Responder {
        master: std::sync::Weak<Master>,
        reply_payload: Vec<u8>,
        seen: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Transport for Responder {
        async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
            let request = decode_all(&bytes).unwrap().remove(0);
            let reply = Message::reply(request.msg_id, self.reply_payload.clone());
            self.seen.lock().unwrap().push(request);
            let master = self.master.upgrade().ok_or(TransportError::Closed)?;
            // Resolve after the caller has started waiting.
            tokio::spawn(async move { master.receive(&encode_message(&reply).unwrap()) });
            Ok(())
        }
    }

    fn responder(reply_payload: Vec<u8>) -> (Arc<Master>, Arc<Responder>) {
        let master = Master::new();
        let link = Arc::new(Responder {
            master: Arc::downgrade(&master),
            reply_payload,
            seen: Mutex::new(Vec::new()),
        });
        master.connect(Arc::clone(&link) as Arc<dyn Transport>);
        (master, link)
    }

    #[test]
    fn test_child_routes_extend_by_one_hop() {
        let master = Master::new();
        let bus = BusCtl::new(Controller::root(master));

        let nested = bus.bus_for(2).controller_for(1);

        assert_eq!(nested.route().hops(), &[2, 1]);
        assert!(bus.controller().route().is_empty());
    }

    #[tokio::test]
    async fn test_enumerate_decodes_bus_enumeration() {
        // Arrange
        let devices = vec![DeviceInfo::new(0x10, 4), DeviceInfo::new(0x10, 5)];
        let reply = payload::encode(&BusEnumeration {
            devices: devices.clone(),
        })
        .unwrap();
        let (master, link) = responder(reply);
        let bus = BusCtl::new(Controller::new(master, RoutePath::new([3])));

        // Act
        let listed = bus.enumerate().await.unwrap();

        // Assert
        assert_eq!(listed, devices);
        let seen = link.seen.lock().unwrap();
        assert_eq!(seen[0].body.flag, BUS_METHOD_ENUMERATE);
        assert_eq!(seen[0].route.hops(), &[3]);
    }

    #[tokio::test]
    async fn test_led_brightness_sends_power_state() {
        let (master, link) = responder(Vec::new());
        let led = LedCtl::new(Controller::root(master).child(1));

        led.set_brightness(55).await.unwrap();

        let seen = link.seen.lock().unwrap();
        assert_eq!(seen[0].body.flag, LED_METHOD_SET_POWER_STATE);
        let sent: LedPowerState = payload::decode(&seen[0].body.payload).unwrap();
        assert_eq!(sent, LedPowerState::with_brightness(55));
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_a_payload_error() {
        // A DeviceInfo needs far more than one byte.
        let (master, _link) = responder(vec![1]);

        let result = Controller::root(master).device_info().await;

        assert!(matches!(result, Err(InvokeError::Payload(_))));
    }

    #[tokio::test]
    async fn test_motor_speed_sign_selects_method() {
        // Arrange
        let (master, link) = responder(Vec::new());
        let motor = MotorCtl::new(Controller::root(master).child(2));

        // Act
        motor.reverse(70).await.unwrap();
        motor.set_speed(0).await.unwrap();
        motor.forward(tbus_core::MOTOR_DEFAULT_SPEED).await.unwrap();

        // Assert
        let seen = link.seen.lock().unwrap();
        let methods: Vec<u8> = seen.iter().map(|m| m.body.flag).collect();
        assert_eq!(methods, vec![MOTOR_METHOD_START, MOTOR_METHOD_STOP, MOTOR_METHOD_START]);
        let reverse: MotorDriveState = payload::decode(&seen[0].body.payload).unwrap();
        assert_eq!(reverse.signed_speed(), -70);
        let forward: MotorDriveState = payload::decode(&seen[2].body.payload).unwrap();
        assert_eq!(forward.signed_speed(), 255);
        assert!(seen[1].body.payload.is_empty(), "stop carries no payload");
    }

    #[tokio::test]
    async fn test_motor_brake_sends_brake_state() {
        let (master, link) = responder(Vec::new());

        MotorCtl::new(Controller::root(master)).set_brake(true).await.unwrap();

        let seen = link.seen.lock().unwrap();
        assert_eq!(seen[0].body.flag, MOTOR_METHOD_BRAKE);
        let sent: MotorBrakeState = payload::decode(&seen[0].body.payload).unwrap();
        assert!(sent.on);
    }

    #[tokio::test]
    async fn test_servo_move_to_sends_position() {
        let (master, link) = responder(Vec::new());

        ServoCtl::new(Controller::root(master)).move_to(90).await.unwrap();

        let seen = link.seen.lock().unwrap();
        assert_eq!(seen[0].body.flag, SERVO_METHOD_SET_POSITION);
        let sent: ServoPosition = payload::decode(&seen[0].body.payload).unwrap();
        assert_eq!(sent.angle, 90);
    }
}
