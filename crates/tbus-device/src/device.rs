//! Devices and their method tables.
//!
//! # How a request reaches a handler (for beginners)
//!
//! ```text
//!  HostPort ──dispatch_msg──► Device ──route non-empty?──► MsgRouter (a Bus)
//!                               │
//!                               ├─ method 0   ──► reply with DeviceInfo
//!                               ├─ unknown    ──► Err(UnknownMethod)
//!                               └─ known      ──► HandlerTask ──► reply
//! ```
//!
//! A device never writes to a socket itself.  Replies go *up* through the
//! [`BusPort`] the device is attached to: a parent [`Bus`](crate::bus::Bus),
//! or the [`HostPort`](crate::host::HostPort) for the root device.
//!
//! # Deferred handlers
//!
//! `dispatch_msg` never runs handler code.  For a registered method it returns
//! a [`HandlerTask`]: a future that runs the handler and sends the reply up.
//! The endpoint that received the request owns that future, spawns it, and
//! aborts it when its session ends.  An endpoint that decodes several requests
//! from one chunk therefore delivers all of them before the first handler
//! runs, and a reply can never outlive the session that asked for it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tbus_core::domain::classes::is_registrable_method;
use tbus_core::{payload, DeviceInfo, ErrorDescriptor, Message, METHOD_DEVICE_INFO};
use tracing::{debug, error, warn};

use crate::error::{BusError, DispatchError, MethodError};

// ── Seams ─────────────────────────────────────────────────────────────────────

/// The upward path of a device: where its replies go.
pub trait BusPort: Send + Sync {
    /// Sends `msg` towards the master.  Failures are logged, not returned.
    fn send_msg(&self, msg: Message);

    /// The device that forwards this port's traffic further up, if any.
    fn owner(&self) -> Option<Arc<Device>> {
        None
    }
}

/// Something that can forward a message whose route is not yet exhausted.
pub trait MsgRouter: Send + Sync {
    fn route_msg(&self, msg: Message) -> Result<Option<HandlerTask>, DispatchError>;
}

/// A dispatched request still waiting for its handler.
///
/// Resolves once the reply has been handed to the device's bus port.
pub type HandlerTask = BoxFuture<'static, ()>;

/// The behaviour behind a device.
///
/// Called once, while the device is being built.  Every method has a default
/// so a logic only implements what it needs.
pub trait DeviceLogic: Send + Sync + 'static {
    /// Hands the logic a weak reference to the device it drives.
    fn set_device(&self, _device: Weak<Device>) {}

    /// Registers the device's methods.
    fn methods(self: Arc<Self>, _table: &mut MethodTable) {}

    /// Returns a router when the device forwards messages to other devices.
    fn router(self: Arc<Self>) -> Option<Arc<dyn MsgRouter>> {
        None
    }

    /// Returns a router that takes every message for the device, whatever its
    /// route or method.  Used by stand-ins for devices that live elsewhere.
    fn proxy(self: Arc<Self>) -> Option<Arc<dyn MsgRouter>> {
        None
    }
}

/// A device with no methods besides `DeviceInfo`.
impl DeviceLogic for () {}

// ── Method table ──────────────────────────────────────────────────────────────

/// A registered method: takes the request payload, returns the reply payload.
pub type MethodHandler =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, MethodError>> + Send + Sync>;

/// Maps method indices to handlers.
#[derive(Default, Clone)]
pub struct MethodTable {
    handlers: BTreeMap<u8, MethodHandler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler working on raw payload bytes.
    ///
    /// Index 0 is reserved for `DeviceInfo` and indices from 0x80 up clash
    /// with the error flag; both are logged and skipped.
    pub fn register<F, Fut>(&mut self, index: u8, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, MethodError>> + Send + 'static,
    {
        if !is_registrable_method(index) {
            warn!("method index {index} is reserved; handler not registered");
            return;
        }
        let handler: MethodHandler = Arc::new(move |bytes: Vec<u8>| handler(bytes).boxed());
        self.handlers.insert(index, handler);
    }

    /// Registers a handler whose request and reply go through the payload codec.
    pub fn register_typed<Req, Resp, F, Fut>(&mut self, index: u8, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, MethodError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(index, move |bytes: Vec<u8>| {
            let handler = Arc::clone(&handler);
            async move {
                let request: Req = payload::decode(&bytes)?;
                let response = (*handler)(request).await?;
                Ok::<_, MethodError>(payload::encode(&response)?)
            }
        });
    }

    pub fn get(&self, index: u8) -> Option<MethodHandler> {
        self.handlers.get(&index).cloned()
    }

    /// Registered indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = u8> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

/// Where a device is currently attached.
#[derive(Default)]
struct Slot {
    address: u8,
    port: Option<Weak<dyn BusPort>>,
}

/// A leaf device or a bus's representative device.
pub struct Device {
    class_id: u32,
    device_id: u32,
    labels: BTreeMap<String, String>,
    methods: MethodTable,
    router: Option<Arc<dyn MsgRouter>>,
    proxy: Option<Arc<dyn MsgRouter>>,
    slot: Mutex<Slot>,
}

/// Builds a [`Device`] from its identity and a [`DeviceLogic`].
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use tbus_device::device::DeviceBuilder;
///
/// let device = DeviceBuilder::new(0x10, 42)
///     .label("name", "status")
///     .build(Arc::new(()));
/// assert_eq!(device.info().device_id, 42);
/// assert!(!device.is_attached());
/// ```
pub struct DeviceBuilder {
    class_id: u32,
    device_id: u32,
    labels: BTreeMap<String, String>,
}

impl DeviceBuilder {
    pub fn new(class_id: u32, device_id: u32) -> Self {
        Self {
            class_id,
            device_id,
            labels: BTreeMap::new(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn build<L: DeviceLogic>(self, logic: Arc<L>) -> Arc<Device> {
        let mut methods = MethodTable::new();
        Arc::clone(&logic).methods(&mut methods);
        let router = Arc::clone(&logic).router();
        let proxy = Arc::clone(&logic).proxy();

        let device = Arc::new(Device {
            class_id: self.class_id,
            device_id: self.device_id,
            labels: self.labels,
            methods,
            router,
            proxy,
            slot: Mutex::new(Slot::default()),
        });
        logic.set_device(Arc::downgrade(&device));
        device
    }
}

impl Device {
    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Current address on the owning bus; 0 when unattached.
    pub fn address(&self) -> u8 {
        self.slot().address
    }

    pub fn is_attached(&self) -> bool {
        self.slot().port.is_some()
    }

    /// `true` when the device can forward messages further down the tree.
    pub fn can_route(&self) -> bool {
        self.router.is_some()
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    /// Produces the device's self-description.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            address: self.address(),
            class_id: self.class_id,
            device_id: self.device_id,
            labels: self.labels.clone(),
        }
    }

    /// Attaches the device to `port` under `address`.
    pub fn attach(&self, address: u8, port: Weak<dyn BusPort>) -> Result<(), BusError> {
        let mut slot = self.slot();
        if slot.port.is_some() {
            return Err(BusError::AlreadyAttached);
        }
        slot.address = address;
        slot.port = Some(port);
        Ok(())
    }

    /// Detaches the device from its port.  Detaching twice is harmless.
    pub fn detach(&self) {
        *self.slot() = Slot::default();
    }

    /// Delivers a message addressed to this device or to a device below it.
    ///
    /// `DeviceInfo` is answered before returning and yields `None`.  Any other
    /// method yields the [`HandlerTask`] that will answer it; the caller must
    /// drive it.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::RoutingNotSupported`] when the route continues but
    ///   the device has no router.
    /// - [`DispatchError::UnknownMethod`] when nothing is registered at the
    ///   requested index.
    /// - Any error of the router the message was forwarded to.
    pub fn dispatch_msg(
        self: &Arc<Self>,
        msg: Message,
    ) -> Result<Option<HandlerTask>, DispatchError> {
        if let Some(proxy) = &self.proxy {
            return proxy.route_msg(msg);
        }
        if !msg.route.is_empty() {
            return match &self.router {
                Some(router) => router.route_msg(msg),
                None => Err(DispatchError::RoutingNotSupported),
            };
        }

        let method = msg.body.flag;
        if method == METHOD_DEVICE_INFO {
            let bytes = payload::encode(&self.info())?;
            self.send_up(Message::reply(msg.msg_id, bytes));
            return Ok(None);
        }

        let handler = self
            .methods
            .get(method)
            .ok_or(DispatchError::UnknownMethod(method))?;

        debug!(
            device_id = self.device_id,
            method,
            msg_id = msg.msg_id,
            "invoking method"
        );
        let device = Arc::clone(self);
        let msg_id = msg.msg_id;
        let request = msg.body.payload;
        let task = async move {
            let reply = match handler(request).await {
                Ok(bytes) => Message::reply(msg_id, bytes),
                Err(e) => {
                    debug!(device_id = device.device_id, method, "method failed: {e}");
                    Message::error_reply(msg_id, &ErrorDescriptor::method(e.to_string()))
                }
            };
            device.send_up(reply);
        };
        Ok(Some(task.boxed()))
    }

    /// The port the device is attached to, if it is still alive.
    pub fn port(&self) -> Option<Arc<dyn BusPort>> {
        self.slot().port.as_ref()?.upgrade()
    }

    /// The device one level up the tree: the representative of the owning bus.
    pub fn parent(&self) -> Option<Arc<Device>> {
        self.port()?.owner()
    }

    /// Sends a message up through the owning port.
    pub fn send_up(&self, msg: Message) {
        match self.port() {
            Some(port) => port.send_msg(msg),
            None => error!(
                device_id = self.device_id,
                msg_id = msg.msg_id,
                "device has no bus port; reply dropped"
            ),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        // A poisoned slot only means another thread panicked mid-update of two
        // plain fields; the data is still usable.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("class_id", &self.class_id)
            .field("device_id", &self.device_id)
            .field("address", &self.address())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use std::sync::mpsc;
    use tbus_core::protocol::BF_ERROR;
    use tbus_core::{ErrorKind, RoutePath};

    mock! {
        pub Port {}
        impl BusPort for Port {
            fn send_msg(&self, msg: Message);
        }
    }

    /// Builds a port that forwards every message onto a channel.
    fn capturing_port() -> (Arc<MockPort>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let mut port = MockPort::new();
        port.expect_send_msg().returning(move |msg| {
            let _ = tx.lock().unwrap().send(msg);
        });
        (Arc::new(port), rx)
    }

    struct Echo;

    impl DeviceLogic for Echo {
        fn methods(self: Arc<Self>, table: &mut MethodTable) {
            table.register(1, |bytes| async move { Ok(bytes) });
            table.register(2, |_| async move { Err(MethodError::failed("no power")) });
            // Reserved indices are skipped.
            table.register(0, |_| async move { Ok(Vec::new()) });
            table.register(0x80, |_| async move { Ok(Vec::new()) });
        }
    }

    /// Spawns the handler task of a dispatched request.
    fn spawn_handler(device: &Arc<Device>, msg: Message) {
        let task = device.dispatch_msg(msg).unwrap().expect("handler task");
        tokio::spawn(task);
    }

    /// Lets spawned handlers run, then returns the first captured message.
    async fn next_reply(rx: &mpsc::Receiver<Message>) -> Message {
        for _ in 0..10 {
            if let Ok(msg) = rx.try_recv() {
                return msg;
            }
            tokio::task::yield_now().await;
        }
        panic!("no reply was sent");
    }

    fn attached_echo() -> (Arc<Device>, Arc<MockPort>, mpsc::Receiver<Message>) {
        let device = DeviceBuilder::new(0x42, 7).label("name", "echo").build(Arc::new(Echo));
        let (port, rx) = capturing_port();
        let weak: Weak<dyn BusPort> = Arc::downgrade(&port) as Weak<dyn BusPort>;
        device.attach(3, weak).unwrap();
        (device, port, rx)
    }

    #[test]
    fn test_reserved_indices_are_not_registered() {
        let device = DeviceBuilder::new(1, 1).build(Arc::new(Echo));
        assert_eq!(device.methods().indices().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_attach_twice_fails() {
        // Arrange
        let (device, port, _rx) = attached_echo();

        // Act
        let second = device.attach(4, Arc::downgrade(&port) as Weak<dyn BusPort>);

        // Assert
        assert_eq!(second, Err(BusError::AlreadyAttached));
        assert_eq!(device.address(), 3, "first attachment is kept");
    }

    #[test]
    fn test_detach_clears_address() {
        let (device, _port, _rx) = attached_echo();
        device.detach();
        assert!(!device.is_attached());
        assert_eq!(device.info().address, 0);
    }

    #[tokio::test]
    async fn test_method_zero_replies_with_device_info() {
        // Arrange
        let (device, _port, rx) = attached_echo();

        // Act
        let task = device
            .dispatch_msg(Message::request(11, RoutePath::local(), 0, Vec::new()))
            .unwrap();

        // Assert – answered synchronously, no task involved
        assert!(task.is_none());
        let reply = rx.try_recv().expect("reply sent");
        assert_eq!(reply.msg_id, 11);
        let info: DeviceInfo = payload::decode(&reply.body.payload).unwrap();
        assert_eq!(info.address, 3);
        assert_eq!(info.class_id, 0x42);
        assert_eq!(info.label("name"), Some("echo"));
    }

    #[tokio::test]
    async fn test_handler_runs_only_when_its_task_is_driven() {
        // Arrange
        let (device, _port, rx) = attached_echo();

        // Act
        let task = device
            .dispatch_msg(Message::request(12, RoutePath::local(), 1, vec![9, 8]))
            .unwrap()
            .expect("handler task");

        // Assert – nothing until the caller runs the task
        assert!(rx.try_recv().is_err());
        tokio::spawn(task);
        let reply = next_reply(&rx).await;
        assert_eq!(reply.msg_id, 12);
        assert_eq!(reply.body.flag, 0);
        assert_eq!(reply.body.payload, vec![9, 8]);
    }

    #[tokio::test]
    async fn test_failing_handler_sends_method_error_reply() {
        let (device, _port, rx) = attached_echo();

        spawn_handler(&device, Message::request(13, RoutePath::local(), 2, Vec::new()));

        let reply = next_reply(&rx).await;
        assert_eq!(reply.body.flag, BF_ERROR);
        let descriptor = ErrorDescriptor::from_payload(&reply.body.payload).unwrap();
        assert_eq!(descriptor.kind, ErrorKind::Method);
        assert_eq!(descriptor.message, "no power");
    }

    #[tokio::test]
    async fn test_unknown_method_is_reported_to_the_caller() {
        let (device, _port, rx) = attached_echo();

        let result = device.dispatch_msg(Message::request(14, RoutePath::local(), 5, Vec::new()));

        assert!(matches!(result, Err(DispatchError::UnknownMethod(5))));
        assert!(rx.try_recv().is_err(), "the device itself sends nothing");
    }

    #[tokio::test]
    async fn test_routed_message_without_router_fails() {
        let (device, _port, _rx) = attached_echo();

        let result = device.dispatch_msg(Message::request(15, RoutePath::new([1]), 1, Vec::new()));

        assert!(matches!(result, Err(DispatchError::RoutingNotSupported)));
    }

    #[tokio::test]
    async fn test_dropped_handler_task_never_replies() {
        // Arrange
        let (device, _port, rx) = attached_echo();
        let task = device
            .dispatch_msg(Message::request(16, RoutePath::local(), 1, vec![1]))
            .unwrap();

        // Act
        drop(task);
        tokio::task::yield_now().await;

        // Assert
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reply_without_port_is_dropped_not_panicking() {
        // Arrange – never attached
        let device = DeviceBuilder::new(1, 1).build(Arc::new(Echo));

        // Act / Assert – logged on the error channel, no panic
        device
            .dispatch_msg(Message::request(1, RoutePath::local(), 0, Vec::new()))
            .unwrap();
    }

    #[test]
    fn test_set_device_receives_the_built_device() {
        struct Remember(Mutex<Weak<Device>>);
        impl DeviceLogic for Remember {
            fn set_device(&self, device: Weak<Device>) {
                *self.0.lock().unwrap() = device;
            }
        }

        let logic = Arc::new(Remember(Mutex::new(Weak::new())));
        let device = DeviceBuilder::new(1, 2).build(Arc::clone(&logic));

        let remembered = logic.0.lock().unwrap().upgrade().expect("device alive");
        assert!(Arc::ptr_eq(&remembered, &device));
    }
}
