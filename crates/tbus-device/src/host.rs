//! The device-side end of a link.
//!
//! A [`HostPort`] sits between a byte stream and the root device of a device
//! tree:
//!
//! ```text
//!   bytes in ──► HostPort::receive ──► Decoder ──► root.dispatch_msg
//!                                                     │
//!   bytes out ◄── upstream Transport ◄── send_msg ◄───┘ (replies)
//! ```
//!
//! The root device is attached to the port at address 0 for as long as the
//! port is open.  [`HostPort::close`] detaches it again so the same device
//! tree can be served to the next connection.
//!
//! # Sessions
//!
//! The port owns every handler task started by a request it received.  Closing
//! the port aborts them, so a handler that is still running when one master
//! goes away cannot reply into the next master's session.
//!
//! # Remote attach
//!
//! [`HostPort::announce`] runs the port the other way round: the device
//! connects out to a bus served by another process.
//!
//! ```text
//!  device ── id 0, DeviceInfo ──────────────► bus host plugs a stand-in
//!  device ◄── id 0, DeviceInfo with address ── bus host
//!  device attaches under that address; requests flow as usual
//! ```
//!
//! The bus side of this exchange is [`RemoteDevice`](crate::remote::RemoteDevice).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tbus_core::{
    encode_message, payload, DecodeEvent, Decoder, DeviceInfo, Message, RoutePath, Transport,
    TransportError, METHOD_DEVICE_INFO,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::device::{BusPort, Device, HandlerTask};
use crate::error::BusError;

/// Connects a root device to an upstream [`Transport`].
pub struct HostPort {
    device: Arc<Device>,
    decoder: Mutex<Decoder>,
    upstream: Arc<dyn Transport>,
    /// Handler tasks of requests received on this port.
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
    /// Set between `announce` and the remote bus's address assignment.
    awaiting_address: AtomicBool,
    this: Weak<HostPort>,
}

impl HostPort {
    /// Attaches `device` at address 0 and returns the open port.
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyAttached`] when the device is still attached
    /// elsewhere (for example to a port that was never closed).
    pub fn open(device: Arc<Device>, upstream: Arc<dyn Transport>) -> Result<Arc<Self>, BusError> {
        let host = Self::new(device, upstream, false);
        host.device.attach(0, host.weak_port())?;
        Ok(host)
    }

    /// Offers `device` to a remote bus reached through `upstream`.
    ///
    /// Sends the device's `DeviceInfo` as message 0.  The device stays
    /// unattached until the bus answers with the address it assigned.
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyAttached`] when the device is attached elsewhere.
    pub fn announce(
        device: Arc<Device>,
        upstream: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, BusError> {
        if device.is_attached() {
            return Err(BusError::AlreadyAttached);
        }
        let host = Self::new(device, upstream, true);
        let hello = match payload::encode(&host.device.info()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode device info: {e}");
                Vec::new()
            }
        };
        host.send_msg(Message::request(0, RoutePath::local(), METHOD_DEVICE_INFO, hello));
        debug!(device_id = host.device.device_id(), "announced to remote bus");
        Ok(host)
    }

    fn new(device: Arc<Device>, upstream: Arc<dyn Transport>, awaiting_address: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            device,
            decoder: Mutex::new(Decoder::new()),
            upstream,
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
            awaiting_address: AtomicBool::new(awaiting_address),
            this: this.clone(),
        })
    }

    fn weak_port(&self) -> Weak<dyn BusPort> {
        self.this.clone() as Weak<dyn BusPort>
    }

    /// `true` when the device is attached to this port and not another one.
    fn owns_device(&self) -> bool {
        let this = self as *const Self as *const ();
        self.device
            .port()
            .map_or(false, |port| Arc::as_ptr(&port) as *const () == this)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// `false` while an announced device still waits for its address.
    pub fn is_attached(&self) -> bool {
        !self.awaiting_address.load(Ordering::Acquire) && self.owns_device()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of handler tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Ends the session: aborts running handlers and detaches the root device.
    ///
    /// Closing twice is harmless.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.awaiting_address.store(false, Ordering::Release);
        let mut tasks = self.tasks();
        if !tasks.is_empty() {
            debug!(aborted = tasks.len(), "aborting in-flight handlers");
        }
        tasks.abort_all();
        drop(tasks);

        if self.owns_device() {
            self.device.detach();
        }
        self.decoder().reset();
        debug!(device_id = self.device.device_id(), "host port closed");
    }

    /// Feeds bytes received from upstream.
    ///
    /// Every message of the chunk is decoded before any of them is dispatched.
    /// A request that cannot be dispatched is answered with an error reply
    /// carrying its id.
    pub fn receive(&self, chunk: &[u8]) {
        if self.is_closed() {
            trace!(bytes = chunk.len(), "host port closed; input ignored");
            return;
        }
        let events = self.decoder().decode(chunk);

        for event in events {
            match event {
                Ok(DecodeEvent::Message(msg)) => {
                    if self.awaiting_address.load(Ordering::Acquire) {
                        self.accept_address(msg);
                    } else {
                        self.dispatch(msg);
                    }
                }
                Ok(other) => trace!(?other, "decoder progress"),
                // No message id to reply to; the decoder already logged it.
                Err(_) => {}
            }
        }
    }

    fn dispatch(&self, msg: Message) {
        let msg_id = msg.msg_id;
        match self.device.dispatch_msg(msg) {
            Ok(Some(task)) => self.spawn(task),
            Ok(None) => {}
            Err(e) => {
                debug!(msg_id, "dispatch failed: {e}");
                self.send_msg(Message::error_reply(msg_id, &e.to_descriptor()));
            }
        }
    }

    /// Handles the remote bus's answer to `announce`.
    fn accept_address(&self, msg: Message) {
        if msg.msg_id != 0 || msg.body.is_error() {
            warn!(msg_id = msg.msg_id, "remote bus refused the device");
            self.close();
            return;
        }
        let assigned: DeviceInfo = match payload::decode(&msg.body.payload) {
            Ok(info) => info,
            Err(e) => {
                warn!("malformed address assignment: {e}");
                self.close();
                return;
            }
        };
        match self.device.attach(assigned.address, self.weak_port()) {
            Ok(()) => {
                self.awaiting_address.store(false, Ordering::Release);
                info!(
                    address = assigned.address,
                    device_id = self.device.device_id(),
                    "attached to remote bus"
                );
            }
            Err(e) => {
                warn!("cannot attach to remote bus: {e}");
                self.close();
            }
        }
    }

    fn spawn(&self, task: HandlerTask) {
        let mut tasks = self.tasks();
        // Reap finished handlers so the set only holds running ones.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn decoder(&self) -> MutexGuard<'_, Decoder> {
        self.decoder.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BusPort for HostPort {
    /// Encodes `msg` and writes it upstream on a spawned task.
    fn send_msg(&self, msg: Message) {
        if self.is_closed() {
            debug!(msg_id = msg.msg_id, "host port closed; reply dropped");
            return;
        }
        let bytes = match encode_message(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(msg_id = msg.msg_id, "failed to encode reply: {e}");
                return;
            }
        };
        let upstream = Arc::clone(&self.upstream);
        let msg_id = msg.msg_id;
        tokio::spawn(async move {
            if let Err(e) = upstream.write(bytes).await {
                warn!(msg_id, "failed to send reply: {e}");
            }
        });
    }
}

/// Lets a master in the same process write straight into the port.
#[async_trait]
impl Transport for HostPort {
    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.receive(&bytes);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
