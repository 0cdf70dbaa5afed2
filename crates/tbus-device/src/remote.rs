//! Stand-ins for devices that live in another process.
//!
//! A device elsewhere connects to this process and announces itself with its
//! `DeviceInfo` (see [`HostPort::announce`](crate::host::HostPort::announce)).
//! A [`RemoteDevice`] plugs a stand-in for it into a local bus, answers with
//! the assigned address, and from then on forwards every message addressed
//! to the stand-in over the connection.
//!
//! ```text
//!  master ──► bus ──► stand-in ══ connection ══► HostPort ──► real device
//!                       ▲                                        │
//!                       └─────────── answer, original id ◄───────┘
//! ```
//!
//! # Message ids
//!
//! Forwarded requests are renumbered with the stand-in's own
//! [`IdAllocator`], and the answer gets the original id back.  Id 0 stays
//! reserved for the announcement.  A request still waiting when the
//! connection goes away is answered with a routing error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures_util::future::FutureExt;
use tbus_core::{
    encode_message, payload, DecodeEvent, Decoder, DeviceInfo, ErrorDescriptor, IdAllocator,
    Message, RoutePath, Transport, TransportError,
};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::bus::Bus;
use crate::device::{BusPort, Device, DeviceBuilder, DeviceLogic, HandlerTask, MsgRouter};
use crate::error::DispatchError;

/// A request sent to the remote device and not answered yet.
struct Forwarded {
    msg_id: u32,
    answer: oneshot::Sender<Message>,
}

enum Phase {
    /// Waiting for the remote device's `DeviceInfo`.
    Announcing,
    Plugged(Weak<Device>),
    Closed,
}

struct RemoteState {
    phase: Phase,
    ids: IdAllocator,
    pending: HashMap<u32, Forwarded>,
    decoder: Decoder,
}

/// The bus-side end of a connection from a remote device.
pub struct RemoteDevice {
    bus: Arc<Bus>,
    link: Arc<dyn Transport>,
    state: Mutex<RemoteState>,
    this: Weak<RemoteDevice>,
}

impl RemoteDevice {
    /// Waits on `link` for a device to announce itself, then plugs it into `bus`.
    pub fn new(bus: Arc<Bus>, link: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            bus,
            link,
            state: Mutex::new(RemoteState {
                phase: Phase::Announcing,
                ids: IdAllocator::new(),
                pending: HashMap::new(),
                decoder: Decoder::new(),
            }),
            this: this.clone(),
        })
    }

    /// The stand-in, once the remote device has been plugged.
    pub fn device(&self) -> Option<Arc<Device>> {
        match &self.state().phase {
            Phase::Plugged(device) => device.upgrade(),
            Phase::Announcing | Phase::Closed => None,
        }
    }

    /// Requests forwarded and not answered yet.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Feeds bytes received from the remote device.
    pub fn receive(&self, chunk: &[u8]) {
        let events = self.state().decoder.decode(chunk);
        for event in events {
            match event {
                Ok(DecodeEvent::Message(msg)) => self.on_message(msg),
                Ok(other) => trace!(?other, "decoder progress"),
                Err(_) => {}
            }
        }
    }

    /// Unplugs the stand-in and fails every request still waiting.
    pub fn close(&self) {
        let (phase, pending) = {
            let mut state = self.state();
            let phase = std::mem::replace(&mut state.phase, Phase::Closed);
            let pending: Vec<Forwarded> = state.pending.drain().map(|(_, f)| f).collect();
            state.ids = IdAllocator::new();
            state.decoder.reset();
            (phase, pending)
        };
        // Dropping the senders wakes the waiting tasks with an error.
        drop(pending);

        if let Phase::Plugged(device) = phase {
            if let Some(device) = device.upgrade() {
                match self.bus.unplug(&device) {
                    Ok(()) => info!(device_id = device.device_id(), "remote device unplugged"),
                    Err(e) => warn!("cannot unplug remote device: {e}"),
                }
            }
        }
    }

    fn on_message(&self, msg: Message) {
        let announcing = matches!(self.state().phase, Phase::Announcing);
        if announcing {
            self.plug(msg);
        } else {
            self.answer(msg);
        }
    }

    /// Handles the announcement: plugs the stand-in and tells the device its address.
    fn plug(&self, msg: Message) {
        let info: DeviceInfo = match payload::decode(&msg.body.payload) {
            Ok(info) if msg.msg_id == 0 => info,
            Ok(_) => {
                warn!(msg_id = msg.msg_id, "remote device did not announce itself");
                return self.close();
            }
            Err(e) => {
                warn!("malformed remote device announcement: {e}");
                return self.close();
            }
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let device = DeviceBuilder::new(info.class_id, info.device_id)
            .labels(info.labels)
            .build(this);
        match self.bus.plug(&device) {
            Ok(address) => {
                info!(
                    address,
                    class_id = device.class_id(),
                    device_id = device.device_id(),
                    "remote device plugged"
                );
                self.send(Message::reply(0, payload::encode(&device.info()).unwrap_or_default()));
            }
            Err(e) => {
                warn!("cannot plug remote device: {e}");
                self.send(Message::error_reply(0, &ErrorDescriptor::routing(e.to_string())));
                self.close();
            }
        }
    }

    /// Hands an answer from the remote device to the task waiting for it.
    fn answer(&self, mut msg: Message) {
        let forwarded = {
            let mut state = self.state();
            let forwarded = state.pending.remove(&msg.msg_id);
            if forwarded.is_some() {
                state.ids.release(msg.msg_id);
            }
            forwarded
        };
        let Some(forwarded) = forwarded else {
            debug!(msg_id = msg.msg_id, "answer for unknown id dropped");
            return;
        };
        msg.msg_id = forwarded.msg_id;
        msg.route = RoutePath::local();
        if forwarded.answer.send(msg).is_err() {
            debug!("answer arrived after its session ended");
        }
    }

    fn forget(&self, id: u32) {
        let mut state = self.state();
        state.pending.remove(&id);
        state.ids.release(id);
    }

    fn send(&self, msg: Message) {
        let bytes = match encode_message(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(msg_id = msg.msg_id, "failed to encode message for remote device: {e}");
                return;
            }
        };
        let link = Arc::clone(&self.link);
        tokio::spawn(async move {
            if let Err(e) = link.write(bytes).await {
                warn!("write to remote device failed: {e}");
            }
        });
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn disconnected() -> ErrorDescriptor {
    ErrorDescriptor::routing("remote device disconnected")
}

impl DeviceLogic for RemoteDevice {
    fn set_device(&self, device: Weak<Device>) {
        let mut state = self.state();
        if matches!(state.phase, Phase::Announcing) {
            state.phase = Phase::Plugged(device);
        }
    }

    fn proxy(self: Arc<Self>) -> Option<Arc<dyn MsgRouter>> {
        Some(self as Arc<dyn MsgRouter>)
    }
}

impl MsgRouter for RemoteDevice {
    /// Forwards `msg` to the remote device and returns the task awaiting its answer.
    fn route_msg(&self, msg: Message) -> Result<Option<HandlerTask>, DispatchError> {
        let port: Arc<dyn BusPort> = self
            .device()
            .and_then(|device| device.port())
            .ok_or(DispatchError::NotAttached)?;

        let (tx, rx) = oneshot::channel();
        let original = msg.msg_id;
        let id = {
            let mut state = self.state();
            let id = state.ids.alloc();
            state.pending.insert(
                id,
                Forwarded {
                    msg_id: original,
                    answer: tx,
                },
            );
            id
        };
        let bytes = encode_message(&Message { msg_id: id, ..msg }).map_err(|e| {
            self.forget(id);
            DispatchError::Forward(e)
        })?;
        debug!(msg_id = original, forwarded_as = id, "forwarding to remote device");

        let link = Arc::clone(&self.link);
        let remote = self.this.clone();
        let task = async move {
            if let Err(e) = link.write(bytes).await {
                warn!(msg_id = original, "write to remote device failed: {e}");
                if let Some(remote) = remote.upgrade() {
                    remote.forget(id);
                }
                port.send_msg(Message::error_reply(original, &disconnected()));
                return;
            }
            let answer = rx
                .await
                .unwrap_or_else(|_| Message::error_reply(original, &disconnected()));
            port.send_msg(answer);
        };
        Ok(Some(task.boxed()))
    }
}

/// Lets a device port in the same process write straight into the stand-in.
#[async_trait]
impl Transport for RemoteDevice {
    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if matches!(self.state().phase, Phase::Closed) {
            return Err(TransportError::Closed);
        }
        self.receive(&bytes);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
