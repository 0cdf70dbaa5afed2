//! Buses: address tables that route messages to the devices plugged into them.
//!
//! # Nesting (for beginners)
//!
//! A [`Bus`] on its own is just a table from address to device.  To make it
//! reachable from a master it is wrapped in a *representative device* with
//! [`Bus::into_device`].  That device has class [`BUS_CLASS_ID`], answers the
//! `Enumerate` method, and forwards routed messages into the bus.  Because
//! the representative is an ordinary [`Device`], it can be plugged into
//! another bus:
//!
//! ```text
//! root bus device (HostPort, address 0)
//!   ├─ 1: LED
//!   └─ 2: bus device ──► child bus
//!                          └─ 1: LED        route = [2, 1]
//! ```
//!
//! Address 0 on every bus means "the bus's own representative device".
//!
//! # Ownership
//!
//! A bus holds its devices strongly and its representative weakly.  Devices
//! point back at their bus through a weak [`BusPort`], so dropping the
//! representative device tears down the whole subtree.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tbus_core::{payload, BusEnumeration, DeviceInfo, Message, BUS_CLASS_ID, BUS_METHOD_ENUMERATE};
use tracing::{debug, error, info};

use crate::device::{
    BusPort, Device, DeviceBuilder, DeviceLogic, HandlerTask, MethodTable, MsgRouter,
};
use crate::error::{BusError, DispatchError, MethodError};

/// Highest address a bus hands out.
pub const MAX_ADDRESS: u8 = u8::MAX;

struct BusState {
    devices: BTreeMap<u8, Arc<Device>>,
    /// Next address to hand out.  Never decreases; addresses are not reused.
    next_address: u16,
}

/// An address table of attached devices.
pub struct Bus {
    state: Mutex<BusState>,
    /// The bus's representative device, once [`Bus::into_device`] has run.
    device: Mutex<Weak<Device>>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BusState {
                devices: BTreeMap::new(),
                next_address: 1,
            }),
            device: Mutex::new(Weak::new()),
        })
    }

    /// Attaches `device` under the next free address and returns it.
    ///
    /// # Errors
    ///
    /// - [`BusError::AddressExhausted`] once 255 addresses have been used.
    /// - [`BusError::AlreadyAttached`] when the device is on a bus already.
    /// - [`BusError::Cycle`] when the device is this bus's representative or
    ///   sits above it in the tree.
    pub fn plug(self: &Arc<Self>, device: &Arc<Device>) -> Result<u8, BusError> {
        let mut ancestor = self.device();
        while let Some(current) = ancestor {
            if Arc::ptr_eq(&current, device) {
                return Err(BusError::Cycle);
            }
            ancestor = current.parent();
        }

        let mut state = self.state();
        if state.next_address > MAX_ADDRESS as u16 {
            return Err(BusError::AddressExhausted);
        }
        let address = state.next_address as u8;

        let port: Weak<dyn BusPort> = Arc::downgrade(self) as Weak<dyn BusPort>;
        device.attach(address, port)?;

        state.devices.insert(address, Arc::clone(device));
        state.next_address += 1;
        info!(
            address,
            class_id = device.class_id(),
            device_id = device.device_id(),
            "device plugged"
        );
        Ok(address)
    }

    /// Detaches `device` and removes it from the table.
    ///
    /// The address is not handed out again.
    pub fn unplug(&self, device: &Arc<Device>) -> Result<(), BusError> {
        let mut state = self.state();
        let address = device.address();
        match state.devices.get(&address) {
            Some(plugged) if Arc::ptr_eq(plugged, device) => {}
            _ => return Err(BusError::NotPlugged),
        }
        state.devices.remove(&address);
        device.detach();
        info!(address, device_id = device.device_id(), "device unplugged");
        Ok(())
    }

    /// Looks up the device at `address`.
    pub fn device_at(&self, address: u8) -> Option<Arc<Device>> {
        self.state().devices.get(&address).cloned()
    }

    /// Addresses currently in use, ascending.
    pub fn addresses(&self) -> BTreeSet<u8> {
        self.state().devices.keys().copied().collect()
    }

    /// Describes every attached device in ascending address order.
    pub fn enumerate(&self) -> Vec<DeviceInfo> {
        self.state().devices.values().map(|d| d.info()).collect()
    }

    /// The representative device, if it is still alive.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.representative().upgrade()
    }

    /// Builds the bus's representative device.
    ///
    /// The device answers `Enumerate` and forwards routed messages into this
    /// bus.  Calling it again replaces the previous representative.
    pub fn into_device(
        self: &Arc<Self>,
        device_id: u32,
        labels: BTreeMap<String, String>,
    ) -> Arc<Device> {
        DeviceBuilder::new(BUS_CLASS_ID, device_id)
            .labels(labels)
            .build(Arc::new(BusLogic {
                bus: Arc::clone(self),
            }))
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn representative(&self) -> MutexGuard<'_, Weak<Device>> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MsgRouter for Bus {
    /// Forwards `msg` to the device named by its first hop, minus that hop.
    fn route_msg(&self, msg: Message) -> Result<Option<HandlerTask>, DispatchError> {
        let Some(address) = msg.route.next_hop() else {
            // Nothing left to route: the message is for the bus itself.
            return self.device().ok_or(DispatchError::NotAttached)?.dispatch_msg(msg);
        };

        let target = if address == 0 {
            self.device().ok_or(DispatchError::NotAttached)?
        } else {
            self.device_at(address)
                .ok_or(DispatchError::InvalidAddress(address))?
        };

        debug!(address, msg_id = msg.msg_id, "routing message");
        target.dispatch_msg(msg.strip_hop())
    }
}

impl BusPort for Bus {
    /// Passes a reply from one of the bus's devices on to the bus's own port.
    fn send_msg(&self, msg: Message) {
        match self.device() {
            Some(device) => device.send_up(msg),
            None => error!(
                msg_id = msg.msg_id,
                "bus has no representative device; reply dropped"
            ),
        }
    }

    fn owner(&self) -> Option<Arc<Device>> {
        self.device()
    }
}

// ── Representative device logic ───────────────────────────────────────────────

struct BusLogic {
    bus: Arc<Bus>,
}

impl DeviceLogic for BusLogic {
    fn set_device(&self, device: Weak<Device>) {
        *self.bus.representative() = device;
    }

    fn methods(self: Arc<Self>, table: &mut MethodTable) {
        let bus = Arc::clone(&self.bus);
        table.register(BUS_METHOD_ENUMERATE, move |_| {
            let enumeration = BusEnumeration {
                devices: bus.enumerate(),
            };
            async move { Ok::<_, MethodError>(payload::encode(&enumeration)?) }
        });
    }

    fn router(self: Arc<Self>) -> Option<Arc<dyn MsgRouter>> {
        Some(Arc::clone(&self.bus) as Arc<dyn MsgRouter>)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(device_id: u32) -> Arc<Device> {
        DeviceBuilder::new(0x10, device_id).build(Arc::new(()))
    }

    #[test]
    fn test_plug_assigns_increasing_addresses_from_one() {
        // Arrange
        let bus = Bus::new();

        // Act
        let a = bus.plug(&leaf(1)).unwrap();
        let b = bus.plug(&leaf(2)).unwrap();

        // Assert
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn test_addresses_are_not_reused_after_unplug() {
        let bus = Bus::new();
        let first = leaf(1);
        bus.plug(&first).unwrap();
        bus.unplug(&first).unwrap();

        let address = bus.plug(&leaf(2)).unwrap();

        assert_eq!(address, 2);
        assert!(!first.is_attached());
    }

    #[test]
    fn test_plug_fails_after_255_addresses() {
        // Arrange – use up every address
        let bus = Bus::new();
        let mut devices = Vec::new();
        for id in 0..255u32 {
            let d = leaf(id);
            bus.plug(&d).unwrap();
            devices.push(d);
        }

        // Act
        let result = bus.plug(&leaf(999));

        // Assert
        assert_eq!(result, Err(BusError::AddressExhausted));
        assert_eq!(devices.last().unwrap().address(), 255);
    }

    #[test]
    fn test_plug_rejects_attached_device_without_using_an_address() {
        let bus = Bus::new();
        let other = Bus::new();
        let d = leaf(1);
        other.plug(&d).unwrap();

        assert_eq!(bus.plug(&d), Err(BusError::AlreadyAttached));
        assert_eq!(bus.plug(&leaf(2)), Ok(1));
    }

    #[test]
    fn test_bus_cannot_be_plugged_into_itself() {
        // Arrange
        let bus = Bus::new();
        let device = bus.into_device(1, BTreeMap::new());

        // Act
        let result = bus.plug(&device);

        // Assert
        assert_eq!(result, Err(BusError::Cycle));
        assert!(!device.is_attached());
        assert_eq!(bus.plug(&leaf(2)), Ok(1), "no address was used");
    }

    #[test]
    fn test_ancestor_cannot_be_plugged_below_itself() {
        // Arrange – outer ├─ 1: inner, then try to put outer under inner
        let outer = Bus::new();
        let outer_device = outer.into_device(1, BTreeMap::new());
        let inner = Bus::new();
        let inner_device = inner.into_device(2, BTreeMap::new());
        outer.plug(&inner_device).unwrap();

        // Act
        let result = inner.plug(&outer_device);

        // Assert
        assert_eq!(result, Err(BusError::Cycle));
        assert_eq!(inner_device.parent().map(|d| d.device_id()), Some(1));
    }

    #[test]
    fn test_unplug_of_foreign_device_fails() {
        let bus = Bus::new();
        let other = Bus::new();
        let d = leaf(1);
        other.plug(&d).unwrap();
        bus.plug(&leaf(2)).unwrap();

        assert_eq!(bus.unplug(&d), Err(BusError::NotPlugged));
        assert!(d.is_attached());
    }

    #[test]
    fn test_enumerate_lists_devices_in_address_order() {
        // Arrange
        let bus = Bus::new();
        let devices: Vec<_> = (10..14).map(leaf).collect();
        for d in &devices {
            bus.plug(d).unwrap();
        }
        bus.unplug(&devices[1]).unwrap();

        // Act
        let infos = bus.enumerate();

        // Assert
        let seen: Vec<(u8, u32)> = infos.iter().map(|i| (i.address, i.device_id)).collect();
        assert_eq!(seen, vec![(1, 10), (3, 12), (4, 13)]);
    }

    #[test]
    fn test_route_to_unknown_address_fails() {
        let bus = Bus::new();
        let msg = Message::request(1, tbus_core::RoutePath::new([9]), 1, Vec::new());

        let Err(err) = bus.route_msg(msg) else {
            panic!("routing to address 9 should fail");
        };

        assert!(matches!(err, DispatchError::InvalidAddress(9)));
        assert_eq!(err.to_string(), "invalid address 9");
    }

    #[test]
    fn test_route_to_address_zero_without_representative_fails() {
        let bus = Bus::new();
        let msg = Message::request(1, tbus_core::RoutePath::new([0]), 1, Vec::new());
        assert!(matches!(bus.route_msg(msg), Err(DispatchError::NotAttached)));
    }

    #[test]
    fn test_into_device_builds_a_routing_bus_device() {
        let bus = Bus::new();
        let device = bus.into_device(77, BTreeMap::new());

        assert_eq!(device.class_id(), BUS_CLASS_ID);
        assert!(device.can_route());
        assert_eq!(
            device.methods().indices().collect::<Vec<_>>(),
            vec![BUS_METHOD_ENUMERATE]
        );
        assert!(Arc::ptr_eq(&bus.device().unwrap(), &device));
    }
}
