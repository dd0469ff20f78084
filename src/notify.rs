//! Async notification bus.
//!
//! Subscriptions attach either to one concrete device (holding a device
//! reference for the subscription's lifetime) or to the topology-wide
//! wildcard list. Publishing walks every device the event's address covers,
//! runs the default handler under the bus lock, then invokes matching
//! subscribers with no engine locks held — so a subscriber may call back
//! into the topology, including to unsubscribe itself. Wildcard subscribers
//! are invoked once per publish, not once per matched device.
//!
//! Subscribing with newly added `FoundDevice` or `PathRegistered` bits
//! replays the current topology (configured devices, live buses) to the new
//! subscriber only, outside locks.

use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::boundary::AsyncSubscriber;
use crate::errors::XptError;
use crate::topology::{BusId, DeviceIdent, Path, PathSpec, TargetId, Topology};
use crate::trace::TraceEvent;

/// Bitmask of event kinds a subscription wants. Bits mirror the
/// [`AsyncEvent`] variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const PATH_REGISTERED: EventMask = EventMask(1 << 0);
    pub const PATH_DEREGISTERED: EventMask = EventMask(1 << 1);
    pub const BUS_RESET: EventMask = EventMask(1 << 2);
    pub const TARGET_RESET: EventMask = EventMask(1 << 3);
    pub const FOUND_DEVICE: EventMask = EventMask(1 << 4);
    pub const LOST_DEVICE: EventMask = EventMask(1 << 5);
    pub const IDENT_CHANGED: EventMask = EventMask(1 << 6);
    pub const ALL: EventMask = EventMask(0x7f);

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bits in `self` that are not in `other`.
    pub fn added_over(self, other: EventMask) -> EventMask {
        EventMask(self.0 & !other.0)
    }
}

impl BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

/// A topology change notification.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum AsyncEvent {
    /// A bus came up.
    PathRegistered { bus: BusId },
    /// A bus went away.
    PathDeregistered { bus: BusId },
    BusReset { bus: BusId },
    TargetReset { bus: BusId, target: TargetId },
    /// A device was announced (configured) with an identity.
    FoundDevice { addr: PathSpec, ident: DeviceIdent },
    /// The addressed devices went provisional.
    LostDevice { addr: PathSpec },
    IdentChanged { addr: PathSpec, ident: DeviceIdent },
}

impl AsyncEvent {
    pub fn mask_bit(&self) -> EventMask {
        match self {
            AsyncEvent::PathRegistered { .. } => EventMask::PATH_REGISTERED,
            AsyncEvent::PathDeregistered { .. } => EventMask::PATH_DEREGISTERED,
            AsyncEvent::BusReset { .. } => EventMask::BUS_RESET,
            AsyncEvent::TargetReset { .. } => EventMask::TARGET_RESET,
            AsyncEvent::FoundDevice { .. } => EventMask::FOUND_DEVICE,
            AsyncEvent::LostDevice { .. } => EventMask::LOST_DEVICE,
            AsyncEvent::IdentChanged { .. } => EventMask::IDENT_CHANGED,
        }
    }

    /// The address range of devices this event covers.
    pub fn scope(&self) -> PathSpec {
        match self {
            AsyncEvent::PathRegistered { bus }
            | AsyncEvent::PathDeregistered { bus }
            | AsyncEvent::BusReset { bus } => PathSpec::bus_wide(*bus),
            AsyncEvent::TargetReset { bus, target } => {
                PathSpec::new(*bus, *target, crate::topology::LunId::WILDCARD)
            }
            AsyncEvent::FoundDevice { addr, .. }
            | AsyncEvent::LostDevice { addr }
            | AsyncEvent::IdentChanged { addr, .. } => *addr,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AsyncEvent::PathRegistered { .. } => "path-registered",
            AsyncEvent::PathDeregistered { .. } => "path-deregistered",
            AsyncEvent::BusReset { .. } => "bus-reset",
            AsyncEvent::TargetReset { .. } => "target-reset",
            AsyncEvent::FoundDevice { .. } => "found-device",
            AsyncEvent::LostDevice { .. } => "lost-device",
            AsyncEvent::IdentChanged { .. } => "ident-changed",
        }
    }
}

/// One attached callback with its mask. Identity is `Arc` pointer identity.
pub(crate) struct Subscription {
    pub(crate) mask: EventMask,
    pub(crate) subscriber: Arc<dyn AsyncSubscriber>,
}

impl Topology {
    /// Attach (or update) a subscription. A path pinning a device attaches
    /// to that device and holds one device reference; a fully wild path
    /// attaches to the topology-wide wildcard list. Re-subscribing the same
    /// `Arc` replaces its mask; an empty mask removes the subscription.
    ///
    /// Newly added `FoundDevice` bits replay every configured device, in
    /// topology order, to this subscriber only; newly added
    /// `PathRegistered` bits replay every live bus.
    pub fn subscribe(
        &self,
        path: &Path,
        mask: EventMask,
        subscriber: Arc<dyn AsyncSubscriber>,
    ) -> Result<(), XptError> {
        let added = if path.spec().is_fully_wild() {
            let mut list = self.wildcard_lock();
            update_subscription(&mut list, mask, &subscriber)
        } else {
            let dh = path.device.ok_or(XptError::PathInvalid { spec: path.spec() })?;
            let bus = self.bus(path.bus_id())?;
            let drops;
            let added;
            {
                let mut core = bus.lock();
                let had = {
                    let dev = core.devices.get_mut(dh).ok_or(XptError::StaleHandle {
                        what: "path device",
                    })?;
                    let had = dev
                        .subscribers
                        .iter()
                        .any(|s| Arc::ptr_eq(&s.subscriber, &subscriber));
                    added = update_subscription(&mut dev.subscribers, mask, &subscriber);
                    had
                };
                // Reference bookkeeping: a new entry takes a device
                // reference, a removed entry gives one back.
                drops = match (had, mask.is_empty()) {
                    (false, false) => {
                        let dev = core.devices.get_mut(dh).unwrap_or_else(|| unreachable!());
                        dev.refcount += 1;
                        0
                    }
                    (true, true) => self.drop_device_ref(&mut core, dh),
                    _ => 0,
                };
            }
            self.release_bus_refs(&bus, drops);
            added
        };
        self.replay(added, &subscriber);
        Ok(())
    }

    /// Remove a subscription; shorthand for subscribing with an empty mask.
    pub fn unsubscribe(
        &self,
        path: &Path,
        subscriber: Arc<dyn AsyncSubscriber>,
    ) -> Result<(), XptError> {
        self.subscribe(path, EventMask::NONE, subscriber)
    }

    /// Broadcast an event. Walks every device the event's scope covers,
    /// runs the default handler (identity and reset bookkeeping) under the
    /// bus lock, then invokes matching device subscribers and finally each
    /// wildcard subscriber once, all with no locks held.
    pub fn publish(&self, event: AsyncEvent) {
        self.trace.record(TraceEvent::Published {
            event: event.label().to_owned(),
        });
        let scope = event.scope();
        let bit = event.mask_bit();
        for bus in self.buses_snapshot() {
            if !scope.bus.is_wildcard() && scope.bus != bus.id {
                continue;
            }
            let mut to_call: Vec<Arc<dyn AsyncSubscriber>> = Vec::new();
            let mut held: Vec<crate::stdx::arena::Handle<crate::topology::nodes::Device>> =
                Vec::new();
            {
                let mut core = bus.lock();
                if matches!(event, AsyncEvent::BusReset { .. }) {
                    core.reset_count += 1;
                }
                let device_handles: Vec<_> = {
                    let core = &*core;
                    core.target_list
                        .iter()
                        .filter(|(tid, _)| scope.target.is_wildcard() || scope.target == *tid)
                        .filter_map(|(_, th)| core.targets.get(*th))
                        .flat_map(|t| {
                            t.devices
                                .iter()
                                .filter(|(lun, _)| scope.lun.is_wildcard() || scope.lun == *lun)
                                .map(|(_, dh)| *dh)
                        })
                        .collect()
                };
                for dh in device_handles {
                    let dev = core.devices.get_mut(dh).unwrap_or_else(|| unreachable!());
                    match &event {
                        AsyncEvent::LostDevice { .. } => dev.ident = None,
                        AsyncEvent::BusReset { .. } | AsyncEvent::TargetReset { .. } => {
                            dev.reset_count += 1;
                        }
                        _ => {}
                    }
                    let before = to_call.len();
                    for sub in &dev.subscribers {
                        if sub.mask.contains(bit) {
                            to_call.push(sub.subscriber.clone());
                        }
                    }
                    if to_call.len() > before {
                        // Hold the device across the callbacks below.
                        dev.refcount += 1;
                        held.push(dh);
                    }
                }
            }
            for subscriber in &to_call {
                subscriber.on_event(&event);
            }
            let mut drops = 0;
            {
                let mut core = bus.lock();
                for dh in held {
                    drops += self.drop_device_ref(&mut core, dh);
                }
            }
            self.release_bus_refs(&bus, drops);
        }
        let wildcard: Vec<Arc<dyn AsyncSubscriber>> = self
            .wildcard_lock()
            .iter()
            .filter(|s| s.mask.contains(bit))
            .map(|s| s.subscriber.clone())
            .collect();
        for subscriber in wildcard {
            subscriber.on_event(&event);
        }
    }

    /// Replay current topology state for newly added mask bits, to one
    /// subscriber, outside locks.
    fn replay(&self, added: EventMask, subscriber: &Arc<dyn AsyncSubscriber>) {
        if added.is_empty() {
            return;
        }
        let mut events: Vec<AsyncEvent> = Vec::new();
        if added.contains(EventMask::PATH_REGISTERED) {
            for bus in self.buses_snapshot() {
                events.push(AsyncEvent::PathRegistered { bus: bus.id });
            }
        }
        if added.contains(EventMask::FOUND_DEVICE) {
            for bus in self.buses_snapshot() {
                let core = bus.lock();
                for (_, th) in &core.target_list {
                    let Some(t) = core.targets.get(*th) else { continue };
                    for (_, dh) in &t.devices {
                        let Some(dev) = core.devices.get(*dh) else { continue };
                        if let Some(ident) = &dev.ident {
                            events.push(AsyncEvent::FoundDevice {
                                addr: dev.addr,
                                ident: ident.clone(),
                            });
                        }
                    }
                }
            }
        }
        for event in &events {
            subscriber.on_event(event);
        }
    }
}

/// Insert, update, or remove a subscription entry by `Arc` identity.
/// Returns the mask bits newly added relative to the entry's previous mask.
fn update_subscription(
    list: &mut Vec<Subscription>,
    mask: EventMask,
    subscriber: &Arc<dyn AsyncSubscriber>,
) -> EventMask {
    if let Some(pos) = list
        .iter()
        .position(|s| Arc::ptr_eq(&s.subscriber, subscriber))
    {
        let old = list[pos].mask;
        if mask.is_empty() {
            list.remove(pos);
        } else {
            list[pos].mask = mask;
        }
        mask.added_over(old)
    } else if mask.is_empty() {
        EventMask::NONE
    } else {
        list.push(Subscription {
            mask,
            subscriber: subscriber.clone(),
        });
        mask
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::TopologyConfig;
    use crate::test_utils::StaticSim;
    use crate::topology::LunId;

    struct Recorder {
        events: Mutex<Vec<AsyncEvent>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<AsyncEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl AsyncSubscriber for Recorder {
        fn on_event(&self, event: &AsyncEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn open() -> Arc<Topology> {
        Topology::open(TopologyConfig::default())
    }

    fn sim() -> Arc<StaticSim> {
        Arc::new(StaticSim::new("vbus", 4))
    }

    #[test]
    fn mask_bits_compose() {
        let mask = EventMask::FOUND_DEVICE | EventMask::LOST_DEVICE;
        assert!(mask.contains(EventMask::FOUND_DEVICE));
        assert!(!mask.contains(EventMask::BUS_RESET));
        assert!(EventMask::ALL.contains(mask));
        assert_eq!(
            mask.added_over(EventMask::FOUND_DEVICE),
            EventMask::LOST_DEVICE
        );
    }

    #[test]
    fn device_subscriber_sees_matching_events_only() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let path = xpt
            .compile_path(PathSpec::new(bus, TargetId(0), LunId(0)))
            .unwrap();
        let rec = Recorder::new();
        xpt.subscribe(&path, EventMask::IDENT_CHANGED, rec.clone())
            .unwrap();

        let ident = DeviceIdent::new("A", "B", "1");
        xpt.announce_device(&path, ident.clone()).unwrap();
        // First announce publishes FoundDevice, which the mask excludes.
        assert!(rec.events().is_empty());

        let ident2 = DeviceIdent::new("A", "B", "2");
        xpt.announce_device(&path, ident2.clone()).unwrap();
        assert_eq!(
            rec.events(),
            vec![AsyncEvent::IdentChanged {
                addr: path.spec(),
                ident: ident2
            }]
        );
        xpt.unsubscribe(&path, rec).unwrap();
        xpt.release_path(path);
        xpt.close().unwrap();
    }

    #[test]
    fn wildcard_subscriber_fires_once_per_publish() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let a = xpt
            .compile_path(PathSpec::new(bus, TargetId(0), LunId(0)))
            .unwrap();
        let b = xpt
            .compile_path(PathSpec::new(bus, TargetId(1), LunId(0)))
            .unwrap();
        xpt.announce_device(&a, DeviceIdent::new("x", "a", "1")).unwrap();
        xpt.announce_device(&b, DeviceIdent::new("x", "b", "1")).unwrap();

        let rec = Recorder::new();
        let wild = xpt.compile_path(PathSpec::wildcard()).unwrap();
        xpt.subscribe(&wild, EventMask::LOST_DEVICE, rec.clone())
            .unwrap();

        // Bus-wide loss touches both devices but notifies once.
        xpt.publish(AsyncEvent::LostDevice {
            addr: PathSpec::bus_wide(bus),
        });
        assert_eq!(rec.events().len(), 1);
        assert!(xpt.device_stats(&a).unwrap().provisional);
        assert!(xpt.device_stats(&b).unwrap().provisional);

        xpt.unsubscribe(&wild, rec).unwrap();
        xpt.release_path(wild);
        xpt.release_path(a);
        xpt.release_path(b);
    }

    #[test]
    fn found_device_bit_replays_configured_devices_in_order() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let configured = xpt
            .compile_path(PathSpec::new(bus, TargetId(0), LunId(1)))
            .unwrap();
        let configured2 = xpt
            .compile_path(PathSpec::new(bus, TargetId(2), LunId(0)))
            .unwrap();
        let provisional = xpt
            .compile_path(PathSpec::new(bus, TargetId(1), LunId(0)))
            .unwrap();
        xpt.announce_device(&configured2, DeviceIdent::new("v", "late", "1"))
            .unwrap();
        xpt.announce_device(&configured, DeviceIdent::new("v", "early", "1"))
            .unwrap();

        let rec = Recorder::new();
        let wild = xpt.compile_path(PathSpec::wildcard()).unwrap();
        xpt.subscribe(&wild, EventMask::FOUND_DEVICE, rec.clone())
            .unwrap();
        // Replay covers configured devices only, in topology order, not
        // announcement order.
        let replayed: Vec<PathSpec> = rec
            .events()
            .iter()
            .map(|e| match e {
                AsyncEvent::FoundDevice { addr, .. } => *addr,
                other => panic!("unexpected replay event {other:?}"),
            })
            .collect();
        assert_eq!(replayed, vec![configured.spec(), configured2.spec()]);

        // Re-subscribing with the same bits does not replay again.
        xpt.subscribe(&wild, EventMask::FOUND_DEVICE, rec.clone())
            .unwrap();
        assert_eq!(rec.events().len(), 2);

        xpt.unsubscribe(&wild, rec).unwrap();
        xpt.release_path(wild);
        xpt.release_path(configured);
        xpt.release_path(configured2);
        xpt.release_path(provisional);
    }

    #[test]
    fn path_registered_bit_replays_live_buses() {
        let xpt = open();
        let b0 = xpt.register_bus(sim()).unwrap();
        let b1 = xpt.register_bus(sim()).unwrap();
        let rec = Recorder::new();
        let wild = xpt.compile_path(PathSpec::wildcard()).unwrap();
        xpt.subscribe(&wild, EventMask::PATH_REGISTERED, rec.clone())
            .unwrap();
        assert_eq!(
            rec.events(),
            vec![
                AsyncEvent::PathRegistered { bus: b0 },
                AsyncEvent::PathRegistered { bus: b1 },
            ]
        );
        xpt.unsubscribe(&wild, rec).unwrap();
        xpt.release_path(wild);
    }

    #[test]
    fn empty_mask_removes_and_releases() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let path = xpt
            .compile_path(PathSpec::new(bus, TargetId(0), LunId(0)))
            .unwrap();
        let rec = Recorder::new();
        xpt.subscribe(&path, EventMask::ALL, rec.clone()).unwrap();
        assert_eq!(xpt.device_stats(&path).unwrap().refcount, 2);
        xpt.subscribe(&path, EventMask::NONE, rec).unwrap();
        assert_eq!(xpt.device_stats(&path).unwrap().refcount, 1);
        xpt.release_path(path);
        xpt.close().unwrap();
    }

    #[test]
    fn bus_reset_updates_reset_bookkeeping() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let path = xpt
            .compile_path(PathSpec::new(bus, TargetId(0), LunId(0)))
            .unwrap();
        xpt.publish(AsyncEvent::BusReset { bus });
        assert_eq!(xpt.bus_stats(bus).unwrap().reset_count, 1);
        assert_eq!(xpt.device_stats(&path).unwrap().reset_count, 1);

        // A reset of a different target leaves this device alone.
        xpt.publish(AsyncEvent::TargetReset {
            bus,
            target: TargetId(7),
        });
        assert_eq!(xpt.device_stats(&path).unwrap().reset_count, 1);
        xpt.publish(AsyncEvent::TargetReset {
            bus,
            target: TargetId(0),
        });
        assert_eq!(xpt.device_stats(&path).unwrap().reset_count, 2);
        xpt.release_path(path);
    }

    #[test]
    fn subscriber_may_unsubscribe_itself_from_callback() {
        struct SelfRemover {
            xpt: Mutex<Option<Arc<Topology>>>,
            this: Mutex<Option<Arc<SelfRemover>>>,
            seen: Mutex<u32>,
        }
        impl AsyncSubscriber for SelfRemover {
            fn on_event(&self, _event: &AsyncEvent) {
                *self.seen.lock().unwrap() += 1;
                let xpt = self.xpt.lock().unwrap().take();
                let this = self.this.lock().unwrap().take();
                if let (Some(xpt), Some(this)) = (xpt, this) {
                    let wild = xpt.compile_path(PathSpec::wildcard()).unwrap();
                    xpt.unsubscribe(&wild, this as Arc<dyn AsyncSubscriber>)
                        .unwrap();
                    xpt.release_path(wild);
                }
            }
        }

        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let sub = Arc::new(SelfRemover {
            xpt: Mutex::new(Some(xpt.clone())),
            this: Mutex::new(None),
            seen: Mutex::new(0),
        });
        *sub.this.lock().unwrap() = Some(sub.clone());
        let wild = xpt.compile_path(PathSpec::wildcard()).unwrap();
        xpt.subscribe(&wild, EventMask::BUS_RESET, sub.clone())
            .unwrap();
        xpt.publish(AsyncEvent::BusReset { bus });
        xpt.publish(AsyncEvent::BusReset { bus });
        assert_eq!(*sub.seen.lock().unwrap(), 1);
        xpt.release_path(wild);
    }
}
