//! Node types stored in the per-bus arenas.
//!
//! Targets, devices, peripherals and command blocks all live in slotted
//! arenas inside one bus's state; the structs here are the slot contents.
//! Reference counts sit beside each node. A node is destroyed only when its
//! count reaches zero and, for targets, its child list is empty; the
//! cascade itself lives in `topology::Topology` so that trace recording and
//! parent-generation bumps happen in one place.
//!
//! A device sits on up to two bus-level ready queues (allocation and
//! dispatch) and owns two ready queues of its own: waiting peripherals and
//! queued command blocks. Each queue membership is tracked by a dedicated
//! seat field through a distinct [`ReadySlot`] tag.

use std::sync::Arc;

use crate::boundary::PeriphOps;
use crate::cmd::{BlockSeat, CommandBlock};
use crate::notify::Subscription;
use crate::queue::credit::CreditPool;
use crate::queue::freeze::FreezeLevels;
use crate::queue::Deferred;
use crate::stdx::arena::Handle;
use crate::stdx::ready_queue::{ReadyQueue, ReadySlot, UNQUEUED};
use crate::topology::path::{BusId, DeviceIdent, LunId, PathSpec, TargetId};

/// Seat tag for the bus allocation ready-queue (devices waiting for a
/// command block).
pub(crate) enum AllocSeat {}

/// Seat tag for the bus dispatch ready-queue (devices with blocks ready to
/// send).
pub(crate) enum DispatchSeat {}

/// Seat tag for a device's queue of peripherals waiting for an allocation.
pub(crate) enum PeriphSeat {}

/// An addressable endpoint on a bus. Holds one reference on its bus for as
/// long as it exists; each child device holds one reference on it.
pub(crate) struct Target {
    pub(crate) id: TargetId,
    pub(crate) refcount: u32,
    /// Children sorted by lun id.
    pub(crate) devices: Vec<(LunId, Handle<Device>)>,
    /// Bumped on every insert/remove in `devices`.
    pub(crate) device_list_gen: u64,
}

impl Target {
    pub(crate) fn new(id: TargetId) -> Self {
        Self {
            id,
            refcount: 0,
            devices: Vec::new(),
            device_list_gen: 0,
        }
    }
}

/// A logical unit: the unit of command scheduling.
pub(crate) struct Device {
    /// Concrete bus/target/lun address.
    pub(crate) addr: PathSpec,
    pub(crate) target: Handle<Target>,
    pub(crate) refcount: u32,
    /// `None` while the device is provisional (created by path compilation
    /// but never announced).
    pub(crate) ident: Option<DeviceIdent>,
    /// Seat on the bus allocation ready-queue.
    pub(crate) alloc_seat: u32,
    /// Seat on the bus dispatch ready-queue.
    pub(crate) dispatch_seat: u32,
    /// Peripherals waiting for a command-block grant.
    pub(crate) waiters: ReadyQueue<Periph, PeriphSeat>,
    /// Blocks queued for dispatch, highest priority first.
    pub(crate) pending: ReadyQueue<CommandBlock, BlockSeat>,
    /// Attached peripherals in attach order.
    pub(crate) periphs: Vec<Handle<Periph>>,
    /// Bumped on every attach/detach.
    pub(crate) periph_list_gen: u64,
    pub(crate) subscribers: Vec<Subscription>,
    pub(crate) freeze: FreezeLevels,
    /// Gates command-block grants to this device.
    pub(crate) alloc_credit: CreditPool,
    /// Gates concurrent dispatches from this device.
    pub(crate) send_credit: CreditPool,
    /// Blocks granted to an owner but not yet queued.
    pub(crate) held: u32,
    /// Blocks at the controller.
    pub(crate) active: u32,
    /// Armed deferred freeze release, if any.
    pub(crate) deferred: Option<Deferred>,
    /// Invalidates stale timer entries; bumped on every re-arm and cancel.
    pub(crate) deferred_epoch: u64,
    pub(crate) reset_count: u64,
}

impl Device {
    pub(crate) fn new(addr: PathSpec, target: Handle<Target>, openings: u32) -> Self {
        Self {
            addr,
            target,
            refcount: 0,
            ident: None,
            alloc_seat: UNQUEUED,
            dispatch_seat: UNQUEUED,
            waiters: ReadyQueue::new(),
            pending: ReadyQueue::new(),
            periphs: Vec::new(),
            periph_list_gen: 0,
            subscribers: Vec::new(),
            freeze: FreezeLevels::new(),
            alloc_credit: CreditPool::new(openings),
            send_credit: CreditPool::new(openings),
            held: 0,
            active: 0,
            deferred: None,
            deferred_epoch: 0,
            reset_count: 0,
        }
    }

    /// True when a freeze at or above the priority's run level gates work.
    pub(crate) fn frozen_for(&self, priority: u32) -> bool {
        use crate::queue::freeze::RunLevel;
        self.freeze.frozen_through(RunLevel::of_priority(priority)) > 0
    }

    /// Destruction precondition. The reference protocol makes a violation
    /// unreachable through the public API: blocks, waiting peripherals and
    /// subscriptions all hold device references.
    pub(crate) fn assert_destroyable(&self) {
        assert!(
            self.waiters.is_empty(),
            "device {} destroyed with waiting peripherals",
            self.addr
        );
        assert!(
            self.pending.is_empty(),
            "device {} destroyed with queued blocks",
            self.addr
        );
        assert!(
            self.held == 0 && self.active == 0,
            "device {} destroyed with blocks outstanding (held {}, active {})",
            self.addr,
            self.held,
            self.active
        );
        assert!(
            self.periphs.is_empty(),
            "device {} destroyed with peripherals attached",
            self.addr
        );
        assert!(
            self.subscribers.is_empty(),
            "device {} destroyed with subscribers attached",
            self.addr
        );
        assert!(
            self.alloc_seat == UNQUEUED && self.dispatch_seat == UNQUEUED,
            "device {} destroyed while seated",
            self.addr
        );
    }
}

impl ReadySlot<AllocSeat> for Device {
    fn seat(&self) -> u32 {
        self.alloc_seat
    }
    fn set_seat(&mut self, seat: u32) {
        self.alloc_seat = seat;
    }
}

impl ReadySlot<DispatchSeat> for Device {
    fn seat(&self) -> u32 {
        self.dispatch_seat
    }
    fn set_seat(&mut self, seat: u32) {
        self.dispatch_seat = seat;
    }
}

/// A named, numbered consumer bound to one device. Holds one device
/// reference for its lifetime.
pub(crate) struct Periph {
    pub(crate) name: String,
    pub(crate) unit: u32,
    pub(crate) device: Handle<Device>,
    pub(crate) ops: Arc<dyn PeriphOps>,
    /// Seat in the owning device's waiter queue.
    pub(crate) seat: u32,
}

impl Periph {
    pub(crate) fn new(
        name: &str,
        unit: u32,
        device: Handle<Device>,
        ops: Arc<dyn PeriphOps>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            unit,
            device,
            ops,
            seat: UNQUEUED,
        }
    }
}

impl ReadySlot<PeriphSeat> for Periph {
    fn seat(&self) -> u32 {
        self.seat
    }
    fn set_seat(&mut self, seat: u32) {
        self.seat = seat;
    }
}

/// Caller-side name for an attached peripheral.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeriphRef {
    pub bus: BusId,
    pub(crate) periph: Handle<Periph>,
}

impl PeriphRef {
    pub(crate) fn new(bus: BusId, periph: Handle<Periph>) -> Self {
        Self { bus, periph }
    }
}
