//! The topology store: buses, targets, devices, peripherals.
//!
//! One [`Topology`] instance owns everything. The bus directory (a sorted
//! list of registered buses plus its generation counter) sits under a
//! topology-wide lock; everything scoped to one bus — its target/device
//! arenas, ready queues, credit pools — sits under that bus's own lock.
//! Lock order: a bus lock may be taken with nothing held, and the
//! topology-wide locks (directory, high-power gate, timer table) may be
//! taken under a bus lock, never the other way around.
//!
//! Nodes are reference counted. `compile_path` resolves an address into a
//! [`Path`] holding one reference per resolved level, creating missing
//! target/device nodes on demand; `release_path` hands them back and runs
//! the destruction cascade: a node at zero with no children is unlinked
//! from its parent list (bumping that list's generation counter) and drops
//! the reference it held on its parent.
//!
//! The scheduling operations (`schedule`, `submit_io`, freezes, drains,
//! completions) are implemented on `Topology` in [`crate::queue`]; event
//! broadcast in [`crate::notify`]; enumeration in [`crate::query`].

pub(crate) mod nodes;
pub mod path;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::boundary::{PeriphOps, SimInfo, SimPort};
use crate::cmd::CommandBlock;
use crate::config::TopologyConfig;
use crate::errors::XptError;
use crate::notify::AsyncEvent;
use crate::queue::credit::{CreditPool, CreditStats};
use crate::queue::freeze::{FreezeLevels, RUN_LEVELS};
use crate::queue::{HighPowerGate, TimerTable};
use crate::stdx::arena::{Handle, SlotArena};
use crate::stdx::ready_queue::{ReadyQueue, UNQUEUED};
use crate::trace::{TraceEvent, TraceRing};

pub use nodes::PeriphRef;
pub use path::{BusId, DeviceIdent, LunId, Path, PathSpec, TargetId};

use nodes::{AllocSeat, Device, DispatchSeat, Periph, Target};

/// Mutable per-bus state. Everything here is guarded by the owning
/// [`BusState`]'s mutex.
pub(crate) struct BusCore {
    pub(crate) id: BusId,
    pub(crate) refcount: u32,
    /// Set by `deregister_bus`; new path compiles are refused.
    pub(crate) dead: bool,
    pub(crate) targets: SlotArena<Target>,
    /// Children sorted by target id.
    pub(crate) target_list: Vec<(TargetId, Handle<Target>)>,
    /// Bumped on every insert/remove in `target_list`.
    pub(crate) target_list_gen: u64,
    pub(crate) devices: SlotArena<Device>,
    pub(crate) periphs: SlotArena<Periph>,
    pub(crate) blocks: SlotArena<CommandBlock>,
    /// Devices waiting for a command-block grant.
    pub(crate) alloc_queue: ReadyQueue<Device, AllocSeat>,
    /// Devices with blocks ready to send.
    pub(crate) dispatch_queue: ReadyQueue<Device, DispatchSeat>,
    /// Controller-level freeze counts for each queue.
    pub(crate) alloc_freeze: FreezeLevels,
    pub(crate) dispatch_freeze: FreezeLevels,
    /// Command-block pool: one credit per block the controller may hold.
    pub(crate) ctrl_alloc: CreditPool,
    /// Concurrent-dispatch openings for the whole controller.
    pub(crate) ctrl_send: CreditPool,
    pub(crate) alloc_draining: bool,
    pub(crate) alloc_drain_requested: bool,
    pub(crate) dispatch_draining: bool,
    pub(crate) dispatch_drain_requested: bool,
    pub(crate) reset_count: u64,
}

impl BusCore {
    fn new(id: BusId, block_pool: u32, controller_openings: u32) -> Self {
        Self {
            id,
            refcount: 1, // registration reference, dropped by deregister_bus
            dead: false,
            targets: SlotArena::new(),
            target_list: Vec::new(),
            target_list_gen: 0,
            devices: SlotArena::new(),
            periphs: SlotArena::new(),
            blocks: SlotArena::new(),
            alloc_queue: ReadyQueue::new(),
            dispatch_queue: ReadyQueue::new(),
            alloc_freeze: FreezeLevels::new(),
            dispatch_freeze: FreezeLevels::new(),
            ctrl_alloc: CreditPool::new(block_pool),
            ctrl_send: CreditPool::new(controller_openings),
            alloc_draining: false,
            alloc_drain_requested: false,
            dispatch_draining: false,
            dispatch_drain_requested: false,
            reset_count: 0,
        }
    }

    /// Handle of the device at (target, lun), if both nodes exist.
    pub(crate) fn resolve_device(&self, target: TargetId, lun: LunId) -> Option<Handle<Device>> {
        let (_, th) = self
            .target_list
            .iter()
            .find(|(id, _)| *id == target)
            .copied()?;
        let t = self.targets.get(th)?;
        let (_, dh) = t.devices.iter().find(|(id, _)| *id == lun).copied()?;
        Some(dh)
    }
}

/// One registered bus: immutable identity plus the locked core.
pub(crate) struct BusState {
    pub(crate) id: BusId,
    pub(crate) sim: Arc<dyn SimPort>,
    pub(crate) info: SimInfo,
    core: Mutex<BusCore>,
}

impl BusState {
    /// Poisoning is recovered: the core's invariants are maintained by the
    /// engine, not by unwind containment.
    pub(crate) fn lock(&self) -> MutexGuard<'_, BusCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Directory {
    /// Sorted by bus id.
    buses: Vec<Arc<BusState>>,
    generation: u64,
}

/// Topology-wide counters for `topology_stats`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyStats {
    pub buses: u32,
    pub generation: u64,
    pub high_power_in_use: u32,
    pub high_power_parked: u32,
}

/// Per-bus counters for `bus_stats`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub bus: BusId,
    pub refcount: u32,
    pub dead: bool,
    pub targets: u32,
    pub target_list_gen: u64,
    pub ctrl_alloc: CreditStats,
    pub ctrl_send: CreditStats,
    pub alloc_seated: u32,
    pub dispatch_seated: u32,
    pub reset_count: u64,
}

/// Per-device counters for `device_stats`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub addr: PathSpec,
    pub refcount: u32,
    pub provisional: bool,
    pub periphs: u32,
    pub waiters: u32,
    pub queued: u32,
    pub held: u32,
    pub active: u32,
    pub alloc_credit: CreditStats,
    pub send_credit: CreditStats,
    pub freeze: [u32; RUN_LEVELS],
    pub reset_count: u64,
}

/// The engine root. Construct with [`Topology::open`]; every operation in
/// the crate is a method on this type.
pub struct Topology {
    pub(crate) config: TopologyConfig,
    /// Per-address opening overrides, applied at device creation.
    pub(crate) overrides: HashMap<PathSpec, u32, ahash::RandomState>,
    pub(crate) trace: TraceRing,
    directory: Mutex<Directory>,
    pub(crate) wildcard: Mutex<Vec<crate::notify::Subscription>>,
    pub(crate) high_power: Mutex<HighPowerGate>,
    pub(crate) done: crossbeam_queue::SegQueue<(crate::cmd::CmdRef, crate::cmd::CmdStatus)>,
    pub(crate) timers: Mutex<TimerTable>,
}

impl Topology {
    /// Validate the config and bring up an empty topology.
    pub fn open(config: TopologyConfig) -> Arc<Self> {
        config.validate();
        let overrides = config
            .device_opening_overrides
            .iter()
            .copied()
            .collect::<HashMap<_, _, ahash::RandomState>>();
        let high_power = HighPowerGate::new(config.high_power_slots);
        let trace = TraceRing::new(config.trace_capacity);
        Arc::new(Self {
            config,
            overrides,
            trace,
            directory: Mutex::new(Directory {
                buses: Vec::new(),
                generation: 0,
            }),
            wildcard: Mutex::new(Vec::new()),
            high_power: Mutex::new(high_power),
            done: crossbeam_queue::SegQueue::new(),
            timers: Mutex::new(TimerTable::new()),
        })
    }

    /// Tear down: deregister remaining buses, drop wildcard subscriptions,
    /// cancel timers, drain completions. Fails with `InvalidState` when
    /// node references are still held outside (paths, blocks, peripherals
    /// or subscriptions that were never released).
    pub fn close(&self) -> Result<(), XptError> {
        self.drain_completions();
        let ids: Vec<BusId> = self.buses_snapshot().iter().map(|b| b.id).collect();
        for id in ids {
            // Already-dead buses just have their remaining references out.
            let _ = self.deregister_bus(id);
        }
        self.wildcard_lock().clear();
        self.timers_lock().clear();
        self.drain_completions();
        let leaked = self.directory_lock().buses.len();
        if leaked > 0 {
            return Err(XptError::InvalidState {
                what: "close with node references still held",
            });
        }
        Ok(())
    }

    // ==================== Bus lifecycle ====================

    /// Register a controller. Queries its `info`, assigns the lowest unused
    /// path id, and publishes `PathRegistered`. The registration holds one
    /// bus reference until `deregister_bus`.
    pub fn register_bus(&self, sim: Arc<dyn SimPort>) -> Result<BusId, XptError> {
        let info = sim.info();
        let block_pool = if self.config.max_blocks_per_bus > 0 {
            self.config.max_blocks_per_bus
        } else {
            info.controller_openings
        };
        let id;
        {
            let mut dir = self.directory_lock();
            if dir.buses.len() as u32 >= self.config.max_buses {
                return Err(XptError::ResourceUnavailable {
                    what: "bus directory full",
                });
            }
            // Lowest unused id; the list is sorted, so the first index that
            // does not match its bus id is free.
            let mut next = 0u32;
            let mut insert_at = dir.buses.len();
            for (i, bus) in dir.buses.iter().enumerate() {
                if bus.id.0 == next {
                    next += 1;
                } else {
                    insert_at = i;
                    break;
                }
            }
            id = BusId(next);
            let bus = Arc::new(BusState {
                id,
                sim,
                core: Mutex::new(BusCore::new(id, block_pool, info.controller_openings)),
                info: info.clone(),
            });
            dir.buses.insert(insert_at, bus);
            dir.generation += 1;
        }
        self.trace.record(TraceEvent::BusRegistered {
            bus: id,
            sim_name: info.sim_name.clone(),
        });
        self.publish(AsyncEvent::PathRegistered { bus: id });
        Ok(id)
    }

    /// Deregister a bus: every device on it is marked lost, the bus is
    /// marked dead (new path compiles are refused) and the registration
    /// reference is dropped. The directory entry disappears when the last
    /// outside reference goes.
    pub fn deregister_bus(&self, bus: BusId) -> Result<(), XptError> {
        let state = self.bus(bus)?;
        {
            let mut core = state.lock();
            if core.dead {
                return Err(XptError::InvalidState {
                    what: "bus already deregistered",
                });
            }
            core.dead = true;
        }
        self.publish(AsyncEvent::LostDevice {
            addr: PathSpec::bus_wide(bus),
        });
        self.publish(AsyncEvent::PathDeregistered { bus });
        self.trace.record(TraceEvent::BusDeregistered { bus });
        self.release_bus_refs(&state, 1);
        Ok(())
    }

    /// Re-expose the capability report the bus's controller gave at
    /// registration.
    pub fn path_inquiry(&self, bus: BusId) -> Result<SimInfo, XptError> {
        Ok(self.bus(bus)?.info.clone())
    }

    // ==================== Paths ====================

    /// Resolve an address into owned references, creating missing target
    /// and device nodes for exact ids. Wildcard levels resolve to nothing
    /// and never create nodes; a concrete lun under a wildcard target is
    /// invalid, as is any id past the controller's reported maximum.
    pub fn compile_path(&self, spec: PathSpec) -> Result<Path, XptError> {
        if spec.target.is_wildcard() && !spec.lun.is_wildcard() {
            return Err(XptError::PathInvalid { spec });
        }
        if spec.bus.is_wildcard() {
            // Wildcard-bus paths pin nothing; only fully wild below too.
            if !spec.target.is_wildcard() {
                return Err(XptError::PathInvalid { spec });
            }
            return Ok(Path {
                spec,
                target: None,
                device: None,
            });
        }
        let bus = self.bus(spec.bus).map_err(|_| XptError::PathInvalid { spec })?;
        if !spec.target.is_wildcard() && spec.target.0 > bus.info.max_target {
            return Err(XptError::PathInvalid { spec });
        }
        if !spec.lun.is_wildcard() && spec.lun.0 > bus.info.max_lun {
            return Err(XptError::PathInvalid { spec });
        }
        let mut created: Vec<TraceEvent> = Vec::new();
        let path = {
            let mut core = bus.lock();
            if core.dead {
                return Err(XptError::PathInvalid { spec });
            }
            core.refcount += 1; // the path's bus reference
            let mut path = Path {
                spec,
                target: None,
                device: None,
            };
            if !spec.target.is_wildcard() {
                let th = self.find_or_create_target(&mut core, spec.target, &mut created);
                path.target = Some(th);
                if !spec.lun.is_wildcard() {
                    let dh = self.find_or_create_device(
                        &mut core,
                        spec,
                        th,
                        bus.info.device_openings,
                        &mut created,
                    );
                    path.device = Some(dh);
                }
            }
            path
        };
        for event in created {
            self.trace.record(event);
        }
        Ok(path)
    }

    /// Clone a path, acquiring a fresh reference at each resolved level.
    pub fn dup_path(&self, path: &Path) -> Result<Path, XptError> {
        if path.spec.bus.is_wildcard() {
            return Ok(Path {
                spec: path.spec,
                target: None,
                device: None,
            });
        }
        let bus = self.bus(path.spec.bus)?;
        let mut core = bus.lock();
        if let Some(dh) = path.device {
            let dev = core.devices.get_mut(dh).ok_or(XptError::StaleHandle {
                what: "path device",
            })?;
            dev.refcount += 1;
        }
        if let Some(th) = path.target {
            let t = core.targets.get_mut(th).ok_or(XptError::StaleHandle {
                what: "path target",
            })?;
            t.refcount += 1;
        }
        core.refcount += 1;
        Ok(Path {
            spec: path.spec,
            target: path.target,
            device: path.device,
        })
    }

    /// Hand back a compiled path, releasing its references deepest-first.
    pub fn release_path(&self, path: Path) {
        if path.spec.bus.is_wildcard() {
            return;
        }
        let Ok(bus) = self.bus(path.spec.bus) else {
            // The path's bus reference should have kept the bus alive;
            // nothing left to release if it is already gone.
            return;
        };
        let mut drops = 1; // the path's own bus reference
        {
            let mut core = bus.lock();
            if let Some(dh) = path.device {
                drops += self.drop_device_ref(&mut core, dh);
            }
            if let Some(th) = path.target {
                drops += self.drop_target_ref(&mut core, th);
            }
        }
        self.release_bus_refs(&bus, drops);
    }

    // ==================== Device identity ====================

    /// Supply (or update) a device's identity, taking it out of the
    /// provisional state. Publishes `FoundDevice` on first announcement and
    /// `IdentChanged` on updates.
    pub fn announce_device(&self, path: &Path, ident: DeviceIdent) -> Result<(), XptError> {
        let dh = path.device.ok_or(XptError::PathInvalid { spec: path.spec })?;
        let bus = self.bus(path.spec.bus)?;
        let first = {
            let mut core = bus.lock();
            let dev = core.devices.get_mut(dh).ok_or(XptError::StaleHandle {
                what: "path device",
            })?;
            let first = dev.ident.is_none();
            dev.ident = Some(ident.clone());
            first
        };
        let addr = path.spec;
        if first {
            self.publish(AsyncEvent::FoundDevice { addr, ident });
        } else {
            self.publish(AsyncEvent::IdentChanged { addr, ident });
        }
        Ok(())
    }

    /// Return the addressed devices to the provisional state by publishing
    /// `LostDevice`; the default handler clears each matched identity.
    pub fn lose_device(&self, path: &Path) {
        self.publish(AsyncEvent::LostDevice { addr: path.spec });
    }

    /// Identity report for a configured device. A provisional device
    /// answers `DeviceNotThere`.
    pub fn query_device(&self, path: &Path) -> Result<DeviceIdent, XptError> {
        let dh = path.device.ok_or(XptError::PathInvalid { spec: path.spec })?;
        let bus = self.bus(path.spec.bus)?;
        let core = bus.lock();
        let dev = core.devices.get(dh).ok_or(XptError::StaleHandle {
            what: "path device",
        })?;
        dev.ident.clone().ok_or(XptError::DeviceNotThere {
            addr: path.spec,
        })
    }

    // ==================== Peripherals ====================

    /// Bind a peripheral to the device a path resolves. The binding holds
    /// one device reference until `detach_periph`.
    pub fn attach_periph(
        &self,
        path: &Path,
        name: &str,
        unit: u32,
        ops: Arc<dyn PeriphOps>,
    ) -> Result<PeriphRef, XptError> {
        let dh = path.device.ok_or(XptError::PathInvalid { spec: path.spec })?;
        let bus = self.bus(path.spec.bus)?;
        let mut core = bus.lock();
        if !core.devices.contains(dh) {
            return Err(XptError::StaleHandle {
                what: "path device",
            });
        }
        let ph = core.periphs.insert(Periph::new(name, unit, dh, ops));
        let dev = core.devices.get_mut(dh).unwrap_or_else(|| unreachable!());
        dev.refcount += 1;
        dev.periphs.push(ph);
        dev.periph_list_gen += 1;
        self.trace.record(TraceEvent::PeriphAttached {
            addr: dev.addr,
            name: name.to_owned(),
            unit,
        });
        Ok(PeriphRef::new(bus.id, ph))
    }

    /// Unbind a peripheral. A pending allocation request is cancelled; the
    /// peripheral must have released every block it was granted.
    pub fn detach_periph(&self, periph: PeriphRef) -> Result<(), XptError> {
        let bus = self.bus(periph.bus)?;
        let drops;
        {
            let mut core = bus.lock();
            let core = &mut *core;
            let p = core.periphs.get(periph.periph).ok_or(XptError::StaleHandle {
                what: "peripheral",
            })?;
            let dh = p.device;
            let seated = p.seat != UNQUEUED;
            let dev = core.devices.get_mut(dh).unwrap_or_else(|| {
                panic!("peripheral outlived its device")
            });
            if seated {
                dev.waiters.remove(&mut core.periphs, periph.periph);
            }
            let p = core.periphs.remove(periph.periph);
            let dev = core.devices.get_mut(dh).unwrap_or_else(|| unreachable!());
            let pos = dev
                .periphs
                .iter()
                .position(|h| *h == periph.periph)
                .unwrap_or_else(|| panic!("peripheral missing from device list"));
            dev.periphs.remove(pos);
            dev.periph_list_gen += 1;
            self.trace.record(TraceEvent::PeriphDetached {
                addr: dev.addr,
                name: p.name.clone(),
                unit: p.unit,
            });
            // If the cancelled request emptied the waiter queue, the device
            // may be sitting on the allocation queue with nothing to grant.
            if dev.waiters.is_empty() && dev.alloc_seat != UNQUEUED {
                core.alloc_queue.remove(&mut core.devices, dh);
            }
            drops = self.drop_device_ref(core, dh);
        }
        self.release_bus_refs(&bus, drops);
        Ok(())
    }

    // ==================== Stats / introspection ====================

    pub fn topology_stats(&self) -> TopologyStats {
        let dir = self.directory_lock();
        let gate = self.high_power_lock();
        TopologyStats {
            buses: dir.buses.len() as u32,
            generation: dir.generation,
            high_power_in_use: gate.in_use(),
            high_power_parked: gate.parked_len(),
        }
    }

    pub fn bus_stats(&self, bus: BusId) -> Result<BusStats, XptError> {
        let state = self.bus(bus)?;
        let core = state.lock();
        Ok(BusStats {
            bus,
            refcount: core.refcount,
            dead: core.dead,
            targets: core.target_list.len() as u32,
            target_list_gen: core.target_list_gen,
            ctrl_alloc: core.ctrl_alloc.stats(),
            ctrl_send: core.ctrl_send.stats(),
            alloc_seated: core.alloc_queue.len(),
            dispatch_seated: core.dispatch_queue.len(),
            reset_count: core.reset_count,
        })
    }

    pub fn device_stats(&self, path: &Path) -> Result<DeviceStats, XptError> {
        let dh = path.device.ok_or(XptError::PathInvalid { spec: path.spec })?;
        let bus = self.bus(path.spec.bus)?;
        let core = bus.lock();
        let dev = core.devices.get(dh).ok_or(XptError::StaleHandle {
            what: "path device",
        })?;
        Ok(DeviceStats {
            addr: dev.addr,
            refcount: dev.refcount,
            provisional: dev.ident.is_none(),
            periphs: dev.periphs.len() as u32,
            waiters: dev.waiters.len(),
            queued: dev.pending.len(),
            held: dev.held,
            active: dev.active,
            alloc_credit: dev.alloc_credit.stats(),
            send_credit: dev.send_credit.stats(),
            freeze: dev.freeze.counts(),
            reset_count: dev.reset_count,
        })
    }

    /// Drain the trace ring, oldest first.
    pub fn take_trace(&self) -> Vec<TraceEvent> {
        self.trace.take()
    }

    /// Order-sensitive hash of the current trace contents.
    pub fn trace_hash(&self) -> u64 {
        self.trace.fold_hash()
    }

    // ==================== Internal plumbing ====================

    pub(crate) fn bus(&self, id: BusId) -> Result<Arc<BusState>, XptError> {
        self.directory_lock()
            .buses
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(XptError::PathInvalid {
                spec: PathSpec::bus_wide(id),
            })
    }

    pub(crate) fn buses_snapshot(&self) -> Vec<Arc<BusState>> {
        self.directory_lock().buses.clone()
    }

    pub(crate) fn directory_generation(&self) -> u64 {
        self.directory_lock().generation
    }

    fn directory_lock(&self) -> MutexGuard<'_, Directory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wildcard_lock(&self) -> MutexGuard<'_, Vec<crate::notify::Subscription>> {
        self.wildcard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn high_power_lock(&self) -> MutexGuard<'_, HighPowerGate> {
        self.high_power
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn timers_lock(&self) -> MutexGuard<'_, TimerTable> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_or_create_target(
        &self,
        core: &mut BusCore,
        id: TargetId,
        created: &mut Vec<TraceEvent>,
    ) -> Handle<Target> {
        if let Some((_, th)) = core.target_list.iter().find(|(tid, _)| *tid == id) {
            let th = *th;
            let t = core.targets.get_mut(th).unwrap_or_else(|| unreachable!());
            t.refcount += 1;
            return th;
        }
        let mut target = Target::new(id);
        target.refcount = 1; // caller's reference
        let th = core.targets.insert(target);
        core.refcount += 1; // the target's reference on its bus
        let at = core
            .target_list
            .iter()
            .position(|(tid, _)| *tid > id)
            .unwrap_or(core.target_list.len());
        core.target_list.insert(at, (id, th));
        core.target_list_gen += 1;
        created.push(TraceEvent::TargetCreated {
            bus: core.id,
            target: id,
        });
        th
    }

    fn find_or_create_device(
        &self,
        core: &mut BusCore,
        spec: PathSpec,
        th: Handle<Target>,
        sim_default_openings: u32,
        created: &mut Vec<TraceEvent>,
    ) -> Handle<Device> {
        let existing = {
            let t = core.targets.get(th).unwrap_or_else(|| unreachable!());
            t.devices.iter().find(|(lun, _)| *lun == spec.lun).map(|(_, dh)| *dh)
        };
        if let Some(dh) = existing {
            let dev = core.devices.get_mut(dh).unwrap_or_else(|| unreachable!());
            dev.refcount += 1;
            return dh;
        }
        let openings = self.overrides.get(&spec).copied().unwrap_or(
            if self.config.default_device_openings > 0 {
                self.config.default_device_openings
            } else {
                sim_default_openings
            },
        );
        let mut dev = Device::new(spec, th, openings);
        dev.refcount = 1; // caller's reference
        let dh = core.devices.insert(dev);
        let t = core.targets.get_mut(th).unwrap_or_else(|| unreachable!());
        t.refcount += 1; // the device's reference on its target
        let at = t
            .devices
            .iter()
            .position(|(lun, _)| *lun > spec.lun)
            .unwrap_or(t.devices.len());
        t.devices.insert(at, (spec.lun, dh));
        t.device_list_gen += 1;
        created.push(TraceEvent::DeviceCreated { addr: spec });
        dh
    }

    /// Drop one device reference; on zero, destroy the node, unlink it from
    /// its target (bumping the device-list generation) and cascade into the
    /// target reference it held. Returns the number of bus references the
    /// cascade released; the caller applies them through
    /// [`Topology::release_bus_refs`] after dropping the core lock.
    pub(crate) fn drop_device_ref(&self, core: &mut BusCore, dh: Handle<Device>) -> u32 {
        let dev = core
            .devices
            .get_mut(dh)
            .unwrap_or_else(|| panic!("device reference drop on stale handle"));
        assert!(dev.refcount > 0, "device refcount underflow at {}", dev.addr);
        dev.refcount -= 1;
        if dev.refcount > 0 {
            return 0;
        }
        let dev = core.devices.remove(dh);
        dev.assert_destroyable();
        // Cancel any armed deferred release; stale timer entries are
        // skipped by epoch when they fire.
        let th = dev.target;
        let t = core.targets.get_mut(th).unwrap_or_else(|| unreachable!());
        let pos = t
            .devices
            .iter()
            .position(|(_, h)| *h == dh)
            .unwrap_or_else(|| panic!("device missing from target list"));
        t.devices.remove(pos);
        t.device_list_gen += 1;
        self.trace.record(TraceEvent::DeviceDestroyed { addr: dev.addr });
        self.drop_target_ref(core, th)
    }

    /// Drop one target reference; on zero with no devices, destroy the node
    /// and return the bus reference it held (as a count for the caller).
    pub(crate) fn drop_target_ref(&self, core: &mut BusCore, th: Handle<Target>) -> u32 {
        let t = core
            .targets
            .get_mut(th)
            .unwrap_or_else(|| panic!("target reference drop on stale handle"));
        assert!(t.refcount > 0, "target refcount underflow");
        t.refcount -= 1;
        if t.refcount > 0 || !t.devices.is_empty() {
            return 0;
        }
        let t = core.targets.remove(th);
        let pos = core
            .target_list
            .iter()
            .position(|(_, h)| *h == th)
            .unwrap_or_else(|| panic!("target missing from bus list"));
        core.target_list.remove(pos);
        core.target_list_gen += 1;
        self.trace.record(TraceEvent::TargetDestroyed {
            bus: core.id,
            target: t.id,
        });
        1
    }

    /// Drop `count` bus references; at zero with no targets, the bus leaves
    /// the directory and the directory generation is bumped.
    pub(crate) fn release_bus_refs(&self, bus: &Arc<BusState>, count: u32) {
        if count == 0 {
            return;
        }
        let mut core = bus.lock();
        assert!(
            core.refcount >= count,
            "bus {} refcount underflow ({} - {count})",
            bus.id.0,
            core.refcount
        );
        core.refcount -= count;
        if core.refcount == 0 && core.target_list.is_empty() {
            let mut dir = self.directory_lock();
            if let Some(pos) = dir.buses.iter().position(|b| b.id == bus.id) {
                dir.buses.remove(pos);
                dir.generation += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::StaticSim;

    fn open() -> Arc<Topology> {
        Topology::open(TopologyConfig::default())
    }

    fn sim() -> Arc<dyn SimPort> {
        Arc::new(StaticSim::new("vbus", 4))
    }

    #[test]
    fn register_assigns_lowest_unused_id() {
        let xpt = open();
        let b0 = xpt.register_bus(sim()).unwrap();
        let b1 = xpt.register_bus(sim()).unwrap();
        assert_eq!((b0, b1), (BusId(0), BusId(1)));

        xpt.deregister_bus(b0).unwrap();
        // Slot 0 is free again and is reused before extending the range.
        let again = xpt.register_bus(sim()).unwrap();
        assert_eq!(again, BusId(0));
        assert_eq!(xpt.register_bus(sim()).unwrap(), BusId(2));
    }

    #[test]
    fn bus_cap_is_enforced() {
        let xpt = Topology::open(TopologyConfig {
            max_buses: 1,
            ..TopologyConfig::default()
        });
        xpt.register_bus(sim()).unwrap();
        let err = xpt.register_bus(sim()).unwrap_err();
        assert!(matches!(err, XptError::ResourceUnavailable { .. }));
    }

    #[test]
    fn registration_bumps_directory_generation() {
        let xpt = open();
        let before = xpt.topology_stats().generation;
        let bus = xpt.register_bus(sim()).unwrap();
        assert_eq!(xpt.topology_stats().generation, before + 1);
        xpt.deregister_bus(bus).unwrap();
        // Removal happens when the last reference goes, which is now.
        assert_eq!(xpt.topology_stats().generation, before + 2);
        assert_eq!(xpt.topology_stats().buses, 0);
    }

    #[test]
    fn compile_creates_nodes_and_release_cascades() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let spec = PathSpec::new(bus, TargetId(1), LunId(0));
        let path = xpt.compile_path(spec).unwrap();
        assert!(path.has_device());

        let stats = xpt.bus_stats(bus).unwrap();
        assert_eq!(stats.targets, 1);
        let gen_after_create = stats.target_list_gen;

        xpt.release_path(path);
        let stats = xpt.bus_stats(bus).unwrap();
        assert_eq!(stats.targets, 0);
        assert_eq!(stats.target_list_gen, gen_after_create + 1);
        xpt.close().unwrap();
    }

    #[test]
    fn second_compile_shares_nodes() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let spec = PathSpec::new(bus, TargetId(0), LunId(0));
        let a = xpt.compile_path(spec).unwrap();
        let created_gen = xpt.bus_stats(bus).unwrap().target_list_gen;
        let b = xpt.compile_path(spec).unwrap();
        // No structural change on the second compile.
        assert_eq!(xpt.bus_stats(bus).unwrap().target_list_gen, created_gen);
        assert_eq!(xpt.device_stats(&a).unwrap().refcount, 2);
        xpt.release_path(a);
        // Still alive through `b`.
        assert_eq!(xpt.device_stats(&b).unwrap().refcount, 1);
        xpt.release_path(b);
        assert_eq!(xpt.bus_stats(bus).unwrap().targets, 0);
    }

    #[test]
    fn wildcard_levels_never_create_nodes() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let path = xpt.compile_path(PathSpec::bus_wide(bus)).unwrap();
        assert!(!path.has_device());
        assert_eq!(xpt.bus_stats(bus).unwrap().targets, 0);
        xpt.release_path(path);

        let wild = xpt.compile_path(PathSpec::wildcard()).unwrap();
        xpt.release_path(wild);
    }

    #[test]
    fn concrete_lun_under_wildcard_target_is_invalid() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let spec = PathSpec::new(bus, TargetId::WILDCARD, LunId(0));
        assert!(matches!(
            xpt.compile_path(spec),
            Err(XptError::PathInvalid { .. })
        ));
    }

    #[test]
    fn ids_past_controller_maxima_are_invalid() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let info = xpt.path_inquiry(bus).unwrap();
        let spec = PathSpec::new(bus, TargetId(info.max_target + 1), LunId(0));
        assert!(xpt.compile_path(spec).is_err());
        let spec = PathSpec::new(bus, TargetId(0), LunId(info.max_lun + 1));
        assert!(xpt.compile_path(spec).is_err());
        // Nothing was created along the failed compiles.
        assert_eq!(xpt.bus_stats(bus).unwrap().targets, 0);
    }

    #[test]
    fn dead_bus_refuses_new_compiles() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let held = xpt.compile_path(PathSpec::new(bus, TargetId(0), LunId(0))).unwrap();
        xpt.deregister_bus(bus).unwrap();
        assert!(xpt
            .compile_path(PathSpec::new(bus, TargetId(0), LunId(1)))
            .is_err());
        // The held path still resolves and keeps the bus in the directory.
        assert_eq!(xpt.topology_stats().buses, 1);
        xpt.release_path(held);
        assert_eq!(xpt.topology_stats().buses, 0);
    }

    #[test]
    fn dup_path_acquires_independent_references() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let a = xpt.compile_path(PathSpec::new(bus, TargetId(2), LunId(3))).unwrap();
        let b = xpt.dup_path(&a).unwrap();
        xpt.release_path(a);
        assert_eq!(xpt.device_stats(&b).unwrap().refcount, 1);
        xpt.release_path(b);
    }

    #[test]
    fn announce_and_query_device() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let path = xpt.compile_path(PathSpec::new(bus, TargetId(0), LunId(0))).unwrap();
        assert!(matches!(
            xpt.query_device(&path),
            Err(XptError::DeviceNotThere { .. })
        ));
        assert!(xpt.device_stats(&path).unwrap().provisional);

        let ident = DeviceIdent::new("ACME", "disk9000", "1.0");
        xpt.announce_device(&path, ident.clone()).unwrap();
        assert_eq!(xpt.query_device(&path).unwrap(), ident);
        assert!(!xpt.device_stats(&path).unwrap().provisional);

        xpt.lose_device(&path);
        assert!(xpt.query_device(&path).is_err());
        xpt.release_path(path);
    }

    #[test]
    fn close_reports_leaked_references() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let path = xpt.compile_path(PathSpec::new(bus, TargetId(0), LunId(0))).unwrap();
        assert!(matches!(
            xpt.close(),
            Err(XptError::InvalidState { .. })
        ));
        xpt.release_path(path);
        xpt.close().unwrap();
    }

    #[test]
    fn trace_records_lifecycle() {
        let xpt = open();
        let bus = xpt.register_bus(sim()).unwrap();
        let path = xpt.compile_path(PathSpec::new(bus, TargetId(1), LunId(2))).unwrap();
        xpt.release_path(path);
        let trace = xpt.take_trace();
        let kinds: Vec<_> = trace
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    TraceEvent::BusRegistered { .. }
                        | TraceEvent::TargetCreated { .. }
                        | TraceEvent::DeviceCreated { .. }
                        | TraceEvent::DeviceDestroyed { .. }
                        | TraceEvent::TargetDestroyed { .. }
                )
            })
            .collect();
        assert_eq!(kinds.len(), 5, "got {trace:?}");
    }
}
