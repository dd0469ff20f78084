//! The command queue engine.
//!
//! Work moves through two per-bus ready queues. The *allocation* queue
//! holds devices with peripherals waiting for a command-block grant; the
//! *dispatch* queue holds devices with queued blocks ready to hand to the
//! controller. Both order devices by (priority, insertion generation), so
//! equal priorities drain FIFO. Draining either queue takes credits — a
//! device credit and a controller credit per step — and stops at the first
//! gate: pool exhausted, controller frozen at the head's run level, or
//! nothing seated.
//!
//! Freezes nest per run level. A frozen device is unseated from both
//! queues and is not re-seated until released; release policies can defer
//! the final count to a timer tick, the next successful completion, or the
//! device's queue going empty.
//!
//! Re-entrancy: a drain requested while one is already running on the same
//! bus sets a flag that the active drain consumes, so drains never recurse
//! and requests are never dropped. Every outward call — peripheral start
//! and done hooks, controller submit — runs with no engine locks held.
//!
//! Completions arrive through a lock-free done queue: `done` only pushes
//! and is safe from any completion context; `drain_completions` (or the
//! `complete` convenience) performs the accounting.

pub mod credit;
pub mod freeze;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::boundary::{PeriphOps, SimPort, SimRequest};
use crate::cmd::{
    AbortOutcome, CmdPhase, CmdRef, CmdStatus, CommandBlock, CompletionCode, Function, IoSpec,
};
use crate::errors::XptError;
use crate::stdx::arena::Handle;
use crate::stdx::ready_queue::UNQUEUED;
use crate::topology::nodes::Device;
use crate::topology::{BusCore, BusId, BusState, Path, PeriphRef, Topology};
use crate::trace::TraceEvent;

pub use freeze::{priority, FreezeLevels, RunLevel, RUN_LEVELS};

/// How a freeze release is applied. External callers pick exactly one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Release the full count immediately.
    Now,
    /// Keep one count deferred until the clock reaches now + `ticks`.
    Timeout { ticks: u64 },
    /// Keep one count deferred until the next completion that is not a
    /// requeue.
    OnCompletion,
    /// Keep one count deferred until the device has no queued or active
    /// blocks.
    OnQueueEmpty,
}

/// Which controller-level queue a freeze applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineQueue {
    Allocation,
    Dispatch,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DeferredKind {
    Timeout,
    OnCompletion,
    OnQueueEmpty,
}

/// An armed deferred release: one freeze count at `level` waiting on the
/// policy condition. At most one is armed per device; re-arming replaces
/// it and bumps the epoch so stale timer entries are ignored.
pub(crate) struct Deferred {
    pub(crate) level: RunLevel,
    pub(crate) kind: DeferredKind,
    pub(crate) epoch: u64,
}

/// System-wide admission gate for high-power commands.
pub(crate) struct HighPowerGate {
    limit: u32,
    in_use: u32,
    parked: VecDeque<CmdRef>,
}

impl HighPowerGate {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            limit,
            in_use: 0,
            parked: VecDeque::new(),
        }
    }

    pub(crate) fn in_use(&self) -> u32 {
        self.in_use
    }

    pub(crate) fn parked_len(&self) -> u32 {
        self.parked.len() as u32
    }

    pub(crate) fn try_take(&mut self) -> bool {
        if self.in_use < self.limit {
            self.in_use += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn give(&mut self) {
        assert!(self.in_use > 0, "high-power slot returned twice");
        self.in_use -= 1;
    }

    pub(crate) fn park(&mut self, cmd: CmdRef) {
        self.parked.push_back(cmd);
    }

    pub(crate) fn pop_parked(&mut self) -> Option<CmdRef> {
        self.parked.pop_front()
    }

    /// Drop a parked entry (the block was aborted while waiting).
    pub(crate) fn unpark(&mut self, cmd: CmdRef) {
        self.parked.retain(|c| *c != cmd);
    }
}

pub(crate) struct TimerEntry {
    pub(crate) deadline: u64,
    pub(crate) bus: BusId,
    pub(crate) device: Handle<Device>,
    pub(crate) epoch: u64,
}

/// One-shot deferred-release timers, driven by an explicit tick clock.
pub(crate) struct TimerTable {
    now: u64,
    entries: Vec<TimerEntry>,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self {
            now: 0,
            entries: Vec::new(),
        }
    }

    pub(crate) fn now(&self) -> u64 {
        self.now
    }

    pub(crate) fn arm(&mut self, entry: TimerEntry) {
        self.entries.push(entry);
    }

    /// Move the clock forward and pull every due entry, earliest first.
    /// Stale entries (epoch mismatch at fire time) are filtered by the
    /// caller; the table only orders them.
    pub(crate) fn advance(&mut self, now: u64) -> Vec<TimerEntry> {
        self.now = self.now.max(now);
        let mut due: Vec<TimerEntry> = Vec::new();
        let mut keep = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.deadline <= now {
                due.push(entry);
            } else {
                keep.push(entry);
            }
        }
        self.entries = keep;
        due.sort_by_key(|e| e.deadline);
        due
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Outcome of one dispatch-drain step.
enum DispatchStep {
    /// A block left for the controller; the request is submitted with no
    /// locks held.
    Submit {
        sim: Arc<dyn SimPort>,
        request: SimRequest,
    },
    /// Progress without a submission (a block was parked or a frozen
    /// device skipped); keep draining.
    Again,
    /// Nothing dispatchable right now.
    Idle,
}

impl Topology {
    // ==================== Scheduling ====================

    /// Ask for a command-block grant on the peripheral's device. A
    /// peripheral already waiting only has its urgency raised (a
    /// numerically lower priority); it is never demoted. Seats the device
    /// on the allocation queue and drains when the seat is new.
    pub fn schedule(&self, periph: PeriphRef, priority: u32) -> Result<(), XptError> {
        let bus = self.bus(periph.bus)?;
        let newly_seated;
        {
            let mut guard = bus.lock();
            let core = &mut *guard;
            let p = core.periphs.get(periph.periph).ok_or(XptError::StaleHandle {
                what: "peripheral",
            })?;
            let dh = p.device;
            let seat = p.seat;
            let dev = core
                .devices
                .get_mut(dh)
                .unwrap_or_else(|| panic!("peripheral outlived its device"));
            self.trace.record(TraceEvent::Scheduled {
                addr: dev.addr,
                priority,
            });
            if seat != UNQUEUED {
                if priority < dev.waiters.priority_at(seat) {
                    dev.waiters
                        .reprioritize(&mut core.periphs, periph.periph, priority);
                }
                let head = dev
                    .waiters
                    .head_priority()
                    .unwrap_or_else(|| unreachable!());
                let dev_seat = dev.alloc_seat;
                if dev_seat != UNQUEUED && head < core.alloc_queue.priority_at(dev_seat) {
                    core.alloc_queue.reprioritize(&mut core.devices, dh, head);
                }
                newly_seated = false;
            } else {
                dev.waiters
                    .insert(&mut core.periphs, periph.periph, priority);
                newly_seated = self.seat_alloc_if_ready(core, dh);
            }
        }
        if newly_seated {
            self.drain_alloc(&bus);
        }
        Ok(())
    }

    /// Drain the bus's allocation queue: grant command blocks to the
    /// highest-priority waiting peripherals while credits last.
    pub fn run_allocation_queue(&self, bus: BusId) -> Result<(), XptError> {
        let bus = self.bus(bus)?;
        self.drain_alloc(&bus);
        Ok(())
    }

    /// Drain the bus's dispatch queue: hand queued blocks to the
    /// controller while send openings last.
    pub fn run_dispatch_queue(&self, bus: BusId) -> Result<(), XptError> {
        let bus = self.bus(bus)?;
        self.drain_dispatch(&bus);
        Ok(())
    }

    /// Queue a granted block for dispatch. Called by the owner from (or
    /// after) its start hook. An abort that raced the grant completes the
    /// block as aborted here instead of queueing it.
    pub fn submit_io(&self, cmd: CmdRef, spec: IoSpec) -> Result<(), XptError> {
        let bus = self.bus(cmd.bus)?;
        let mut run_dispatch = false;
        let mut flagged: Option<CmdStatus> = None;
        {
            let mut guard = bus.lock();
            let core = &mut *guard;
            let block = core.blocks.get_mut(cmd.block).ok_or(XptError::StaleHandle {
                what: "command block",
            })?;
            if block.phase != CmdPhase::Owned || block.is_queued() {
                return Err(XptError::InvalidState {
                    what: "block not held by its owner",
                });
            }
            block.function = spec.function;
            block.flags = spec.flags;
            block.user_data = spec.user_data;
            let dh = block.device;
            let prio = block.priority;
            if block.abort_requested {
                let status = CmdStatus::new(CompletionCode::Aborted).with_device_frozen();
                let dev = core
                    .devices
                    .get_mut(dh)
                    .unwrap_or_else(|| unreachable!());
                dev.held -= 1;
                let addr = dev.addr;
                self.apply_freeze(core, dh, RunLevel::URGENT, 1);
                self.trace.record(TraceEvent::Aborted {
                    addr,
                    queued: false,
                });
                flagged = Some(status);
            } else {
                let dev = core
                    .devices
                    .get_mut(dh)
                    .unwrap_or_else(|| unreachable!());
                dev.held -= 1;
                dev.pending.insert(&mut core.blocks, cmd.block, prio);
                let head = dev.pending.head_priority().unwrap_or(prio);
                let dev_seat = dev.dispatch_seat;
                self.trace.record(TraceEvent::BlockQueued {
                    addr: dev.addr,
                    priority: prio,
                });
                if dev_seat != UNQUEUED {
                    if head < core.dispatch_queue.priority_at(dev_seat) {
                        core.dispatch_queue.reprioritize(&mut core.devices, dh, head);
                    }
                } else {
                    run_dispatch = self.seat_dispatch_if_ready(core, dh);
                }
            }
        }
        if let Some(status) = flagged {
            self.done.push((cmd, status));
            self.drain_completions();
        }
        if run_dispatch {
            self.drain_dispatch(&bus);
        }
        Ok(())
    }

    /// Return a block to the pool: give back the allocation credits, drop
    /// the block's device reference, and re-drain the allocation queue if
    /// peripherals still wait. Legal for held blocks (work that
    /// evaporated) and completed blocks; not for queued or active ones.
    pub fn release_cmd(&self, cmd: CmdRef) -> Result<(), XptError> {
        let bus = self.bus(cmd.bus)?;
        let run_alloc;
        let drops;
        {
            let mut guard = bus.lock();
            let core = &mut *guard;
            let block = core.blocks.get(cmd.block).ok_or(XptError::StaleHandle {
                what: "command block",
            })?;
            if block.is_queued() || block.phase == CmdPhase::Active {
                return Err(XptError::InvalidState {
                    what: "block queued or at the controller",
                });
            }
            let block = core.blocks.remove(cmd.block);
            let dh = block.device;
            let dev = core
                .devices
                .get_mut(dh)
                .unwrap_or_else(|| panic!("block outlived its device"));
            if block.phase == CmdPhase::Owned {
                dev.held -= 1;
            }
            dev.alloc_credit.give();
            core.ctrl_alloc.give();
            self.trace.record(TraceEvent::BlockReleased { addr: block.addr });
            self.seat_alloc_if_ready(core, dh);
            run_alloc = !core.alloc_queue.is_empty() && core.ctrl_alloc.available() > 0;
            drops = self.drop_device_ref(core, dh);
        }
        self.release_bus_refs(&bus, drops);
        if run_alloc {
            self.drain_alloc(&bus);
        }
        Ok(())
    }

    // ==================== Abort ====================

    /// Abort a block wherever it currently is. Idempotent: aborting a
    /// block that already completed is a no-op.
    pub fn abort(&self, cmd: CmdRef) -> Result<AbortOutcome, XptError> {
        let bus = self.bus(cmd.bus)?;
        let status;
        {
            let mut guard = bus.lock();
            let core = &mut *guard;
            let block = core.blocks.get_mut(cmd.block).ok_or(XptError::StaleHandle {
                what: "command block",
            })?;
            match block.phase {
                CmdPhase::Done => return Ok(AbortOutcome::AlreadyDone),
                CmdPhase::Active => {
                    drop(guard);
                    bus.sim.submit(self, SimRequest::Abort { cmd });
                    return Ok(AbortOutcome::Delegated);
                }
                CmdPhase::Owned if !block.is_queued() => {
                    block.abort_requested = true;
                    return Ok(AbortOutcome::Flagged);
                }
                CmdPhase::Owned => {
                    let dh = block.device;
                    let was_parked = block.hp_parked;
                    block.hp_parked = false;
                    let addr = block.addr;
                    let dev = core
                        .devices
                        .get_mut(dh)
                        .unwrap_or_else(|| unreachable!());
                    dev.pending.remove(&mut core.blocks, cmd.block);
                    let dev_seat = dev.dispatch_seat;
                    let new_head = dev.pending.head_priority();
                    if dev_seat != UNQUEUED {
                        match new_head {
                            Some(head) => {
                                core.dispatch_queue.reprioritize(&mut core.devices, dh, head)
                            }
                            None => core.dispatch_queue.remove(&mut core.devices, dh),
                        }
                    }
                    if was_parked {
                        self.high_power_lock().unpark(cmd);
                        // The parking freeze is replaced by the abort
                        // freeze below.
                        self.apply_release(core, dh, RunLevel::URGENT, 1);
                    }
                    self.apply_freeze(core, dh, RunLevel::URGENT, 1);
                    self.trace.record(TraceEvent::Aborted { addr, queued: true });
                    status = CmdStatus::new(CompletionCode::Aborted).with_device_frozen();
                }
            }
        }
        self.done.push((cmd, status));
        self.drain_completions();
        Ok(AbortOutcome::AbortedFromQueue)
    }

    // ==================== Completion ====================

    /// Report a block's completion. Wait-free: only pushes onto the done
    /// queue. Call [`Topology::drain_completions`] (or use
    /// [`Topology::complete`]) to run the accounting.
    pub fn done(&self, cmd: CmdRef, status: CmdStatus) {
        self.done.push((cmd, status));
    }

    /// `done` plus an immediate `drain_completions`.
    pub fn complete(&self, cmd: CmdRef, status: CmdStatus) {
        self.done.push((cmd, status));
        self.drain_completions();
    }

    /// Process every queued completion: return credits, release the
    /// high-power slot (waking the oldest parked command), apply deferred
    /// release policies and status markers, re-drain the dispatch queue,
    /// and invoke the owner's done hook.
    pub fn drain_completions(&self) {
        while let Some((cmd, status)) = self.done.pop() {
            self.process_completion(cmd, status);
        }
    }

    fn process_completion(&self, cmd: CmdRef, status: CmdStatus) {
        let Ok(bus) = self.bus(cmd.bus) else {
            self.trace.record(TraceEvent::OrphanCompletion {
                addr: crate::topology::PathSpec::bus_wide(cmd.bus),
            });
            return;
        };
        let mut callback: Option<(Arc<dyn PeriphOps>, CmdStatus)> = None;
        let mut cross_bus: Option<CmdRef> = None;
        let mut run_dispatch = false;
        {
            let mut guard = bus.lock();
            let core = &mut *guard;
            let Some(block) = core.blocks.get_mut(cmd.block) else {
                self.trace.record(TraceEvent::OrphanCompletion {
                    addr: crate::topology::PathSpec::bus_wide(cmd.bus),
                });
                return;
            };
            if block.phase == CmdPhase::Done {
                // Double completion; first one wins.
                self.trace
                    .record(TraceEvent::OrphanCompletion { addr: block.addr });
                return;
            }
            block.phase = CmdPhase::Done;
            let merged = CmdStatus {
                code: status.code,
                device_frozen: status.device_frozen || block.status.device_frozen,
                release_controller: status.release_controller,
            };
            block.status = merged;
            let dh = block.device;
            let dispatched = block.dispatched;
            let had_slot = block.hp_slot;
            block.hp_slot = false;
            let addr = block.addr;
            let flags = block.flags;
            let owner = block.owner;

            if had_slot {
                let mut gate = self.high_power_lock();
                gate.give();
                let parked = gate.pop_parked();
                drop(gate);
                match parked {
                    Some(parked) if parked.bus == bus.id => {
                        if let Some(b) = core.blocks.get_mut(parked.block) {
                            b.hp_parked = false;
                            let pdh = b.device;
                            self.apply_release(core, pdh, RunLevel::URGENT, 1);
                            run_dispatch = true;
                        }
                    }
                    Some(parked) => cross_bus = Some(parked),
                    None => {}
                }
            }
            if dispatched {
                let dev = core
                    .devices
                    .get_mut(dh)
                    .unwrap_or_else(|| panic!("block outlived its device"));
                dev.send_credit.give();
                dev.active -= 1;
                core.ctrl_send.give();
            }
            if merged.release_controller {
                let remaining = core.dispatch_freeze.release(RunLevel::URGENT, 1);
                self.trace.record(TraceEvent::ControllerThawed {
                    bus: bus.id,
                    level: RunLevel::URGENT.index() as u8,
                    remaining,
                });
                run_dispatch = true;
            }
            if merged.device_frozen && flags.auto_thaw {
                self.apply_release(core, dh, RunLevel::URGENT, 1);
                run_dispatch = true;
            }
            // Deferred release policies.
            let dev = core
                .devices
                .get_mut(dh)
                .unwrap_or_else(|| unreachable!());
            let fire = match dev.deferred.as_ref().map(|d| d.kind) {
                Some(DeferredKind::OnCompletion) => merged.code != CompletionCode::Requeue,
                Some(DeferredKind::OnQueueEmpty) => {
                    dev.active == 0 && dev.pending.is_empty()
                }
                _ => false,
            };
            if fire {
                let def = dev
                    .deferred
                    .take()
                    .unwrap_or_else(|| unreachable!());
                dev.deferred_epoch += 1;
                self.apply_release(core, dh, def.level, 1);
                run_dispatch = true;
            }
            self.seat_dispatch_if_ready(core, dh);
            if dispatched && !core.dispatch_queue.is_empty() && core.ctrl_send.available() > 0 {
                run_dispatch = true;
            }
            self.trace.record(TraceEvent::Completed {
                addr,
                code: merged.code,
            });
            if let Some(oh) = owner {
                if let Some(p) = core.periphs.get(oh) {
                    callback = Some((p.ops.clone(), merged));
                }
            }
        }
        if let Some(parked) = cross_bus {
            self.release_parked(parked);
        }
        if run_dispatch {
            self.drain_dispatch(&bus);
        }
        if let Some((ops, st)) = callback {
            ops.done(self, cmd, st);
        }
    }

    /// Release the parking freeze of a woken high-power block on another
    /// bus. Runs with no lock held on the completing bus.
    fn release_parked(&self, parked: CmdRef) {
        let Ok(bus) = self.bus(parked.bus) else { return };
        {
            let mut guard = bus.lock();
            let core = &mut *guard;
            if let Some(b) = core.blocks.get_mut(parked.block) {
                if b.hp_parked {
                    b.hp_parked = false;
                    let dh = b.device;
                    self.apply_release(core, dh, RunLevel::URGENT, 1);
                }
            }
        }
        self.drain_dispatch(&bus);
    }

    // ==================== Freeze / release ====================

    /// Add freeze counts at a run level; the device leaves both ready
    /// queues if its seated work is now gated. Returns the level's new
    /// count.
    pub fn freeze_device(
        &self,
        path: &Path,
        level: RunLevel,
        count: u32,
    ) -> Result<u32, XptError> {
        let dh = path.device.ok_or(XptError::PathInvalid { spec: path.spec() })?;
        let bus = self.bus(path.bus_id())?;
        let mut guard = bus.lock();
        let core = &mut *guard;
        if !core.devices.contains(dh) {
            return Err(XptError::StaleHandle {
                what: "path device",
            });
        }
        let new = self.apply_freeze(core, dh, level, count);
        let addr = core
            .devices
            .get(dh)
            .unwrap_or_else(|| unreachable!())
            .addr;
        self.trace.record(TraceEvent::DeviceFrozen {
            addr,
            level: level.index() as u8,
            count: new,
        });
        Ok(new)
    }

    /// Release freeze counts at a run level under a policy. A deferred
    /// policy keeps exactly one count back and releases the remainder
    /// immediately; re-arming an armed policy replaces it and releases the
    /// full new count at once, so a single deferred release is ever
    /// outstanding. A deferred policy therefore needs at least one count to
    /// defer; `count == 0` is only valid with [`ReleasePolicy::Now`], where
    /// it is a no-op. When the device becomes unfrozen it is re-seated, and
    /// `run_queue` then triggers a drain. Returns the level's remaining
    /// count.
    pub fn release_device_queue(
        &self,
        path: &Path,
        level: RunLevel,
        count: u32,
        policy: ReleasePolicy,
        run_queue: bool,
    ) -> Result<u32, XptError> {
        let dh = path.device.ok_or(XptError::PathInvalid { spec: path.spec() })?;
        if count == 0 && policy != ReleasePolicy::Now {
            return Err(XptError::InvalidState {
                what: "deferred release with no count to defer",
            });
        }
        let bus = self.bus(path.bus_id())?;
        let remaining;
        {
            let mut guard = bus.lock();
            let core = &mut *guard;
            let dev = core.devices.get_mut(dh).ok_or(XptError::StaleHandle {
                what: "path device",
            })?;
            let mut release_now = count;
            if policy != ReleasePolicy::Now {
                let rearmed = dev.deferred.is_some();
                if !rearmed {
                    release_now = count.saturating_sub(1);
                }
                dev.deferred_epoch += 1;
                let epoch = dev.deferred_epoch;
                let kind = match policy {
                    ReleasePolicy::Timeout { ticks } => {
                        let addr = dev.addr;
                        let mut timers = self.timers_lock();
                        let deadline = timers.now().saturating_add(ticks);
                        timers.arm(TimerEntry {
                            deadline,
                            bus: bus.id,
                            device: dh,
                            epoch,
                        });
                        drop(timers);
                        self.trace.record(TraceEvent::TimerArmed { addr, deadline });
                        DeferredKind::Timeout
                    }
                    ReleasePolicy::OnCompletion => DeferredKind::OnCompletion,
                    ReleasePolicy::OnQueueEmpty => DeferredKind::OnQueueEmpty,
                    ReleasePolicy::Now => unreachable!(),
                };
                dev.deferred = Some(Deferred { level, kind, epoch });
            }
            remaining = self.apply_release(core, dh, level, release_now);
        }
        if run_queue {
            self.drain_alloc(&bus);
            self.drain_dispatch(&bus);
        }
        Ok(remaining)
    }

    /// Freeze a controller-level queue at a run level.
    pub fn freeze_controller(
        &self,
        bus: BusId,
        queue: EngineQueue,
        level: RunLevel,
        count: u32,
    ) -> Result<u32, XptError> {
        let state = self.bus(bus)?;
        let mut core = state.lock();
        let levels = match queue {
            EngineQueue::Allocation => &mut core.alloc_freeze,
            EngineQueue::Dispatch => &mut core.dispatch_freeze,
        };
        let new = levels.freeze(level, count);
        self.trace.record(TraceEvent::ControllerFrozen {
            bus,
            level: level.index() as u8,
            count: new,
        });
        Ok(new)
    }

    /// Release a controller-level freeze, optionally draining the queue it
    /// gated.
    pub fn release_controller_queue(
        &self,
        bus: BusId,
        queue: EngineQueue,
        level: RunLevel,
        count: u32,
        run_queue: bool,
    ) -> Result<u32, XptError> {
        let state = self.bus(bus)?;
        let remaining;
        {
            let mut core = state.lock();
            let levels = match queue {
                EngineQueue::Allocation => &mut core.alloc_freeze,
                EngineQueue::Dispatch => &mut core.dispatch_freeze,
            };
            remaining = levels.release(level, count);
            self.trace.record(TraceEvent::ControllerThawed {
                bus,
                level: level.index() as u8,
                remaining,
            });
        }
        if run_queue {
            match queue {
                EngineQueue::Allocation => self.drain_alloc(&state),
                EngineQueue::Dispatch => self.drain_dispatch(&state),
            }
        }
        Ok(remaining)
    }

    /// Resize both of a device's credit pools. Shrinking below the credits
    /// currently out books debt; growth can make the device schedulable
    /// again, in which case it is re-seated and drained.
    pub fn adjust_device_openings(&self, path: &Path, openings: u32) -> Result<(), XptError> {
        let dh = path.device.ok_or(XptError::PathInvalid { spec: path.spec() })?;
        let bus = self.bus(path.bus_id())?;
        let run_alloc;
        let run_dispatch;
        {
            let mut guard = bus.lock();
            let core = &mut *guard;
            let (unseat_alloc, unseat_dispatch) = {
                let dev = core.devices.get_mut(dh).ok_or(XptError::StaleHandle {
                    what: "path device",
                })?;
                dev.alloc_credit.resize(openings);
                dev.send_credit.resize(openings);
                // A seat guarantees the drain can fund one grant; a shrink
                // below one available credit breaks that, so unseat.
                (
                    dev.alloc_seat != UNQUEUED && dev.alloc_credit.available() == 0,
                    dev.dispatch_seat != UNQUEUED && dev.send_credit.available() == 0,
                )
            };
            if unseat_alloc {
                core.alloc_queue.remove(&mut core.devices, dh);
            }
            if unseat_dispatch {
                core.dispatch_queue.remove(&mut core.devices, dh);
            }
            run_alloc = self.seat_alloc_if_ready(core, dh);
            run_dispatch = self.seat_dispatch_if_ready(core, dh);
        }
        if run_alloc {
            self.drain_alloc(&bus);
        }
        if run_dispatch {
            self.drain_dispatch(&bus);
        }
        Ok(())
    }

    /// Advance the tick clock, firing due deferred-release timers.
    pub fn advance_clock(&self, now: u64) {
        let due = self.timers_lock().advance(now);
        for entry in due {
            let Ok(bus) = self.bus(entry.bus) else { continue };
            let fired;
            {
                let mut guard = bus.lock();
                let core = &mut *guard;
                let Some(dev) = core.devices.get_mut(entry.device) else {
                    continue;
                };
                let live = dev
                    .deferred
                    .as_ref()
                    .is_some_and(|d| d.epoch == entry.epoch && d.kind == DeferredKind::Timeout);
                if !live {
                    continue;
                }
                let def = dev.deferred.take().unwrap_or_else(|| unreachable!());
                dev.deferred_epoch += 1;
                let addr = dev.addr;
                self.trace.record(TraceEvent::TimerFired { addr });
                self.apply_release(core, entry.device, def.level, 1);
                fired = true;
            }
            if fired {
                self.drain_alloc(&bus);
                self.drain_dispatch(&bus);
            }
        }
    }

    /// Delegate a bus reset to the controller. The controller (or test
    /// harness) publishes the `BusReset` event once the reset happens.
    pub fn reset_bus(&self, bus: BusId) -> Result<(), XptError> {
        let state = self.bus(bus)?;
        self.trace.record(TraceEvent::BusReset { bus });
        state.sim.submit(self, SimRequest::ResetBus { bus });
        Ok(())
    }

    // ==================== Drain machinery ====================

    fn drain_alloc(&self, bus: &Arc<BusState>) {
        {
            let mut core = bus.lock();
            if core.alloc_draining {
                core.alloc_drain_requested = true;
                return;
            }
            core.alloc_draining = true;
        }
        loop {
            match self.next_alloc_grant(bus) {
                Some((ops, cmd)) => ops.start(self, cmd),
                None => {
                    let mut core = bus.lock();
                    if core.alloc_drain_requested {
                        core.alloc_drain_requested = false;
                        continue;
                    }
                    core.alloc_draining = false;
                    return;
                }
            }
        }
    }

    /// One allocation-queue step: pop the best seated device, charge one
    /// device and one controller allocation credit, grant a block to its
    /// best waiter. Returns the start hook to invoke lock-free.
    fn next_alloc_grant(&self, bus: &Arc<BusState>) -> Option<(Arc<dyn PeriphOps>, CmdRef)> {
        let mut guard = bus.lock();
        let core = &mut *guard;
        let (dh, seat_prio) = core.alloc_queue.head_entry()?;
        if core
            .alloc_freeze
            .frozen_through(RunLevel::of_priority(seat_prio))
            > 0
        {
            return None;
        }
        if core.ctrl_alloc.available() == 0 {
            // Block pool exhausted: the device stays seated, work is kept.
            self.trace.record(TraceEvent::PoolExhausted { bus: core.id });
            return None;
        }
        core.alloc_queue.pop(&mut core.devices);
        let dev = core
            .devices
            .get_mut(dh)
            .unwrap_or_else(|| unreachable!());
        dev.alloc_credit.take();
        core.ctrl_alloc.take();
        dev.held += 1;
        dev.refcount += 1; // the block's device reference
        let (ph, periph_prio) = dev
            .waiters
            .pop(&mut core.periphs)
            .unwrap_or_else(|| panic!("seated device with no waiters"));
        let addr = dev.addr;
        let bh = core
            .blocks
            .insert(CommandBlock::new(dh, ph, addr, periph_prio));
        self.seat_alloc_if_ready(core, dh);
        let ops = core
            .periphs
            .get(ph)
            .unwrap_or_else(|| panic!("waiter popped from detached peripheral"))
            .ops
            .clone();
        self.trace.record(TraceEvent::BlockAllocated {
            addr,
            priority: periph_prio,
        });
        Some((ops, CmdRef::new(bus.id, bh)))
    }

    fn drain_dispatch(&self, bus: &Arc<BusState>) {
        {
            let mut core = bus.lock();
            if core.dispatch_draining {
                core.dispatch_drain_requested = true;
                return;
            }
            core.dispatch_draining = true;
        }
        loop {
            match self.next_dispatch_step(bus) {
                DispatchStep::Submit { sim, request } => sim.submit(self, request),
                DispatchStep::Again => {}
                DispatchStep::Idle => {
                    let mut core = bus.lock();
                    if core.dispatch_drain_requested {
                        core.dispatch_drain_requested = false;
                        continue;
                    }
                    core.dispatch_draining = false;
                    return;
                }
            }
        }
    }

    /// One dispatch-queue step: pop the best seated device and send its
    /// best block, charging send credits and the high-power gate.
    fn next_dispatch_step(&self, bus: &Arc<BusState>) -> DispatchStep {
        let mut guard = bus.lock();
        let core = &mut *guard;
        if core.ctrl_send.available() == 0 {
            return DispatchStep::Idle;
        }
        let Some((dh, seat_prio)) = core.dispatch_queue.head_entry() else {
            return DispatchStep::Idle;
        };
        if core
            .dispatch_freeze
            .frozen_through(RunLevel::of_priority(seat_prio))
            > 0
        {
            return DispatchStep::Idle;
        }
        core.dispatch_queue.pop(&mut core.devices);
        let dev = core
            .devices
            .get_mut(dh)
            .unwrap_or_else(|| unreachable!());
        let (bh, block_prio) = dev
            .pending
            .head_entry()
            .unwrap_or_else(|| panic!("seated device with no pending blocks"));
        if dev.frozen_for(block_prio) {
            // Frozen after seating; left unseated, release re-seats it.
            return DispatchStep::Again;
        }
        let addr = dev.addr;
        let flags = core
            .blocks
            .get(bh)
            .unwrap_or_else(|| unreachable!())
            .flags;
        if flags.high_power {
            let mut gate = self.high_power_lock();
            if !gate.try_take() {
                gate.park(CmdRef::new(bus.id, bh));
                drop(gate);
                core.blocks
                    .get_mut(bh)
                    .unwrap_or_else(|| unreachable!())
                    .hp_parked = true;
                self.apply_freeze(core, dh, RunLevel::URGENT, 1);
                self.trace.record(TraceEvent::HighPowerParked { addr });
                return DispatchStep::Again;
            }
            drop(gate);
            core.blocks
                .get_mut(bh)
                .unwrap_or_else(|| unreachable!())
                .hp_slot = true;
            self.trace.record(TraceEvent::HighPowerGranted { addr });
        }
        let dev = core
            .devices
            .get_mut(dh)
            .unwrap_or_else(|| unreachable!());
        let (popped, _) = dev
            .pending
            .pop(&mut core.blocks)
            .unwrap_or_else(|| unreachable!());
        debug_assert_eq!(popped, bh);
        dev.send_credit.take();
        core.ctrl_send.take();
        dev.active += 1;
        let block = core
            .blocks
            .get_mut(bh)
            .unwrap_or_else(|| unreachable!());
        block.phase = CmdPhase::Active;
        block.dispatched = true;
        let function = block.function;
        let snapshot = block.snapshot(CmdRef::new(bus.id, bh));
        if flags.freeze_on_dispatch {
            self.apply_freeze(core, dh, RunLevel::URGENT, 1);
        }
        self.seat_dispatch_if_ready(core, dh);
        self.trace.record(TraceEvent::Dispatched {
            addr,
            function,
            priority: block_prio,
        });
        if function == Function::ResetDevice {
            self.trace.record(TraceEvent::DeviceReset { addr });
        }
        DispatchStep::Submit {
            sim: bus.sim.clone(),
            request: SimRequest::Execute(snapshot),
        }
    }

    // ==================== Seat helpers ====================

    /// Seat the device on the allocation queue if it has waiters, credit,
    /// and no gating freeze. Returns true when the seat is new.
    pub(crate) fn seat_alloc_if_ready(&self, core: &mut BusCore, dh: Handle<Device>) -> bool {
        let Some(dev) = core.devices.get(dh) else {
            return false;
        };
        if dev.alloc_seat != UNQUEUED {
            return false;
        }
        let Some(head) = dev.waiters.head_priority() else {
            return false;
        };
        if dev.alloc_credit.available() == 0 || dev.frozen_for(head) {
            return false;
        }
        core.alloc_queue.insert(&mut core.devices, dh, head);
        true
    }

    /// Dispatch-side counterpart of [`Topology::seat_alloc_if_ready`].
    pub(crate) fn seat_dispatch_if_ready(&self, core: &mut BusCore, dh: Handle<Device>) -> bool {
        let Some(dev) = core.devices.get(dh) else {
            return false;
        };
        if dev.dispatch_seat != UNQUEUED {
            return false;
        }
        let Some(head) = dev.pending.head_priority() else {
            return false;
        };
        if dev.send_credit.available() == 0 || dev.frozen_for(head) {
            return false;
        }
        core.dispatch_queue.insert(&mut core.devices, dh, head);
        true
    }

    /// Add freeze counts and unseat the device from any queue whose seated
    /// work the freeze now gates.
    fn apply_freeze(&self, core: &mut BusCore, dh: Handle<Device>, level: RunLevel, count: u32) -> u32 {
        let dev = core
            .devices
            .get_mut(dh)
            .unwrap_or_else(|| panic!("freeze on stale device handle"));
        let new = dev.freeze.freeze(level, count);
        let alloc_seat = dev.alloc_seat;
        let dispatch_seat = dev.dispatch_seat;
        let unseat_alloc =
            alloc_seat != UNQUEUED && dev.frozen_for(core.alloc_queue.priority_at(alloc_seat));
        let unseat_dispatch = dispatch_seat != UNQUEUED
            && dev.frozen_for(core.dispatch_queue.priority_at(dispatch_seat));
        if unseat_alloc {
            core.alloc_queue.remove(&mut core.devices, dh);
        }
        if unseat_dispatch {
            core.dispatch_queue.remove(&mut core.devices, dh);
        }
        new
    }

    /// Release freeze counts (zero is a no-op used by deferred arming) and
    /// re-seat the device wherever it is now eligible. Cancels an armed
    /// deferred release when the level fully thaws.
    fn apply_release(&self, core: &mut BusCore, dh: Handle<Device>, level: RunLevel, count: u32) -> u32 {
        let dev = core
            .devices
            .get_mut(dh)
            .unwrap_or_else(|| panic!("release on stale device handle"));
        let remaining = if count > 0 {
            let remaining = dev.freeze.release(level, count);
            self.trace.record(TraceEvent::DeviceThawed {
                addr: dev.addr,
                level: level.index() as u8,
                remaining,
            });
            remaining
        } else {
            dev.freeze.count_at(level)
        };
        if remaining == 0 {
            if let Some(def) = &dev.deferred {
                if def.level == level {
                    dev.deferred = None;
                    dev.deferred_epoch += 1;
                }
            }
        }
        self.seat_alloc_if_ready(core, dh);
        self.seat_dispatch_if_ready(core, dh);
        remaining
    }
}
