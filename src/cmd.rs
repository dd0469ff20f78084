//! Command blocks and their completion vocabulary.
//!
//! A [`CommandBlock`] is the unit of queued work. It is born when the
//! allocation queue grants a peripheral's request, filled in and queued by
//! `submit_io`, handed to the controller port by the dispatch queue, and
//! finally reported done and released. Blocks live in a per-bus arena;
//! callers hold a [`CmdRef`] (bus id plus handle) and never the block
//! itself.
//!
//! The block's seat index is the only record of whether it sits on its
//! device's dispatch queue. Everything else about lifecycle lives in
//! [`CmdPhase`], which deliberately has no "queued" state so the two can
//! never disagree.

use serde::{Deserialize, Serialize};

use crate::stdx::arena::Handle;
use crate::stdx::ready_queue::{ReadySlot, UNQUEUED};
use crate::topology::nodes::{Device, Periph};
use crate::topology::{BusId, PathSpec};

/// What the block asks the controller to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Function {
    /// Ordinary device I/O.
    DeviceIo,
    /// Reset one device.
    ResetDevice,
}

/// Per-block scheduling options, set at submit time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdFlags {
    /// Dispatch only while a global high-power slot is free.
    pub high_power: bool,
    /// Freeze the device queue as the block leaves for the controller.
    pub freeze_on_dispatch: bool,
    /// On completion with the device-frozen marker set, release one freeze
    /// instead of leaving it for the peripheral's recovery logic.
    pub auto_thaw: bool,
}

/// How a completed block ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CompletionCode {
    /// Not completed yet; the initial state.
    InProgress,
    Ok,
    /// The controller bounced the block; the owner may resubmit.
    Requeue,
    Aborted,
    CmdTimeout,
    SelectionTimeout,
    TransportError,
    /// Selection says nothing is at this address.
    DeviceNotThere,
}

/// Completion status: a code plus out-of-band markers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CmdStatus {
    pub code: CompletionCode,
    /// The device queue was frozen on the block's behalf; whoever consumes
    /// the status owns releasing that freeze.
    pub device_frozen: bool,
    /// Release one controller-level dispatch freeze when this completion
    /// is processed.
    pub release_controller: bool,
}

impl CmdStatus {
    pub const fn new(code: CompletionCode) -> Self {
        Self {
            code,
            device_frozen: false,
            release_controller: false,
        }
    }

    pub const fn ok() -> Self {
        Self::new(CompletionCode::Ok)
    }

    pub const fn in_progress() -> Self {
        Self::new(CompletionCode::InProgress)
    }

    pub const fn with_device_frozen(mut self) -> Self {
        self.device_frozen = true;
        self
    }

    pub const fn with_release_controller(mut self) -> Self {
        self.release_controller = true;
        self
    }
}

/// Parameters for `Topology::submit_io`.
#[derive(Copy, Clone, Debug)]
pub struct IoSpec {
    pub function: Function,
    pub flags: CmdFlags,
    /// Opaque correlation value echoed back in the dispatch snapshot.
    pub user_data: u64,
}

impl IoSpec {
    pub fn device_io() -> Self {
        Self {
            function: Function::DeviceIo,
            flags: CmdFlags::default(),
            user_data: 0,
        }
    }
}

/// Outcome of an abort request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The block was still queued; it was pulled and completed as aborted
    /// with the device-frozen marker.
    AbortedFromQueue,
    /// The block was allocated but not yet queued; it is flagged and will
    /// complete as aborted when its owner submits it.
    Flagged,
    /// The block is at the controller; the abort was forwarded there.
    Delegated,
    /// Already completed; nothing to do.
    AlreadyDone,
}

/// Bus id plus block handle; the caller-side name for one block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CmdRef {
    pub bus: BusId,
    pub(crate) block: Handle<CommandBlock>,
}

impl CmdRef {
    pub(crate) fn new(bus: BusId, block: Handle<CommandBlock>) -> Self {
        Self { bus, block }
    }
}

/// Everything a controller port needs to execute a block. Plain data; the
/// port must not reach back into topology state from its submit hook.
#[derive(Clone, Debug)]
pub struct CmdSnapshot {
    pub cmd: CmdRef,
    pub addr: PathSpec,
    pub function: Function,
    pub priority: u32,
    pub flags: CmdFlags,
    pub user_data: u64,
}

/// Lifecycle stages that the seat index does not already encode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CmdPhase {
    /// With its owner or on the device queue; the seat distinguishes.
    Owned,
    /// At the controller.
    Active,
    /// Completed (possibly still waiting in the done queue).
    Done,
}

pub(crate) enum BlockSeat {}

/// One queued command. Internal to the per-bus state; see [`CmdRef`].
#[derive(Debug)]
pub struct CommandBlock {
    pub(crate) seat: u32,
    pub(crate) owner: Option<Handle<Periph>>,
    pub(crate) device: Handle<Device>,
    pub(crate) addr: PathSpec,
    pub(crate) priority: u32,
    pub(crate) function: Function,
    pub(crate) flags: CmdFlags,
    pub(crate) status: CmdStatus,
    pub(crate) phase: CmdPhase,
    pub(crate) user_data: u64,
    /// Holds one of the global high-power slots.
    pub(crate) hp_slot: bool,
    /// Waiting on the high-power FIFO while still queued.
    pub(crate) hp_parked: bool,
    /// Abort arrived before the owner submitted the block.
    pub(crate) abort_requested: bool,
    /// The dispatch queue handed this block to the controller at least
    /// once; completion accounting returns send credits only if set.
    pub(crate) dispatched: bool,
}

impl CommandBlock {
    pub(crate) fn new(
        device: Handle<Device>,
        owner: Handle<Periph>,
        addr: PathSpec,
        priority: u32,
    ) -> Self {
        Self {
            seat: UNQUEUED,
            owner: Some(owner),
            device,
            addr,
            priority,
            function: Function::DeviceIo,
            flags: CmdFlags::default(),
            status: CmdStatus::in_progress(),
            phase: CmdPhase::Owned,
            user_data: 0,
            hp_slot: false,
            hp_parked: false,
            abort_requested: false,
            dispatched: false,
        }
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.seat != UNQUEUED
    }

    pub(crate) fn snapshot(&self, cmd: CmdRef) -> CmdSnapshot {
        CmdSnapshot {
            cmd,
            addr: self.addr,
            function: self.function,
            priority: self.priority,
            flags: self.flags,
            user_data: self.user_data,
        }
    }
}

impl ReadySlot<BlockSeat> for CommandBlock {
    fn seat(&self) -> u32 {
        self.seat
    }
    fn set_seat(&mut self, seat: u32) {
        self.seat = seat;
    }
}

impl Default for IoSpec {
    fn default() -> Self {
        Self::device_io()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_builders_set_markers() {
        let status = CmdStatus::new(CompletionCode::Requeue)
            .with_device_frozen()
            .with_release_controller();
        assert_eq!(status.code, CompletionCode::Requeue);
        assert!(status.device_frozen);
        assert!(status.release_controller);

        let plain = CmdStatus::ok();
        assert!(!plain.device_frozen);
        assert!(!plain.release_controller);
    }

    #[test]
    fn fresh_status_is_in_progress() {
        assert_eq!(CmdStatus::in_progress().code, CompletionCode::InProgress);
    }

    #[test]
    fn status_round_trips_through_serde() {
        let status = CmdStatus::new(CompletionCode::SelectionTimeout).with_device_frozen();
        let json = serde_json::to_string(&status).unwrap();
        let back: CmdStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
