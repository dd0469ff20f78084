//! Trait seams between the topology core and its embedders.
//!
//! Three parties plug in here. A [`SimPort`] is one controller: it reports
//! its limits at registration and accepts dispatched work. [`PeriphOps`] is
//! the owner of queued commands: it is offered blocks when the allocation
//! queue grants its requests and told when they complete. An
//! [`AsyncSubscriber`] observes topology change events.
//!
//! All hooks are invoked with no internal locks held, so implementations
//! may call back into the [`Topology`] freely (submit, complete, schedule
//! more work). The one thing they must not do is block indefinitely; every
//! hook runs on the caller's thread.

use crate::cmd::{CmdRef, CmdSnapshot, CmdStatus};
use crate::notify::AsyncEvent;
use crate::topology::{BusId, Topology};

/// Limits and identity one controller reports when registering.
#[derive(Clone, Debug)]
pub struct SimInfo {
    /// Driver name; used in bus match records.
    pub sim_name: String,
    /// Instance number of the driver.
    pub unit: u32,
    /// Highest addressable target id on this bus.
    pub max_target: u32,
    /// Highest addressable lun under any target.
    pub max_lun: u32,
    /// Commands the controller can hold concurrently.
    pub controller_openings: u32,
    /// Default per-device opening count.
    pub device_openings: u32,
}

/// Work handed to a controller port.
#[derive(Debug)]
pub enum SimRequest {
    /// Execute a dispatched block; report through `Topology::done`.
    Execute(CmdSnapshot),
    /// Try to abort a block previously handed over. Completion still
    /// arrives through `Topology::done`.
    Abort { cmd: CmdRef },
    /// Reset the whole bus. The topology has already done its own
    /// bookkeeping; the port performs the physical reset.
    ResetBus { bus: BusId },
}

/// One controller attachment point.
pub trait SimPort: Send + Sync {
    /// Called once during bus registration.
    fn info(&self) -> SimInfo;

    /// Accept a request. Called without locks; `Topology::done` may be
    /// called from inside (immediate completion) or later from any thread.
    fn submit(&self, xpt: &Topology, request: SimRequest);
}

/// Command owner callbacks for one peripheral instance.
pub trait PeriphOps: Send + Sync {
    /// A block was allocated against an earlier `schedule` call. The owner
    /// fills it in and calls `Topology::submit_io`, or hands it back with
    /// `Topology::release_cmd` if the work evaporated.
    fn start(&self, xpt: &Topology, cmd: CmdRef);

    /// A block completed. Runs after completion accounting; the owner
    /// inspects the status and must eventually release the block.
    fn done(&self, xpt: &Topology, cmd: CmdRef, status: CmdStatus);
}

/// Receiver for topology change events.
pub trait AsyncSubscriber: Send + Sync {
    fn on_event(&self, event: &AsyncEvent);
}
