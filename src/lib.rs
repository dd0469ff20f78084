//! Device-topology registry and command-scheduling core.
//!
//! ## Scope
//! This crate keeps a reference-counted Bus → Target → Device → Peripheral
//! registry, schedules command blocks through per-bus priority queues with
//! freeze/credit gating, broadcasts topology change events to subscribers,
//! and answers resumable pattern-matched enumeration queries. Controllers
//! plug in behind the [`boundary::SimPort`] trait; command owners behind
//! [`boundary::PeriphOps`].
//!
//! ## Key invariants
//! - Nodes are destroyed only at refcount zero with an empty child list;
//!   every structural list change bumps that list's generation counter.
//! - Command blocks are credited against a device pool and a controller
//!   pool and must be returned exactly once; shrinking a pool books debt
//!   instead of going negative.
//! - Freezes nest per run level; a frozen device leaves the ready queues
//!   and returns only on release.
//! - Equal priorities drain FIFO; lower numeric priority is more urgent.
//! - All outward calls (controller submit, peripheral start/done,
//!   subscriber callbacks) run with no engine locks held.
//!
//! ## Command flow
//! `schedule -> allocation queue -> start -> submit_io -> dispatch queue ->
//! SimPort::submit -> done queue -> drain_completions -> done ->
//! release_cmd`
//!
//! ## Notable entry points
//! - [`Topology::open`] / [`Topology::close`]: engine lifecycle.
//! - `register_bus`, `compile_path`, `attach_periph`: building a topology.
//! - `schedule`, `submit_io`, `complete`, `abort`: the command lifecycle.
//! - `freeze_device` / `release_device_queue`: error-recovery gating.
//! - `subscribe` / `publish`: the async event bus.
//! - `match_query`: paginated enumeration for management tools.

#![allow(dead_code)] // Public API surface is intentionally broader than internal use.

pub mod boundary;
pub mod cmd;
pub mod config;
pub mod errors;
pub mod notify;
pub mod query;
pub mod queue;
pub mod stdx;
#[cfg(test)]
pub mod test_utils;
pub mod topology;
pub mod trace;

pub use boundary::{AsyncSubscriber, PeriphOps, SimInfo, SimPort, SimRequest};
pub use cmd::{
    AbortOutcome, CmdFlags, CmdRef, CmdSnapshot, CmdStatus, CompletionCode, Function, IoSpec,
};
pub use config::TopologyConfig;
pub use errors::XptError;
pub use notify::{AsyncEvent, EventMask};
pub use query::{
    BusPattern, BusRecord, DevicePattern, DeviceRecord, MatchPatterns, MatchRecord, MatchReply,
    MatchStatus, PeriphPattern, PeriphRecord, PositionCookie,
};
pub use queue::{priority, EngineQueue, ReleasePolicy, RunLevel};
pub use topology::{
    BusId, BusStats, DeviceIdent, DeviceStats, LunId, Path, PathSpec, PeriphRef, TargetId,
    Topology, TopologyStats,
};
pub use trace::{TraceEvent, TraceRing};
