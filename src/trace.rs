//! Bounded in-memory event trace.
//!
//! Every externally significant transition records one [`TraceEvent`] into
//! a ring sized by `TopologyConfig::trace_capacity` (zero disables the ring
//! and turns `record` into a no-op). The ring keeps the newest entries.
//!
//! Two consumers: tests assert on drained event sequences, and
//! [`TraceRing::fold_hash`] folds the live contents into a single value so
//! two runs of the same workload can be compared without storing both
//! traces.

use std::collections::VecDeque;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::cmd::{CompletionCode, Function};
use crate::topology::{BusId, PathSpec, TargetId};

/// One recorded transition. Addresses are concrete except where an
/// operation is inherently bus-wide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TraceEvent {
    BusRegistered { bus: BusId, sim_name: String },
    BusDeregistered { bus: BusId },
    TargetCreated { bus: BusId, target: TargetId },
    TargetDestroyed { bus: BusId, target: TargetId },
    DeviceCreated { addr: PathSpec },
    DeviceDestroyed { addr: PathSpec },
    PeriphAttached { addr: PathSpec, name: String, unit: u32 },
    PeriphDetached { addr: PathSpec, name: String, unit: u32 },
    Scheduled { addr: PathSpec, priority: u32 },
    BlockAllocated { addr: PathSpec, priority: u32 },
    BlockQueued { addr: PathSpec, priority: u32 },
    Dispatched { addr: PathSpec, function: Function, priority: u32 },
    HighPowerGranted { addr: PathSpec },
    HighPowerParked { addr: PathSpec },
    Completed { addr: PathSpec, code: CompletionCode },
    BlockReleased { addr: PathSpec },
    Aborted { addr: PathSpec, queued: bool },
    OrphanCompletion { addr: PathSpec },
    DeviceFrozen { addr: PathSpec, level: u8, count: u32 },
    DeviceThawed { addr: PathSpec, level: u8, remaining: u32 },
    ControllerFrozen { bus: BusId, level: u8, count: u32 },
    ControllerThawed { bus: BusId, level: u8, remaining: u32 },
    PoolExhausted { bus: BusId },
    TimerArmed { addr: PathSpec, deadline: u64 },
    TimerFired { addr: PathSpec },
    Published { event: String },
    BusReset { bus: BusId },
    DeviceReset { addr: PathSpec },
    MatchPage { copied: u32, more: bool },
}

/// Fixed-capacity event ring; oldest entries fall off the front.
pub struct TraceRing {
    capacity: usize,
    events: Mutex<VecDeque<TraceEvent>>,
}

impl TraceRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub(crate) fn record(&self, event: TraceEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drain the ring, oldest first.
    pub fn take(&self) -> Vec<TraceEvent> {
        self.lock().drain(..).collect()
    }

    /// Copy the ring without draining it.
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Order-sensitive hash of the current contents. Seeded with fixed
    /// keys so equal traces hash equal across processes.
    pub fn fold_hash(&self) -> u64 {
        let events = self.lock();
        let mut hasher = ahash::RandomState::with_seeds(
            0x7470_7800,
            0x7472_6163,
            0x6530_0000,
            events.len() as u64,
        )
        .build_hasher();
        for event in events.iter() {
            event.hash(&mut hasher);
        }
        hasher.finish()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TraceEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
