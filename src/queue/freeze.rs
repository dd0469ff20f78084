//! Run levels and per-level freeze counters.
//!
//! Priorities are numeric, lower runs first, and the high bits select one
//! of four run levels. Freezing at a level blocks that level and everything
//! below it (higher numeric levels), so urgent work keeps flowing while
//! normal traffic is gated: a freeze at `RunLevel::BUS` stops bus-level and
//! weaker work but recovery commands at `RunLevel::URGENT` still run.
//!
//! Freeze counts nest. Each freeze must be matched by a release at the same
//! level; release clamps at zero rather than underflowing, since a stray
//! extra release is a caller bug we survive rather than propagate.

use serde::{Deserialize, Serialize};

/// Number of distinct run levels.
pub const RUN_LEVELS: usize = 4;

/// Scheduling priorities, lowest value first. The high byte places a
/// priority in its run level; the low byte orders work within the level.
pub mod priority {
    /// Recovery work that must run even while the device is gated.
    pub const URGENT: u32 = 0x080;
    /// Bus-wide maintenance.
    pub const BUS: u32 = 0x180;
    /// Device bring-up and re-probe traffic.
    pub const RECOVERY: u32 = 0x280;
    /// Ordinary transfer traffic.
    pub const NORMAL: u32 = 0x380;
    /// Sentinel for "not scheduled".
    pub const NONE: u32 = u32::MAX;
}

/// One of the four gate levels derived from a priority.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunLevel(u8);

impl RunLevel {
    pub const URGENT: RunLevel = RunLevel(0);
    pub const BUS: RunLevel = RunLevel(1);
    pub const RECOVERY: RunLevel = RunLevel(2);
    pub const NORMAL: RunLevel = RunLevel(3);

    /// Map a priority to its run level. Priorities past the normal band
    /// clamp to `NORMAL`.
    pub fn of_priority(priority: u32) -> RunLevel {
        RunLevel((priority >> 8).min(RUN_LEVELS as u32 - 1) as u8)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(index: usize) -> RunLevel {
        assert!(index < RUN_LEVELS, "run level index {index} out of range");
        RunLevel(index as u8)
    }
}

/// Freeze counters, one per run level.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeLevels {
    counts: [u32; RUN_LEVELS],
}

impl FreezeLevels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` freezes at `level`; returns the level's new count.
    pub fn freeze(&mut self, level: RunLevel, count: u32) -> u32 {
        let slot = &mut self.counts[level.index()];
        *slot = slot
            .checked_add(count)
            .unwrap_or_else(|| panic!("freeze count overflow at level {}", level.index()));
        *slot
    }

    /// Drop up to `count` freezes at `level`; returns the level's new
    /// count. Releasing more than is held clamps at zero.
    pub fn release(&mut self, level: RunLevel, count: u32) -> u32 {
        let slot = &mut self.counts[level.index()];
        if count > *slot {
            debug_assert!(false, "release of {count} exceeds held {}", *slot);
            *slot = 0;
        } else {
            *slot -= count;
        }
        *slot
    }

    /// Total freezes gating work at `level`: the sum of counts at this
    /// level and every stronger (numerically lower) level.
    pub fn frozen_through(&self, level: RunLevel) -> u32 {
        self.counts[..=level.index()].iter().sum()
    }

    /// Sum across all levels.
    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }

    pub fn count_at(&self, level: RunLevel) -> u32 {
        self.counts[level.index()]
    }

    pub fn counts(&self) -> [u32; RUN_LEVELS] {
        self.counts
    }
}
