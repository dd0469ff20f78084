//! Addresses and compiled paths.
//!
//! A [`PathSpec`] is a plain bus/target/lun triple where each level may be
//! the wildcard; it names a position without pinning anything. A [`Path`]
//! is the compiled form: it holds counted references on the nodes it
//! resolved and must be handed back through `Topology::release_path`.
//! Dropping a `Path` without releasing it leaks those references (the node
//! lingers until `close` reports it), which is why the type is
//! `#[must_use]`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stdx::arena::Handle;
use crate::topology::nodes::{Device, Target};

/// Bus address, assigned at registration. Wildcard selects every bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusId(pub u32);

/// Target address within a bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(pub u32);

/// Logical unit address within a target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LunId(pub u32);

impl BusId {
    pub const WILDCARD: BusId = BusId(u32::MAX);

    pub fn is_wildcard(self) -> bool {
        self == Self::WILDCARD
    }
}

impl TargetId {
    pub const WILDCARD: TargetId = TargetId(u32::MAX);

    pub fn is_wildcard(self) -> bool {
        self == Self::WILDCARD
    }
}

impl LunId {
    pub const WILDCARD: LunId = LunId(u32::MAX);

    pub fn is_wildcard(self) -> bool {
        self == Self::WILDCARD
    }
}

/// A bus/target/lun triple, any level of which may be wildcarded.
///
/// Used both as a lookup key (path compilation, subscriptions, opening
/// overrides) and as the address stamped on events, trace entries, and
/// match records.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSpec {
    pub bus: BusId,
    pub target: TargetId,
    pub lun: LunId,
}

impl PathSpec {
    pub const fn new(bus: BusId, target: TargetId, lun: LunId) -> Self {
        Self { bus, target, lun }
    }

    /// Every level wildcarded; matches the whole topology.
    pub const fn wildcard() -> Self {
        Self::new(BusId::WILDCARD, TargetId::WILDCARD, LunId::WILDCARD)
    }

    /// Every level of the given bus.
    pub const fn bus_wide(bus: BusId) -> Self {
        Self::new(bus, TargetId::WILDCARD, LunId::WILDCARD)
    }

    pub fn is_fully_wild(&self) -> bool {
        self.bus.is_wildcard() && self.target.is_wildcard() && self.lun.is_wildcard()
    }

    pub fn is_concrete(&self) -> bool {
        !self.bus.is_wildcard() && !self.target.is_wildcard() && !self.lun.is_wildcard()
    }

    /// True when `self` names a position covered by `other` once wildcards
    /// are taken into account. Comparison is per level; a wildcard on
    /// either side matches that level.
    pub fn overlaps(&self, other: &PathSpec) -> bool {
        (self.bus.is_wildcard() || other.bus.is_wildcard() || self.bus == other.bus)
            && (self.target.is_wildcard()
                || other.target.is_wildcard()
                || self.target == other.target)
            && (self.lun.is_wildcard() || other.lun.is_wildcard() || self.lun == other.lun)
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn level(f: &mut fmt::Formatter<'_>, id: u32) -> fmt::Result {
            if id == u32::MAX {
                write!(f, "*")
            } else {
                write!(f, "{id}")
            }
        }
        level(f, self.bus.0)?;
        write!(f, ":")?;
        level(f, self.target.0)?;
        write!(f, ":")?;
        level(f, self.lun.0)
    }
}

/// Identity reported for a device once a caller announces it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdent {
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl DeviceIdent {
    pub fn new(vendor: &str, product: &str, revision: &str) -> Self {
        Self {
            vendor: vendor.to_owned(),
            product: product.to_owned(),
            revision: revision.to_owned(),
        }
    }
}

/// A compiled path: owned references on each level it resolved.
///
/// Wildcard levels resolve to nothing and pin nothing; a fully wild spec
/// compiles to a path holding only a bus reference when the bus level is
/// concrete, or nothing at all otherwise. Release through
/// `Topology::release_path`; there is no `Drop` glue, so a forgotten path
/// keeps its nodes alive until `close` flags the leak.
#[must_use = "paths hold node references; hand them back through release_path"]
#[derive(Debug)]
pub struct Path {
    pub(crate) spec: PathSpec,
    pub(crate) target: Option<Handle<Target>>,
    pub(crate) device: Option<Handle<Device>>,
}

impl Path {
    /// The triple this path was compiled from.
    pub fn spec(&self) -> PathSpec {
        self.spec
    }

    pub fn bus_id(&self) -> BusId {
        self.spec.bus
    }

    /// True when the path pins a concrete device node.
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_display_uses_star() {
        let spec = PathSpec::new(BusId(3), TargetId::WILDCARD, LunId(0));
        assert_eq!(spec.to_string(), "3:*:0");
        assert_eq!(PathSpec::wildcard().to_string(), "*:*:*");
    }

    #[test]
    fn overlap_is_per_level() {
        let concrete = PathSpec::new(BusId(0), TargetId(1), LunId(2));
        let bus_wide = PathSpec::bus_wide(BusId(0));
        let other_bus = PathSpec::bus_wide(BusId(1));
        assert!(concrete.overlaps(&bus_wide));
        assert!(bus_wide.overlaps(&concrete));
        assert!(!concrete.overlaps(&other_bus));
        assert!(PathSpec::wildcard().overlaps(&concrete));
    }

    #[test]
    fn shape_predicates() {
        assert!(PathSpec::wildcard().is_fully_wild());
        assert!(!PathSpec::wildcard().is_concrete());
        let concrete = PathSpec::new(BusId(0), TargetId(0), LunId(0));
        assert!(concrete.is_concrete());
        assert!(!concrete.is_fully_wild());
        let partial = PathSpec::new(BusId(0), TargetId::WILDCARD, LunId(0));
        assert!(!partial.is_concrete());
        assert!(!partial.is_fully_wild());
    }
}
