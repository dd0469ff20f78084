//! Topology tuning knobs.
//!
//! Configuration is plain data, validated once when the topology opens.
//! Validation panics rather than returning an error: a bad config is a
//! deployment bug, not a runtime condition.

use serde::{Deserialize, Serialize};

use crate::topology::PathSpec;

/// Tuning for one [`crate::topology::Topology`] instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Upper bound on registered buses.
    pub max_buses: u32,
    /// System-wide concurrent high-power command limit.
    pub high_power_slots: u32,
    /// Command-block pool cap per bus; `0` sizes the pool to the
    /// controller's reported openings.
    pub max_blocks_per_bus: u32,
    /// Per-device opening count used when a device is created; `0` takes
    /// the controller's reported per-device default.
    pub default_device_openings: u32,
    /// Per-address opening overrides applied over the default. Addresses
    /// must be concrete.
    pub device_opening_overrides: Vec<(PathSpec, u32)>,
    /// Entries retained by the in-memory trace ring; `0` disables tracing.
    pub trace_capacity: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            max_buses: 64,
            high_power_slots: 4,
            max_blocks_per_bus: 0,
            default_device_openings: 0,
            device_opening_overrides: Vec::new(),
            trace_capacity: 256,
        }
    }
}

impl TopologyConfig {
    /// Panics when a field is out of range. Called by
    /// `Topology::open`; exposed so embedders can validate early.
    pub fn validate(&self) {
        assert!(self.max_buses >= 1, "max_buses must be at least 1");
        assert!(
            self.high_power_slots >= 1,
            "high_power_slots must be at least 1"
        );
        for (addr, openings) in &self.device_opening_overrides {
            assert!(
                addr.is_concrete(),
                "opening override address must be concrete, got {addr}"
            );
            assert!(
                *openings >= 1,
                "opening override for {addr} must be at least 1"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{BusId, LunId, TargetId};

    #[test]
    fn default_config_validates() {
        TopologyConfig::default().validate();
    }

    #[test]
    fn config_round_trips_through_serde() {
        let mut config = TopologyConfig::default();
        config
            .device_opening_overrides
            .push((PathSpec::new(BusId(0), TargetId(1), LunId(0)), 8));
        let json = serde_json::to_string(&config).unwrap();
        let back: TopologyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.device_opening_overrides.len(), 1);
        assert_eq!(back.max_buses, config.max_buses);
    }

    #[test]
    #[should_panic(expected = "max_buses must be at least 1")]
    fn zero_buses_rejected() {
        let config = TopologyConfig {
            max_buses: 0,
            ..TopologyConfig::default()
        };
        config.validate();
    }

    #[test]
    #[should_panic(expected = "high_power_slots must be at least 1")]
    fn zero_high_power_slots_rejected() {
        let config = TopologyConfig {
            high_power_slots: 0,
            ..TopologyConfig::default()
        };
        config.validate();
    }

    #[test]
    #[should_panic(expected = "must be concrete")]
    fn wildcard_override_rejected() {
        let config = TopologyConfig {
            device_opening_overrides: vec![(PathSpec::wildcard(), 4)],
            ..TopologyConfig::default()
        };
        config.validate();
    }
}
