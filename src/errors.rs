//! Error types for topology and scheduling operations.
//!
//! One crate-level enum covers the caller-visible taxonomy. Enumeration
//! consistency ("list changed") is a match-reply status rather than an
//! error, and a frozen queue is a completion-status marker; neither appears
//! here. The enum is `#[non_exhaustive]` so variants can be added without
//! breaking callers; consumers should include a fallback match arm.
//!
//! # Design Notes
//! - `PathInvalid` and `StaleHandle` indicate programmer error and are not
//!   worth retrying.
//! - `ResourceUnavailable` is the only recoverable variant: the caller may
//!   retry after releasing resources.
//! - Contract violations that cannot be reached through the public API
//!   (double-releasing a credit, removing a stale arena slot) panic in the
//!   data-structure layer instead of surfacing here.

use std::fmt;

use crate::topology::PathSpec;

/// Errors returned by `Topology` operations.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum XptError {
    /// A configured capacity is exhausted; retry after releasing resources.
    ResourceUnavailable { what: &'static str },
    /// The address does not resolve to a live node, or its shape is wrong
    /// for the operation (for example a concrete lun under a wildcard
    /// target).
    PathInvalid { spec: PathSpec },
    /// A handle refers to a node that no longer exists.
    StaleHandle { what: &'static str },
    /// The node or block is in the wrong lifecycle state for the operation.
    InvalidState { what: &'static str },
    /// The device exists but has not been announced (no identity yet).
    DeviceNotThere { addr: PathSpec },
}

impl fmt::Display for XptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceUnavailable { what } => {
                write!(f, "resource unavailable: {what}")
            }
            Self::PathInvalid { spec } => write!(f, "path invalid: {spec}"),
            Self::StaleHandle { what } => write!(f, "stale handle: {what}"),
            Self::InvalidState { what } => write!(f, "invalid state: {what}"),
            Self::DeviceNotThere { addr } => write!(f, "device not there: {addr}"),
        }
    }
}

impl std::error::Error for XptError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{BusId, LunId, PathSpec, TargetId};

    #[test]
    fn display_carries_the_address() {
        let err = XptError::PathInvalid {
            spec: PathSpec::new(BusId(0), TargetId(1), LunId::WILDCARD),
        };
        let text = err.to_string();
        assert!(text.contains("path invalid"), "got: {text}");
        assert!(text.contains("0:1:*"), "got: {text}");
    }

    #[test]
    fn error_trait_object_is_usable() {
        let err: Box<dyn std::error::Error> = Box::new(XptError::InvalidState {
            what: "block still queued",
        });
        assert!(err.to_string().contains("invalid state"));
        assert!(err.source().is_none());
    }
}
