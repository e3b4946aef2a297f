//! Error classification for the localization core

use thiserror::Error;

use crate::core::NodeId;

/// Failures raised by the topology, epoch and locator layers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocatorError {
    #[error("epoch has no packages")]
    EmptyEpoch,

    #[error("travelled distance not set before interpolating positions")]
    DistanceNotSet,

    #[error("node {0} is not a known relay")]
    NotFound(NodeId),

    #[error("no path between relay {from} and relay {to}")]
    NoPath { from: NodeId, to: NodeId },

    #[error("edge {edge_start}-{edge_end} is not part of the route {start}-{end}")]
    NoSuchEdgeInRoute {
        edge_start: NodeId,
        edge_end: NodeId,
        start: NodeId,
        end: NodeId,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("id {0} belongs to the sensor range, not a relay")]
    NotARelay(NodeId),

    #[error("id {0} belongs to the relay range, not a sensor")]
    NotASensor(NodeId),

    #[error("invalid edge {start}-{end} with weight {weight}")]
    InvalidEdge { start: NodeId, end: NodeId, weight: f64 },
}

impl LocatorError {
    /// Graph lookups that may succeed once more data has arrived
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LocatorError::NotFound(_) | LocatorError::NoPath { .. })
    }
}

pub type LocatorResult<T> = Result<T, LocatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(LocatorError::NotFound(1005).is_recoverable());
        assert!(LocatorError::NoPath { from: 1001, to: 1005 }.is_recoverable());
        assert!(!LocatorError::EmptyEpoch.is_recoverable());
        assert!(!LocatorError::InvariantViolation("x".into()).is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = LocatorError::NoPath { from: 1001, to: 1005 };
        assert_eq!(err.to_string(), "no path between relay 1001 and relay 1005");
        assert_eq!(LocatorError::NotASensor(1001).to_string(), "id 1001 belongs to the relay range, not a sensor");
    }
}
