//! Relay Graph Localization
//!
//! Locates mobile sensors on a graph of stationary relays using nothing but
//! received signal strengths. Observations are buffered per sensor and
//! positions are back-filled once surrounding relay contacts make them
//! unambiguous.

pub mod core;
pub mod algorithms;
pub mod processing;
pub mod validation;
pub mod utils;
pub mod api;

// Re-export commonly used types
pub use core::{Direction, NodeId, NodeKind, Package, Position, Relay, RendezVous, WirelessContact};
pub use algorithms::TopologyAnalyzer;
pub use processing::{Epoch, EpochOutcome, EpochType, Locator, ParseError, Sensor};
pub use validation::{LocatorError, LocatorResult};
pub use utils::{ConfigError, LocatorConfig};
pub use api::{JsonFormatter, OutputFormat, PackageRecord, TextFormatter};
