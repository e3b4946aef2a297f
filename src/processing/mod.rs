//! Epoch bookkeeping, the locator and input parsing

pub mod epoch;
pub mod locator;
pub mod parser;
pub mod sensor;

pub use epoch::{Epoch, EpochType};
pub use locator::{EpochOutcome, Locator};
pub use parser::{is_balanced, parse_package_line, parse_packages, parse_topology, ParseError};
pub use sensor::Sensor;
