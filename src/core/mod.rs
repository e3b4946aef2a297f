//! Core types and constants for relay-graph localization

pub mod types;
pub mod constants;

pub use types::*;
pub use constants::*;
