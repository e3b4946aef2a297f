//! Graph algorithms over the relay network

pub mod topology;

pub use topology::TopologyAnalyzer;
