//! Network-wide constants and default tuning parameters

/// Node ids below this value belong to mobile sensors, all others to fixed relays
pub const SENSOR_ID_THRESHOLD: u64 = 1000;

/// Contact radius of a relay unless the topology overrides it (√10 distance units)
pub const DEFAULT_RELAY_RADIUS: f64 = 3.162_277_660_168_379_5;

/// Signal strength above which a sensor is treated as co-located with a relay
pub const DEFAULT_MAX_SIGNAL: f64 = 0.9;

/// Tolerance applied to the co-location ceiling
pub const DEFAULT_TOLERANCE: f64 = 0.1;

/// Allowed clock skew between two sensors, in ticks
pub const TIME_TOLERANCE: u64 = 3;

/// Absolute tolerance for floating point position comparisons
pub const POSITION_EPSILON: f64 = 1e-6;
