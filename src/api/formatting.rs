//! Output formatting of resolved packages
//!
//! Packages are converted into a serializable [`PackageRecord`] whose JSON
//! form mirrors the ingestion format, extended by the resolved position.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{NodeId, Package, Position, WirelessContact};

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
    Csv,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(format!("unknown output format '{}', expected json, text or csv", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub device_id: NodeId,
    pub strength: f64,
}

impl From<&WirelessContact> for ContactRecord {
    fn from(contact: &WirelessContact) -> Self {
        Self {
            device_id: contact.node_id,
            strength: contact.strength,
        }
    }
}

/// Location on the graph; `start` is absent for unanchored positions and
/// `totalDistance` when the route length is unknown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecord {
    pub start: Option<NodeId>,
    pub destination: NodeId,
    pub distance_traveled: f64,
    pub total_distance: Option<f64>,
}

impl From<&Position> for PositionRecord {
    fn from(position: &Position) -> Self {
        let total = position.total_distance();
        Self {
            start: position.start(),
            destination: position.dest(),
            distance_traveled: position.offset(),
            total_distance: total.is_finite().then_some(total),
        }
    }
}

/// Serializable view of a package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRecord {
    pub device_id: NodeId,
    pub timestamp: u64,
    pub contacts: Vec<ContactRecord>,
    pub position: Option<PositionRecord>,
}

impl From<&Package> for PackageRecord {
    fn from(package: &Package) -> Self {
        Self {
            device_id: package.sensor_id,
            timestamp: package.timestamp,
            contacts: package.contacts().iter().map(ContactRecord::from).collect(),
            position: package.position().map(PositionRecord::from),
        }
    }
}

impl fmt::Display for PositionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.total_distance) {
            (Some(start), Some(total)) => write!(
                f,
                "{:.2} of {:.2} from {} to {}",
                self.distance_traveled, total, start, self.destination
            ),
            (Some(start), None) => write!(f, "between {} and {}", start, self.destination),
            (None, _) => write!(f, "heading to {}", self.destination),
        }
    }
}

/// Human-readable text formatter
#[derive(Debug, Default)]
pub struct TextFormatter {
    /// One line per package
    pub compact: bool,
}

impl TextFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compact() -> Self {
        Self { compact: true }
    }

    pub fn format_text(&self, record: &PackageRecord) -> String {
        let position = record
            .position
            .as_ref()
            .map_or_else(|| "unknown".to_string(), PositionRecord::to_string);

        if self.compact {
            return format!("[{}] sensor {}: {}", record.timestamp, record.device_id, position);
        }

        let mut output = String::new();
        output.push_str(&format!("Sensor {} at {}\n", record.device_id, record.timestamp));
        output.push_str(&format!("  Position: {}\n", position));
        if !record.contacts.is_empty() {
            output.push_str("  Contacts:\n");
            for contact in &record.contacts {
                output.push_str(&format!("    {} ({:.2})\n", contact.device_id, contact.strength));
            }
        }
        output
    }
}

/// JSON formatter for structured output
#[derive(Debug, Default)]
pub struct JsonFormatter {
    /// Pretty print JSON
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    pub fn format_json(&self, record: &PackageRecord) -> Result<String, serde_json::Error> {
        if self.pretty {
            serde_json::to_string_pretty(record)
        } else {
            serde_json::to_string(record)
        }
    }
}

/// CSV formatter for data logging
#[derive(Debug)]
pub struct CsvFormatter {
    /// Emit the header before the first row
    pub include_header: bool,
}

impl Default for CsvFormatter {
    fn default() -> Self {
        Self { include_header: true }
    }
}

impl CsvFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> String {
        "device_id,timestamp,start,destination,distance_traveled,total_distance".to_string()
    }

    pub fn format_csv(&self, record: &PackageRecord) -> String {
        let Some(position) = &record.position else {
            return format!("{},{},,,,", record.device_id, record.timestamp);
        };
        let optional = |v: Option<String>| v.unwrap_or_default();
        format!(
            "{},{},{},{},{:.6},{}",
            record.device_id,
            record.timestamp,
            optional(position.start.map(|s| s.to_string())),
            position.destination,
            position.distance_traveled,
            optional(position.total_distance.map(|t| format!("{:.6}", t)))
        )
    }
}
