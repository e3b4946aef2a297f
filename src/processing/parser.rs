//! JSON ingestion of packages and environment graphs
//!
//! Packages arrive either in the standard form
//! `{"deviceId": 2, "timestamp": 5, "contacts": [{"deviceId": 1001, "strength": 0.7}]}`
//! or in the compact legacy form `{"id": 2, "time": 5, "value": [1001, 0.7]}`.
//! A missing device id defaults to sensor 1.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::algorithms::TopologyAnalyzer;
use crate::core::{NodeId, Package};

/// Errors that can occur while reading packages or graphs
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("compact contact list of package at {timestamp} is invalid: {reason}")]
    InvalidCompactContacts { timestamp: u64, reason: String },

    #[error("environment graph contains no valid edge")]
    NoValidEdges,
}

const DEFAULT_DEVICE_ID: NodeId = 1;

fn default_device_id() -> NodeId {
    DEFAULT_DEVICE_ID
}

#[derive(Debug, Deserialize)]
struct ContactRecord {
    #[serde(rename = "deviceId")]
    device_id: NodeId,
    strength: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PackageRecordIn {
    Standard {
        #[serde(rename = "deviceId", default = "default_device_id")]
        device_id: NodeId,
        timestamp: u64,
        #[serde(default)]
        contacts: Vec<ContactRecord>,
    },
    Compact {
        #[serde(default = "default_device_id")]
        id: NodeId,
        time: u64,
        value: Vec<f64>,
    },
}

impl TryFrom<PackageRecordIn> for Package {
    type Error = ParseError;

    fn try_from(record: PackageRecordIn) -> Result<Self, Self::Error> {
        match record {
            PackageRecordIn::Standard {
                device_id,
                timestamp,
                contacts,
            } => Ok(contacts
                .into_iter()
                .fold(Package::new(device_id, timestamp), |p, c| p.with_contact(c.device_id, c.strength))),
            PackageRecordIn::Compact { id, time, value } => {
                let invalid = |reason: &str| ParseError::InvalidCompactContacts {
                    timestamp: time,
                    reason: reason.to_string(),
                };
                if value.len() % 2 != 0 {
                    return Err(invalid("expected alternating id and strength entries"));
                }

                let mut package = Package::new(id, time);
                for pair in value.chunks_exact(2) {
                    let (node, strength) = (pair[0], pair[1]);
                    if !node.is_finite() || node < 0.0 || node.fract() != 0.0 {
                        return Err(invalid(&format!("{} is not a device id", node)));
                    }
                    package = package.with_contact(node as NodeId, strength);
                }
                Ok(package)
            }
        }
    }
}

/// Parses a single package object
pub fn parse_package_line(line: &str) -> Result<Package, ParseError> {
    let record: PackageRecordIn = serde_json::from_str(line)?;
    Package::try_from(record)
}

/// Parses a JSON array of packages or a stream of package objects
pub fn parse_packages(text: &str) -> Result<Vec<Package>, ParseError> {
    if text.trim_start().starts_with('[') {
        let records: Vec<PackageRecordIn> = serde_json::from_str(text)?;
        return records.into_iter().map(Package::try_from).collect();
    }

    serde_json::Deserializer::from_str(text)
        .into_iter::<PackageRecordIn>()
        .map(|record| Package::try_from(record?))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EdgeRecord {
    start: NodeId,
    destination: NodeId,
    weight: f64,
    start_radius: Option<f64>,
    destination_radius: Option<f64>,
}

fn edge_objects(text: &str) -> Result<Vec<Value>, ParseError> {
    if text.trim_start().starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(text)?;
        return Ok(values
            .into_iter()
            .filter(|v| {
                let object = v.is_object();
                if !object {
                    warn!(%v, "ignoring non-object entry in environment graph");
                }
                object
            })
            .collect());
    }

    let mut objects = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !line.starts_with('{') {
            warn!(line, "skipping invalid line");
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => objects.push(value),
            Err(e) => warn!(line, error = %e, "ignoring malformed line"),
        }
    }
    Ok(objects)
}

/// Builds an environment graph from edge records.
///
/// Each record is `{"start", "destination", "weight"}` with optional
/// `startRadius` and `destinationRadius`; a radius only applies to the first
/// edge mentioning the relay. Unusable records are skipped.
pub fn parse_topology(text: &str) -> Result<TopologyAnalyzer, ParseError> {
    let mut topology = TopologyAnalyzer::new();
    let mut edges = 0usize;

    for object in edge_objects(text)? {
        let edge: EdgeRecord = match serde_json::from_value(object) {
            Ok(edge) => edge,
            Err(e) => {
                warn!(error = %e, "edge record lacks required properties, skipping");
                continue;
            }
        };

        let endpoints = [(edge.start, edge.start_radius), (edge.destination, edge.destination_radius)];
        let mut usable = true;
        for (relay, radius) in endpoints {
            if topology.contains_relay(relay) {
                continue;
            }
            let added = match radius {
                Some(r) => topology.add_relay_with_radius(relay, r),
                None => topology.add_relay(relay),
            };
            if let Err(e) = added {
                warn!(relay, error = %e, "skipping edge with invalid relay");
                usable = false;
                break;
            }
        }
        if !usable {
            continue;
        }

        match topology.add_edge(edge.start, edge.destination, edge.weight) {
            Ok(()) => edges += 1,
            Err(e) => warn!(error = %e, "skipping invalid edge"),
        }
    }

    if edges == 0 {
        return Err(ParseError::NoValidEdges);
    }
    debug!(relays = topology.relays().count(), edges, "loaded environment graph");
    Ok(topology)
}

/// True when every bracket opened outside a string literal is closed in order
pub fn is_balanced(text: &str) -> bool {
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' | '(' => open.push(c),
            '}' | ']' | ')' => {
                let expected = match c {
                    '}' => '{',
                    ']' => '[',
                    _ => '(',
                };
                if open.pop() != Some(expected) {
                    return false;
                }
            }
            _ => {}
        }
    }
    open.is_empty() && !in_string
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_package() {
        let package = parse_package_line(
            r#"{ "deviceId": 10, "timestamp": 50, "contacts": [{ "deviceId": 1001, "strength": 0.7 }, { "deviceId": 11, "strength": 0.2 }] }"#,
        )
        .unwrap();
        assert_eq!(package.sensor_id, 10);
        assert_eq!(package.timestamp, 50);
        assert_eq!(package.contacts().len(), 2);
        assert_eq!(package.strongest_relay().map(|c| c.node_id), Some(1001));
        assert!(package.position().is_none());
    }

    #[test]
    fn test_parse_compact_package() {
        let package = parse_package_line(r#"{"time": 7, "value": [1002, 0.4, 3, 0.9]}"#).unwrap();
        assert_eq!(package.sensor_id, 1);
        assert_eq!(package.timestamp, 7);
        assert_eq!(package.contact_to(1002).map(|c| c.strength), Some(0.4));
        assert_eq!(package.contact_to(3).map(|c| c.strength), Some(0.9));
    }

    #[test]
    fn test_compact_contacts_must_pair() {
        assert!(matches!(
            parse_package_line(r#"{"id": 2, "time": 7, "value": [1002, 0.4, 3]}"#),
            Err(ParseError::InvalidCompactContacts { timestamp: 7, .. })
        ));
        assert!(matches!(
            parse_package_line(r#"{"id": 2, "time": 7, "value": [1002.5, 0.4]}"#),
            Err(ParseError::InvalidCompactContacts { .. })
        ));
    }

    #[test]
    fn test_malformed_package() {
        assert!(matches!(parse_package_line("{\"deviceId\": 2"), Err(ParseError::Json(_))));
        assert!(matches!(parse_package_line(r#"{"deviceId": 2}"#), Err(ParseError::Json(_))));
    }

    #[test]
    fn test_parse_packages_array_and_stream() {
        let array = r#"[{"deviceId": 2, "timestamp": 1}, {"id": 2, "time": 2, "value": []}]"#;
        let packages = parse_packages(array).unwrap();
        assert_eq!(packages.iter().map(|p| p.timestamp).collect::<Vec<_>>(), vec![1, 2]);

        let stream = "{\"deviceId\": 2, \"timestamp\": 1}\n{\n  \"deviceId\": 3,\n  \"timestamp\": 4\n}\n";
        let packages = parse_packages(stream).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[1].sensor_id, 3);
    }

    #[test]
    fn test_parse_topology_lines() {
        let text = r#"
{"start": 1001, "destination": 1002, "weight": 100, "startRadius": 5.0}
not an edge
{"start": 1002, "destination": 1003}
{"start": 1002, "destination": 1003, "weight": 70, "startRadius": 9.0}
{"start": 1003, "destination": 1003, "weight": 1}
"#;
        let topology = parse_topology(text).unwrap();
        assert_eq!(topology.edge_count(), 2);
        assert_eq!(topology.radius(1001).unwrap(), 5.0);
        // Radius only applies where the relay first appears
        assert!((topology.radius(1002).unwrap() - crate::core::DEFAULT_RELAY_RADIUS).abs() < 1e-12);
        assert_eq!(topology.distance(1001, 1003).unwrap(), 170.0);
    }

    #[test]
    fn test_parse_topology_array() {
        let text = r#"[{"start": 1001, "destination": 1002, "weight": 10}, 5, {"start": 7, "destination": 1002, "weight": 3}]"#;
        let topology = parse_topology(text).unwrap();
        assert_eq!(topology.edge_count(), 1);
        assert!(!topology.contains_relay(7));
    }

    #[test]
    fn test_parse_topology_without_edges() {
        assert!(matches!(parse_topology("garbage\n"), Err(ParseError::NoValidEdges)));
        assert!(matches!(parse_topology("[1, 2]"), Err(ParseError::NoValidEdges)));
        assert!(matches!(parse_topology("[{"), Err(ParseError::Json(_))));
    }

    #[test]
    fn test_is_balanced() {
        assert!(is_balanced(r#"{"a": [1, {"b": 2}]}"#));
        assert!(!is_balanced(r#"{"a": [1, 2}"#));
        assert!(!is_balanced("{\"deviceId\": 2,"));
        assert!(is_balanced(r#"{"name": "brace } inside"}"#));
        assert!(!is_balanced("}{"));
    }
}
