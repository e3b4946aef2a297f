use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::constants::{DEFAULT_RELAY_RADIUS, POSITION_EPSILON, SENSOR_ID_THRESHOLD};
use crate::validation::error::LocatorError;

/// Numeric identity shared by sensors and relays
pub type NodeId = u64;

/// Returns true if the id belongs to the mobile sensor range
pub fn is_sensor(id: NodeId) -> bool {
    id < SENSOR_ID_THRESHOLD
}

/// Classification of a node id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Sensor,
    Relay,
}

impl NodeKind {
    pub fn of(id: NodeId) -> Self {
        if is_sensor(id) {
            NodeKind::Sensor
        } else {
            NodeKind::Relay
        }
    }
}

/// Fixed network vertex with a wireless contact radius
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Relay {
    pub id: NodeId,
    pub radius: f64,
}

impl Relay {
    /// Create a relay with the default contact radius
    pub fn new(id: NodeId) -> Result<Self, LocatorError> {
        Self::with_radius(id, DEFAULT_RELAY_RADIUS)
    }

    pub fn with_radius(id: NodeId, radius: f64) -> Result<Self, LocatorError> {
        if NodeKind::of(id) != NodeKind::Relay {
            return Err(LocatorError::NotARelay(id));
        }
        if !radius.is_finite() || radius < 0.0 {
            return Err(LocatorError::InvariantViolation(format!(
                "relay {} has invalid radius {}",
                id, radius
            )));
        }
        Ok(Self { id, radius })
    }
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay {}", self.id)
    }
}

/// Heading of a sensor relative to one contacted node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    Approach,
    Withdrawal,
    #[default]
    Unknown,
}

/// One observed neighbour inside a package
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WirelessContact {
    pub node_id: NodeId,
    pub strength: f64,
    pub direction: Direction,
}

impl WirelessContact {
    pub fn new(node_id: NodeId, strength: f64) -> Self {
        Self {
            node_id,
            strength,
            direction: Direction::Unknown,
        }
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::of(self.node_id)
    }

    /// First contact with the highest strength, `None` for an empty input
    pub fn strongest<'a, I>(candidates: I) -> Option<&'a WirelessContact>
    where
        I: IntoIterator<Item = &'a WirelessContact>,
    {
        let mut max: Option<&WirelessContact> = None;
        for contact in candidates {
            match max {
                Some(current) if current.strength >= contact.strength => {}
                _ => max = Some(contact),
            }
        }
        max
    }
}

impl fmt::Display for WirelessContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "contact to {} (strength {:.2}) of type {:?}",
            self.node_id, self.strength, self.direction
        )
    }
}

/// Location along the relay graph.
///
/// `Anchored` positions are `offset` units along the shortest path from
/// `start` to `dest`, which is `length` units long. `Unanchored` positions
/// only know the relay they are heading to; their length is unbounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Position {
    Anchored {
        start: NodeId,
        dest: NodeId,
        offset: f64,
        length: f64,
    },
    Unanchored {
        dest: NodeId,
        offset: f64,
    },
}

impl Position {
    pub fn anchored(start: NodeId, dest: NodeId, offset: f64, length: f64) -> Self {
        Position::Anchored {
            start,
            dest,
            offset,
            length,
        }
    }

    /// Origin unknown, heading for `dest`
    pub fn unanchored(dest: NodeId) -> Self {
        Position::Unanchored { dest, offset: 0.0 }
    }

    /// Zero offset on an open-ended route, used for path membership queries
    pub fn route(start: NodeId, dest: NodeId) -> Self {
        Position::anchored(start, dest, 0.0, f64::INFINITY)
    }

    pub fn start(&self) -> Option<NodeId> {
        match self {
            Position::Anchored { start, .. } => Some(*start),
            Position::Unanchored { .. } => None,
        }
    }

    pub fn dest(&self) -> NodeId {
        match self {
            Position::Anchored { dest, .. } | Position::Unanchored { dest, .. } => *dest,
        }
    }

    pub fn offset(&self) -> f64 {
        match self {
            Position::Anchored { offset, .. } | Position::Unanchored { offset, .. } => *offset,
        }
    }

    pub fn total_distance(&self) -> f64 {
        match self {
            Position::Anchored { length, .. } => *length,
            Position::Unanchored { .. } => f64::INFINITY,
        }
    }

    pub fn is_anchored(&self) -> bool {
        matches!(self, Position::Anchored { .. })
    }

    /// Start and destination coincide
    pub fn is_degenerate(&self) -> bool {
        self.start() == Some(self.dest())
    }

    /// The whole path up to `dest` has been covered
    pub fn is_fully_travelled(&self) -> bool {
        match self {
            Position::Anchored { offset, length, .. } => (length - offset).abs() <= POSITION_EPSILON,
            Position::Unanchored { .. } => false,
        }
    }

    pub fn with_offset(self, offset: f64) -> Self {
        match self {
            Position::Anchored {
                start, dest, length, ..
            } => Position::anchored(start, dest, offset, length),
            Position::Unanchored { dest, .. } => Position::Unanchored { dest, offset },
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Unanchored { dest, offset } if *offset == 0.0 => {
                write!(f, "heading for relay {}, origin unknown", dest)
            }
            Position::Unanchored { dest, offset } => {
                write!(f, "travelled {:.3} units towards relay {}, origin unknown", offset, dest)
            }
            Position::Anchored {
                start,
                dest,
                offset,
                length,
            } => write!(
                f,
                "travelled {:.3} of {:.3} units from relay {} to relay {}",
                offset, length, start, dest
            ),
        }
    }
}

/// One timestamped observation made by a sensor
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub sensor_id: NodeId,
    pub timestamp: u64,
    contacts: Vec<WirelessContact>,
    position: Option<Position>,
}

impl Package {
    pub fn new(sensor_id: NodeId, timestamp: u64) -> Self {
        Self {
            sensor_id,
            timestamp,
            contacts: Vec::new(),
            position: None,
        }
    }

    /// Builder-style contact insertion
    pub fn with_contact(mut self, node_id: NodeId, strength: f64) -> Self {
        self.insert_contact(WirelessContact::new(node_id, strength));
        self
    }

    /// Adds a contact, replacing an earlier one to the same node
    pub fn insert_contact(&mut self, contact: WirelessContact) {
        match self.contacts.iter_mut().find(|c| c.node_id == contact.node_id) {
            Some(existing) => *existing = contact,
            None => self.contacts.push(contact),
        }
    }

    /// Drops every contact for which `keep` returns false
    pub fn retain_contacts<F>(&mut self, keep: F)
    where
        F: FnMut(&WirelessContact) -> bool,
    {
        self.contacts.retain(keep);
    }

    pub fn contacts(&self) -> &[WirelessContact] {
        &self.contacts
    }

    pub(crate) fn contacts_mut(&mut self) -> &mut [WirelessContact] {
        &mut self.contacts
    }

    pub fn contact_to(&self, node_id: NodeId) -> Option<&WirelessContact> {
        self.contacts.iter().find(|c| c.node_id == node_id)
    }

    pub fn relay_contacts(&self) -> impl Iterator<Item = &WirelessContact> {
        self.contacts.iter().filter(|c| c.kind() == NodeKind::Relay)
    }

    pub fn sensor_contacts(&self) -> impl Iterator<Item = &WirelessContact> {
        self.contacts.iter().filter(|c| c.kind() == NodeKind::Sensor)
    }

    pub fn has_relay_contact(&self) -> bool {
        self.relay_contacts().next().is_some()
    }

    pub fn strongest_relay(&self) -> Option<&WirelessContact> {
        WirelessContact::strongest(self.relay_contacts())
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn set_position(&mut self, position: Position) {
        self.position = Some(position);
    }
}

/// Cross-sensor contact used as a checkpoint by the contacted sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RendezVous {
    pub position: Position,
    /// Sensor whose resolved track produced the position
    pub interceptor: NodeId,
    pub timestamp: u64,
}

impl RendezVous {
    pub fn new(position: Position, interceptor: NodeId, timestamp: u64) -> Self {
        Self {
            position,
            interceptor,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_classification() {
        assert_eq!(NodeKind::of(0), NodeKind::Sensor);
        assert_eq!(NodeKind::of(999), NodeKind::Sensor);
        assert_eq!(NodeKind::of(1000), NodeKind::Relay);
        assert!(is_sensor(42));
        assert!(!is_sensor(1001));
    }

    #[test]
    fn test_relay_rejects_sensor_id() {
        assert!(matches!(Relay::new(7), Err(LocatorError::NotARelay(7))));
        let relay = Relay::new(1001).unwrap();
        assert!((relay.radius - 10f64.sqrt()).abs() < 1e-12);
        assert!(Relay::with_radius(1001, -1.0).is_err());
    }

    #[test]
    fn test_duplicate_contact_replaces_earlier() {
        let p = Package::new(1, 5)
            .with_contact(1001, 0.2)
            .with_contact(3, 0.4)
            .with_contact(1001, 0.6);

        assert_eq!(p.contacts().len(), 2);
        assert_eq!(p.contact_to(1001).map(|c| c.strength), Some(0.6));
        assert_eq!(p.relay_contacts().count(), 1);
        assert_eq!(p.sensor_contacts().count(), 1);
    }

    #[test]
    fn test_strongest_relay_prefers_first_on_tie() {
        let p = Package::new(1, 0)
            .with_contact(1002, 0.5)
            .with_contact(1001, 0.5)
            .with_contact(2, 0.9);
        assert_eq!(p.strongest_relay().map(|c| c.node_id), Some(1002));
        assert!(Package::new(1, 0).strongest_relay().is_none());
    }

    #[test]
    fn test_position_accessors() {
        let anchored = Position::anchored(1001, 1002, 100.0, 100.0);
        assert_eq!(anchored.start(), Some(1001));
        assert_eq!(anchored.dest(), 1002);
        assert!(anchored.is_fully_travelled());
        assert!(!anchored.is_degenerate());

        let unanchored = Position::unanchored(1004);
        assert_eq!(unanchored.start(), None);
        assert!(unanchored.total_distance().is_infinite());
        assert!(!unanchored.is_fully_travelled());
        assert_eq!(unanchored.with_offset(2.0).offset(), 2.0);

        assert!(Position::anchored(1002, 1002, 0.0, 0.0).is_degenerate());
    }

    #[test]
    fn test_position_display() {
        let text = Position::anchored(1001, 1002, 12.5, 100.0).to_string();
        assert!(text.contains("12.500 of 100.000"));
        assert!(Position::unanchored(1003).to_string().contains("origin unknown"));
    }
}
