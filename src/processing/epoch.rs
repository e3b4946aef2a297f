//! Movement phases of a single sensor

use std::collections::BTreeMap;

use crate::core::{Direction, NodeId, Package, Position, WirelessContact};
use crate::validation::error::{LocatorError, LocatorResult};

/// Movement phase classification of an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpochType {
    Voyage,
    RelayApproach,
    RelayWithdrawal,
}

impl EpochType {
    /// Swaps approach and withdrawal, voyages stay voyages
    pub fn flipped(self) -> Self {
        match self {
            EpochType::RelayApproach => EpochType::RelayWithdrawal,
            EpochType::RelayWithdrawal => EpochType::RelayApproach,
            EpochType::Voyage => EpochType::Voyage,
        }
    }

    pub fn is_relay_contact(self) -> bool {
        self != EpochType::Voyage
    }
}

impl From<Direction> for EpochType {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Approach => EpochType::RelayApproach,
            Direction::Withdrawal => EpochType::RelayWithdrawal,
            Direction::Unknown => EpochType::Voyage,
        }
    }
}

/// Maximal run of packages sharing one movement phase
#[derive(Debug, Clone)]
pub struct Epoch {
    packages: Vec<Package>,
    kind: EpochType,
    distance: Option<f64>,
    start_time: Option<u64>,
    relay_contact: Option<WirelessContact>,
    /// Index of the package with the strongest reading per contacted sensor
    strongest_contact: BTreeMap<NodeId, usize>,
    /// Known location at which the epoch ends, if any
    pub end_position: Option<Position>,
}

impl Epoch {
    pub fn new(kind: EpochType, first: Package) -> Self {
        let mut epoch = Self {
            packages: Vec::new(),
            kind,
            distance: None,
            start_time: None,
            relay_contact: None,
            strongest_contact: BTreeMap::new(),
            end_position: None,
        };
        epoch.add_package(first);
        epoch
    }

    /// Epoch whose motion is taken to start at `start_time` rather than at its first package
    pub fn starting_at(kind: EpochType, first: Package, start_time: u64) -> Self {
        let mut epoch = Self::new(kind, first);
        epoch.start_time = Some(start_time);
        epoch
    }

    pub fn kind(&self) -> EpochType {
        self.kind
    }

    pub fn set_kind(&mut self, kind: EpochType) {
        self.kind = kind;
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn into_packages(self) -> Vec<Package> {
        self.packages
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn distance(&self) -> Option<f64> {
        self.distance
    }

    pub fn add_package(&mut self, package: Package) {
        self.packages.push(package);
        self.register_strongest_contact(self.packages.len() - 1);
    }

    /// Puts a package in front of the others, e.g. when a preceding epoch is folded in
    pub fn prepend_package(&mut self, package: Package) {
        self.packages.insert(0, package);
        self.renew_strongest_contact_info();
    }

    fn register_strongest_contact(&mut self, index: usize) {
        let package = &self.packages[index];
        for contact in package.sensor_contacts() {
            let replace = match self.strongest_contact.get(&contact.node_id) {
                None => true,
                Some(&stored) => self.packages[stored]
                    .contact_to(contact.node_id)
                    .map_or(true, |c| c.strength <= contact.strength),
            };
            if replace {
                self.strongest_contact.insert(contact.node_id, index);
            }
        }
    }

    /// Rebuilds the strongest-contact index, required after packages were moved
    pub fn renew_strongest_contact_info(&mut self) {
        self.strongest_contact.clear();
        for index in 0..self.packages.len() {
            self.register_strongest_contact(index);
        }
    }

    /// Sensor ids with the index of the package that heard them best
    pub fn strongest_contacts(&self) -> impl Iterator<Item = (NodeId, usize)> + '_ {
        self.strongest_contact.iter().map(|(&id, &index)| (id, index))
    }

    pub fn strongest_package_for(&self, sensor_id: NodeId) -> Option<&Package> {
        self.strongest_contact_index(sensor_id)
            .and_then(|index| self.packages.get(index))
    }

    pub fn strongest_contact_index(&self, sensor_id: NodeId) -> Option<usize> {
        self.strongest_contact.get(&sensor_id).copied()
    }

    pub fn latest(&self) -> LocatorResult<&Package> {
        self.packages.last().ok_or(LocatorError::EmptyEpoch)
    }

    pub fn start_time(&self) -> LocatorResult<u64> {
        if let Some(start) = self.start_time {
            return Ok(start);
        }
        self.packages
            .first()
            .map(|p| p.timestamp)
            .ok_or(LocatorError::EmptyEpoch)
    }

    pub fn end_time(&self) -> LocatorResult<u64> {
        Ok(self.latest()?.timestamp)
    }

    pub fn duration(&self) -> LocatorResult<u64> {
        Ok(self.end_time()?.saturating_sub(self.start_time()?))
    }

    pub fn has_contact_to(&self, node_id: NodeId) -> bool {
        self.packages.iter().any(|p| p.contact_to(node_id).is_some())
    }

    /// Strongest relay heard by the latest package, or the contact carried over from a merge
    pub fn relay_contact(&self) -> Option<WirelessContact> {
        self.packages
            .last()
            .and_then(|p| p.strongest_relay().copied())
            .or(self.relay_contact)
    }

    pub fn relay_id(&self) -> Option<NodeId> {
        self.relay_contact().map(|c| c.node_id)
    }

    pub fn set_relay_contact(&mut self, contact: WirelessContact) {
        self.relay_contact = Some(contact);
    }

    /// Interpolates package positions along `start`'s route.
    ///
    /// Each package is placed at `start.offset + elapsed * distance / duration`,
    /// with elapsed time counted from the epoch start. A zero duration moves at
    /// one unit per tick.
    pub fn set_package_positions(&mut self, distance: f64, start: &Position) -> LocatorResult<()> {
        if distance.is_nan() {
            return Err(LocatorError::DistanceNotSet);
        }
        let start_time = self.start_time()?;
        let duration = self.duration()?;
        self.distance = Some(distance);

        let speed = if duration == 0 {
            1.0
        } else {
            distance / duration as f64
        };

        for package in &mut self.packages {
            let elapsed = package.timestamp as f64 - start_time as f64;
            package.set_position(start.with_offset(start.offset() + elapsed * speed));
        }

        if self.end_position.is_none() {
            self.end_position = self.latest()?.position().copied();
        }
        Ok(())
    }

    /// Writes the same provisional position to every package
    pub fn assign_position(&mut self, position: Position) {
        for package in &mut self.packages {
            package.set_position(position);
        }
    }

    /// Moves every package after `at` into a new epoch of the same type.
    ///
    /// Returns `None` without touching the epoch when `at` is the last package.
    pub fn split(&mut self, at: usize, end_position: Position) -> Option<Epoch> {
        if at + 1 >= self.packages.len() {
            return None;
        }
        let split_time = self.packages[at].timestamp;
        let tail = self.packages.split_off(at + 1);

        let mut new_epoch = Epoch {
            packages: tail,
            kind: self.kind,
            distance: None,
            start_time: Some(split_time),
            relay_contact: None,
            strongest_contact: BTreeMap::new(),
            end_position: None,
        };
        new_epoch.renew_strongest_contact_info();

        self.end_position = Some(end_position);
        self.renew_strongest_contact_info();
        Some(new_epoch)
    }

    /// Removes and returns every package after index `at`
    pub fn truncate_after(&mut self, at: usize) -> Vec<Package> {
        if at + 1 >= self.packages.len() {
            return Vec::new();
        }
        let tail = self.packages.split_off(at + 1);
        self.renew_strongest_contact_info();
        tail
    }
}

/// Index of the nearest relay-contact epoch next to `index`.
///
/// Right next to `index`, an epoch of the same type that continues the
/// previous one (both voyages, or same relay) is skipped as an artificial
/// split. `index` may equal `epochs.len()` for a backward scan from the end.
pub fn last_non_voyage_epoch(epochs: &[Epoch], index: usize, backwards: bool) -> Option<usize> {
    let len = epochs.len();
    if (backwards && index < 1) || (!backwards && index + 2 > len) {
        return None;
    }

    let mut skip = true;
    let mut i = if backwards { index - 1 } else { index + 1 };
    loop {
        let epoch = &epochs[i];
        let neighbour = if backwards { i + 1 } else { i - 1 };

        let continuation = skip
            && neighbour < len
            && neighbour > 0
            && {
                let next = &epochs[neighbour];
                next.kind == epoch.kind
                    && (next.kind == EpochType::Voyage
                        || matches!((next.relay_id(), epoch.relay_id()), (Some(a), Some(b)) if a == b))
            };

        if !continuation {
            skip = false;
            if epoch.kind.is_relay_contact() {
                return Some(i);
            }
        }

        if backwards {
            if i == 0 {
                return None;
            }
            i -= 1;
        } else {
            i += 1;
            if i >= len {
                return None;
            }
        }
    }
}

/// Relay contact of the nearest relay-contact epoch next to `index`
pub fn neighbour_relay(epochs: &[Epoch], index: usize, backwards: bool) -> Option<WirelessContact> {
    last_non_voyage_epoch(epochs, index, backwards).and_then(|i| epochs[i].relay_contact())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_epoch(kind: EpochType, readings: &[(u64, NodeId, f64)]) -> Epoch {
        let mut packages = readings
            .iter()
            .map(|&(ts, relay, strength)| Package::new(1, ts).with_contact(relay, strength));
        let first = packages.next().unwrap();
        let mut epoch = Epoch::new(kind, first);
        for p in packages {
            epoch.add_package(p);
        }
        epoch
    }

    fn voyage(timestamps: &[u64]) -> Epoch {
        let mut epoch = Epoch::new(EpochType::Voyage, Package::new(1, timestamps[0]));
        for &ts in &timestamps[1..] {
            epoch.add_package(Package::new(1, ts));
        }
        epoch
    }

    #[test]
    fn test_type_from_direction() {
        assert_eq!(EpochType::from(Direction::Approach), EpochType::RelayApproach);
        assert_eq!(EpochType::from(Direction::Withdrawal), EpochType::RelayWithdrawal);
        assert_eq!(EpochType::from(Direction::Unknown), EpochType::Voyage);
        assert_eq!(EpochType::RelayApproach.flipped(), EpochType::RelayWithdrawal);
        assert_eq!(EpochType::Voyage.flipped(), EpochType::Voyage);
    }

    #[test]
    fn test_strongest_contact_favours_latest_on_tie() {
        let mut epoch = Epoch::new(EpochType::Voyage, Package::new(1, 1).with_contact(2, 0.5));
        epoch.add_package(Package::new(1, 2).with_contact(2, 0.8).with_contact(3, 0.1));
        epoch.add_package(Package::new(1, 3).with_contact(2, 0.8));
        epoch.add_package(Package::new(1, 4).with_contact(2, 0.3));

        assert_eq!(epoch.strongest_package_for(2).map(|p| p.timestamp), Some(3));
        assert_eq!(epoch.strongest_package_for(3).map(|p| p.timestamp), Some(2));
        assert!(epoch.strongest_package_for(4).is_none());
        assert_eq!(epoch.strongest_contacts().count(), 2);
    }

    #[test]
    fn test_relay_contact_falls_back_to_stored() {
        let mut epoch = voyage(&[1, 2]);
        assert!(epoch.relay_contact().is_none());
        epoch.set_relay_contact(WirelessContact::new(1002, 0.4));
        assert_eq!(epoch.relay_id(), Some(1002));

        let epoch = relay_epoch(EpochType::RelayApproach, &[(1, 1001, 0.2), (2, 1001, 0.5)]);
        assert_eq!(epoch.relay_contact().map(|c| c.strength), Some(0.5));
    }

    #[test]
    fn test_split_at_last_package_is_noop() {
        let mut epoch = voyage(&[1, 2, 3]);
        assert!(epoch.split(2, Position::anchored(1001, 1002, 5.0, 10.0)).is_none());
        assert_eq!(epoch.len(), 3);
        assert!(epoch.end_position.is_none());
    }

    #[test]
    fn test_split_preserves_packages() {
        let mut epoch = Epoch::starting_at(EpochType::Voyage, Package::new(1, 2).with_contact(5, 0.9), 1);
        for ts in 3..7 {
            epoch.add_package(Package::new(1, ts).with_contact(5, 0.1));
        }
        let end = Position::anchored(1001, 1002, 40.0, 100.0);
        let tail = epoch.split(1, end).unwrap();

        let head: Vec<u64> = epoch.packages().iter().map(|p| p.timestamp).collect();
        let rest: Vec<u64> = tail.packages().iter().map(|p| p.timestamp).collect();
        assert_eq!(head, vec![2, 3]);
        assert_eq!(rest, vec![4, 5, 6]);
        assert_eq!(tail.start_time().unwrap(), 3);
        assert_eq!(tail.kind(), EpochType::Voyage);
        assert_eq!(epoch.end_position, Some(end));
        assert_eq!(epoch.strongest_package_for(5).map(|p| p.timestamp), Some(2));
        assert_eq!(tail.strongest_package_for(5).map(|p| p.timestamp), Some(6));
    }

    #[test]
    fn test_set_package_positions_interpolates() {
        let mut epoch = Epoch::starting_at(EpochType::Voyage, Package::new(1, 6), 4);
        epoch.add_package(Package::new(1, 7));
        epoch.add_package(Package::new(1, 8));

        let start = Position::anchored(1001, 1002, 10.0, 100.0);
        epoch.set_package_positions(80.0, &start).unwrap();

        let offsets: Vec<f64> = epoch
            .packages()
            .iter()
            .map(|p| p.position().unwrap().offset())
            .collect();
        assert_eq!(offsets, vec![50.0, 70.0, 90.0]);
        assert_eq!(epoch.distance(), Some(80.0));
        assert_eq!(epoch.end_position.map(|p| p.offset()), Some(90.0));
    }

    #[test]
    fn test_zero_duration_moves_one_unit_per_tick() {
        let mut epoch = voyage(&[5]);
        let start = Position::anchored(1001, 1002, 3.0, 100.0);
        epoch.set_package_positions(50.0, &start).unwrap();
        assert_eq!(epoch.packages()[0].position().unwrap().offset(), 3.0);
    }

    #[test]
    fn test_set_package_positions_requires_distance() {
        let mut epoch = voyage(&[1, 2]);
        let start = Position::anchored(1001, 1002, 0.0, 100.0);
        assert_eq!(
            epoch.set_package_positions(f64::NAN, &start),
            Err(LocatorError::DistanceNotSet)
        );
        assert!(epoch.packages()[0].position().is_none());
    }

    #[test]
    fn test_truncate_after() {
        let mut epoch = voyage(&[1, 2, 3, 4]);
        let tail = epoch.truncate_after(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(epoch.len(), 2);
        assert!(epoch.truncate_after(1).is_empty());
    }

    #[test]
    fn test_last_non_voyage_epoch_backwards() {
        let epochs = vec![
            relay_epoch(EpochType::RelayApproach, &[(1, 1001, 0.5)]),
            voyage(&[2, 3]),
            relay_epoch(EpochType::RelayWithdrawal, &[(4, 1002, 0.4)]),
        ];
        assert_eq!(last_non_voyage_epoch(&epochs, 3, true), Some(2));
        assert_eq!(last_non_voyage_epoch(&epochs, 2, true), Some(0));
        assert_eq!(last_non_voyage_epoch(&epochs, 0, true), None);
        assert_eq!(neighbour_relay(&epochs, 2, true).map(|c| c.node_id), Some(1001));
    }

    #[test]
    fn test_last_non_voyage_epoch_skips_continuation() {
        let epochs = vec![
            relay_epoch(EpochType::RelayWithdrawal, &[(1, 1002, 0.3)]),
            relay_epoch(EpochType::RelayApproach, &[(2, 1001, 0.5)]),
            relay_epoch(EpochType::RelayApproach, &[(3, 1001, 0.7)]),
        ];
        // Epoch 1 continues epoch 2 on the same relay and is skipped
        assert_eq!(last_non_voyage_epoch(&epochs, 2, true), Some(0));

        let run = vec![
            relay_epoch(EpochType::RelayApproach, &[(1, 1001, 0.3)]),
            relay_epoch(EpochType::RelayApproach, &[(2, 1001, 0.5)]),
            relay_epoch(EpochType::RelayApproach, &[(3, 1001, 0.7)]),
        ];
        assert_eq!(last_non_voyage_epoch(&run, 2, true), None);
    }

    #[test]
    fn test_last_non_voyage_epoch_forwards() {
        let epochs = vec![
            relay_epoch(EpochType::RelayWithdrawal, &[(1, 1001, 0.5)]),
            voyage(&[2]),
            voyage(&[3]),
            relay_epoch(EpochType::RelayApproach, &[(4, 1002, 0.2)]),
        ];
        assert_eq!(last_non_voyage_epoch(&epochs, 0, false), Some(3));
        assert_eq!(neighbour_relay(&epochs, 1, false).map(|c| c.node_id), Some(1002));
        assert_eq!(last_non_voyage_epoch(&epochs, 3, false), None);
        assert_eq!(last_non_voyage_epoch(&epochs[..1], 0, false), None);
    }
}
