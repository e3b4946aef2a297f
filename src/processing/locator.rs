//! Incremental localization engine
//!
//! The locator classifies each sensor's observations into epochs and, once
//! enough context has been buffered, back-fills positions onto them. Each
//! call to [`Locator::feed`] returns the packages that became resolvable.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::algorithms::TopologyAnalyzer;
use crate::core::{Direction, NodeId, NodeKind, Package, Position, RendezVous};
use crate::processing::epoch::{last_non_voyage_epoch, neighbour_relay, EpochType};
use crate::processing::sensor::Sensor;
use crate::utils::config::LocatorConfig;
use crate::validation::error::{LocatorError, LocatorResult};

/// Result of trying to resolve a single epoch
#[derive(Debug, Clone, PartialEq)]
pub enum EpochOutcome {
    /// Positions were written, resolution may continue with the next epoch
    Resolved,
    /// Not enough data yet
    Deferred,
    /// Earlier epochs were handed out early
    Released(Vec<Package>),
}

impl EpochOutcome {
    pub fn into_packages(self) -> Vec<Package> {
        match self {
            EpochOutcome::Released(packages) => packages,
            EpochOutcome::Resolved | EpochOutcome::Deferred => Vec::new(),
        }
    }
}

enum Resolution {
    Done(EpochOutcome),
    /// The epoch's end position contradicts its type
    NeedsTypeFlip,
}

/// Rendezvous addressed to another sensor, delivered once the current sensor is settled
type Outbox = Vec<(NodeId, RendezVous)>;

/// Annotates packages with positions on the relay graph
#[derive(Debug, Clone)]
pub struct Locator {
    topology: TopologyAnalyzer,
    config: LocatorConfig,
    max_signal: f64,
    sensors: BTreeMap<NodeId, Sensor>,
}

impl Default for Locator {
    /// Sample topology with every feature enabled
    fn default() -> Self {
        Self::new(TopologyAnalyzer::sample(), LocatorConfig::default())
    }
}

impl Locator {
    pub fn new(topology: TopologyAnalyzer, config: LocatorConfig) -> Self {
        Self {
            max_signal: config.max_signal,
            topology,
            config,
            sensors: BTreeMap::new(),
        }
    }

    pub fn topology(&self) -> &TopologyAnalyzer {
        &self.topology
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    /// Current co-location ceiling
    pub fn max_signal(&self) -> f64 {
        self.max_signal
    }

    pub fn sensor(&self, id: NodeId) -> Option<&Sensor> {
        self.sensors.get(&id)
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values()
    }

    fn ensure_sensor(&mut self, id: NodeId) -> LocatorResult<()> {
        if !self.sensors.contains_key(&id) {
            let sensor = Sensor::new(id)?;
            self.sensors.insert(id, sensor);
        }
        Ok(())
    }

    /// Feeds one observation and returns the packages resolved by it, oldest first.
    ///
    /// Contacts to relays missing from the topology are dropped. Graph lookups
    /// that fail because of missing or disconnected relays leave the sensor's
    /// buffer in place and yield an empty result.
    pub fn feed(&mut self, mut package: Package) -> LocatorResult<Vec<Package>> {
        let sensor_id = package.sensor_id;
        if NodeKind::of(sensor_id) != NodeKind::Sensor {
            return Err(LocatorError::NotASensor(sensor_id));
        }

        let topology = &self.topology;
        package.retain_contacts(|c| {
            let known = c.kind() == NodeKind::Sensor || topology.contains_relay(c.node_id);
            if !known {
                warn!(sensor = sensor_id, relay = c.node_id, "dropping contact to unknown relay");
            }
            known
        });

        self.ensure_sensor(sensor_id)?;
        for contact in package.contacts() {
            match contact.kind() {
                NodeKind::Sensor => self.ensure_sensor(contact.node_id)?,
                NodeKind::Relay => self.max_signal = self.max_signal.max(contact.strength),
            }
        }

        let mut sensor = self
            .sensors
            .remove(&sensor_id)
            .ok_or_else(|| LocatorError::InvariantViolation(format!("sensor {} vanished", sensor_id)))?;
        let mut outbox = Outbox::new();
        let result = self.admit(&mut sensor, package, &mut outbox);
        self.sensors.insert(sensor_id, sensor);

        for (target, rendezvous) in outbox {
            if let Some(other) = self.sensors.get_mut(&target) {
                if other.add_rendezvous(rendezvous) {
                    debug!(
                        sensor = target,
                        interceptor = rendezvous.interceptor,
                        timestamp = rendezvous.timestamp,
                        "registered checkpoint"
                    );
                }
            }
        }

        match result {
            Ok(resolved) => {
                if !resolved.is_empty() {
                    debug!(sensor = sensor_id, count = resolved.len(), "resolved packages");
                }
                Ok(resolved)
            }
            Err(e) if e.is_recoverable() => {
                warn!(sensor = sensor_id, error = %e, "localization deferred");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn admit(&self, sensor: &mut Sensor, mut package: Package, outbox: &mut Outbox) -> LocatorResult<Vec<Package>> {
        if !package.has_relay_contact() {
            self.add_to_epochs(sensor, package, EpochType::Voyage)?;
            return Ok(Vec::new());
        }

        let previous = sensor.last_package();
        let has_history = previous.is_some();
        let mut weakened = false;
        for contact in package.contacts_mut() {
            if contact.kind() != NodeKind::Relay {
                continue;
            }
            let last = previous.and_then(|p| p.contact_to(contact.node_id)).map(|c| c.strength);
            contact.direction = match last {
                None if !has_history => Direction::Withdrawal,
                None => Direction::Approach,
                Some(before) if before > contact.strength => {
                    weakened = true;
                    Direction::Withdrawal
                }
                Some(_) => Direction::Approach,
            };
        }

        if weakened && self.withdrawal_closes_approach(sensor) {
            trace!(sensor = sensor.id(), timestamp = package.timestamp, "withdrawal after approach");
            self.add_to_epochs(sensor, package, EpochType::RelayWithdrawal)?;
            return self.clear_sensor_epochs(sensor, usize::MAX, outbox);
        }

        let strongest = package
            .strongest_relay()
            .copied()
            .ok_or_else(|| LocatorError::InvariantViolation("package lost its relay contacts".into()))?;
        let kind = EpochType::from(strongest.direction);

        if strongest.strength + self.config.tolerance >= self.max_signal {
            let epochs = sensor.epochs();
            let predecessor = last_non_voyage_epoch(epochs, epochs.len(), true).map(|i| epochs[i].kind());
            trace!(sensor = sensor.id(), relay = strongest.node_id, ?predecessor, "relay at full strength");
            match predecessor {
                Some(EpochType::RelayApproach) => {
                    self.add_to_epochs(sensor, package, kind)?;
                    return self.clear_sensor_epochs(sensor, usize::MAX, outbox);
                }
                Some(_) => {}
                None => {
                    let admitted = self.add_to_epochs(sensor, package, EpochType::RelayApproach)?;
                    if admitted == EpochType::RelayApproach {
                        return self.clear_sensor_epochs(sensor, usize::MAX, outbox);
                    }
                    return self.after_admission(sensor, admitted, outbox);
                }
            }
        }

        let admitted = self.add_to_epochs(sensor, package, kind)?;
        self.after_admission(sensor, admitted, outbox)
    }

    /// Nearest non-voyage epoch before a trailing withdrawal is an approach
    fn withdrawal_closes_approach(&self, sensor: &Sensor) -> bool {
        let epochs = sensor.epochs();
        let mut index = epochs.len();
        if epochs.last().is_some_and(|e| e.kind() == EpochType::RelayWithdrawal) {
            index -= 1;
        }
        last_non_voyage_epoch(epochs, index, true).is_some_and(|i| epochs[i].kind() == EpochType::RelayApproach)
    }

    fn after_admission(
        &self,
        sensor: &mut Sensor,
        admitted: EpochType,
        outbox: &mut Outbox,
    ) -> LocatorResult<Vec<Package>> {
        let epochs = sensor.epochs();
        let newest = epochs.len().saturating_sub(1);
        let predecessor = last_non_voyage_epoch(epochs, newest, true).map(|i| epochs[i].kind());

        match (admitted, predecessor) {
            (EpochType::RelayWithdrawal, Some(EpochType::RelayApproach)) => {
                self.clear_sensor_epochs(sensor, usize::MAX, outbox)
            }
            (EpochType::RelayApproach, Some(_)) => self.clear_sensor_epochs(sensor, newest, outbox),
            _ => Ok(Vec::new()),
        }
    }

    /// Adds a package to the sensor's latest epoch or opens a new one; returns the type it was admitted as
    pub fn add_to_epochs(&self, sensor: &mut Sensor, package: Package, kind: EpochType) -> LocatorResult<EpochType> {
        let Some(current) = sensor.latest_epoch() else {
            sensor.add_epoch(kind, package);
            return Ok(kind);
        };

        if current.kind() != kind {
            if kind != EpochType::Voyage {
                let strongest = package.strongest_relay().map(|c| c.node_id);
                let epochs = sensor.epochs();
                let anchor = last_non_voyage_epoch(epochs, epochs.len(), true);
                let previous_relay = match anchor {
                    Some(i) => epochs[i].relay_id(),
                    None => sensor.last_known_position().and_then(|p| {
                        let radius = self.topology.radius(p.dest()).ok()?;
                        (p.total_distance() - p.offset() <= radius).then_some(p.dest())
                    }),
                };

                if previous_relay.is_some() && previous_relay == strongest {
                    debug!(
                        sensor = sensor.id(),
                        relay = ?previous_relay,
                        timestamp = package.timestamp,
                        "false reversal, collapsing into withdrawal"
                    );
                    sensor.collapse_into_withdrawal(anchor, package);
                    return Ok(EpochType::RelayWithdrawal);
                }
            }
            sensor.add_epoch(kind, package);
            return Ok(kind);
        }

        let first = current.packages().first().ok_or(LocatorError::EmptyEpoch)?.timestamp;
        match sensor.take_checkpoint(first, package.timestamp) {
            Some(checkpoint) => sensor.split_latest_at_checkpoint(checkpoint, package, kind),
            None => {
                if let Some(latest) = sensor.latest_epoch_mut() {
                    latest.add_package(package);
                }
            }
        }
        Ok(kind)
    }

    /// Resolves the epoch at `index`, flipping its type at most once on contradiction
    pub fn calculate_epoch_position(&self, sensor: &mut Sensor, index: usize) -> LocatorResult<EpochOutcome> {
        let mut flipped = false;
        loop {
            match self.resolve_epoch(sensor, index)? {
                Resolution::Done(outcome) => return Ok(outcome),
                Resolution::NeedsTypeFlip if !flipped => {
                    let kind = sensor.epochs()[index].kind().flipped();
                    trace!(sensor = sensor.id(), index, ?kind, "flipping epoch type");
                    sensor.epochs_mut()[index].set_kind(kind);
                    flipped = true;
                }
                Resolution::NeedsTypeFlip => return Ok(EpochOutcome::Resolved),
            }
        }
    }

    fn resolve_epoch(&self, sensor: &mut Sensor, i: usize) -> LocatorResult<Resolution> {
        if sensor.epochs()[i].kind() == EpochType::Voyage {
            self.resolve_voyage(sensor, i)
        } else {
            self.resolve_relay_contact(sensor, i)
        }
    }

    fn resolve_voyage(&self, sensor: &mut Sensor, i: usize) -> LocatorResult<Resolution> {
        let epochs = sensor.epochs();
        let previous_end = i.checked_sub(1).and_then(|p| epochs[p].end_position);

        let Some(future) = neighbour_relay(epochs, i, false).map(|c| c.node_id) else {
            if previous_end.is_some() {
                let released = sensor.merge_and_clear_epochs(i)?;
                return Ok(Resolution::Done(EpochOutcome::Released(released)));
            }
            return Ok(Resolution::Done(EpochOutcome::Deferred));
        };

        let mut anchor: Option<(Position, NodeId)> = None;
        if let Some(end) = previous_end {
            let based = if end.is_fully_travelled() {
                let total = self.topology.distance(end.dest(), future)?;
                Position::anchored(end.dest(), future, 0.0, total)
            } else {
                end
            };
            anchor = based.start().map(|start| (based, start));
        }

        let (last_known, last_id) = match anchor {
            Some(found) => found,
            None => match sensor.last_known_position().copied() {
                Some(position) => (position, position.dest()),
                None => {
                    // The origin stays unknown, only the next relay is certain
                    sensor.epochs_mut()[i].assign_position(Position::unanchored(future));
                    return Ok(Resolution::Done(EpochOutcome::Resolved));
                }
            },
        };

        let total = self.topology.distance(last_id, future)?;
        let gone = if last_known.start() == Some(last_id) && last_known.dest() == future {
            last_known.offset()
        } else {
            0.0
        };

        let end_position = sensor.epochs()[i].end_position;
        let distance = match end_position.map(|end| self.topology.total_route_position(&end, last_id, future)) {
            Some(Ok(end)) => end.offset() - gone,
            _ => total - (gone + self.topology.radius(future)?),
        };

        let start = Position::anchored(last_id, future, gone, total);
        // Back at the relay it left, nothing was travelled
        let distance = if start.is_degenerate() {
            0.0
        } else {
            distance.clamp(0.0, (total - gone).max(0.0))
        };
        trace!(sensor = sensor.id(), index = i, %start, distance, "voyage");
        sensor.epochs_mut()[i].set_package_positions(distance, &start)?;
        Ok(Resolution::Done(EpochOutcome::Resolved))
    }

    fn resolve_relay_contact(&self, sensor: &mut Sensor, i: usize) -> LocatorResult<Resolution> {
        let epochs = sensor.epochs();
        let epoch = &epochs[i];
        let kind = epoch.kind();
        let end_position = epoch.end_position;
        let Some(anchor) = epoch.relay_id() else {
            return Err(LocatorError::InvariantViolation(format!(
                "{:?} epoch {} of sensor {} has no relay contact",
                kind,
                i,
                sensor.id()
            )));
        };
        let radius = self.topology.radius(anchor)?;

        let mut prev = neighbour_relay(epochs, i, true).map(|c| c.node_id).or_else(|| {
            sensor
                .last_known_position()
                .and_then(|p| if p.dest() != anchor { Some(p.dest()) } else { p.start() })
        });
        let mut next = neighbour_relay(epochs, i, false).map(|c| c.node_id);

        let start = if kind == EpochType::RelayApproach {
            if let Some(end) = end_position {
                if end.start() == Some(anchor) {
                    return Ok(Resolution::NeedsTypeFlip);
                }
                prev = end.start();
            }

            // Entering the radius from the side of the previous relay
            if let Some(prev) = prev {
                let total = self.topology.distance(prev, anchor)?;
                Position::anchored(prev, anchor, total - radius, total)
            } else if let Some(next) = next {
                let position = Position::anchored(anchor, next, 0.0, self.topology.distance(anchor, next)?);
                let epoch = &mut sensor.epochs_mut()[i];
                epoch.end_position = Some(position);
                epoch.assign_position(position);
                return Ok(Resolution::Done(EpochOutcome::Resolved));
            } else {
                return Ok(Resolution::Done(EpochOutcome::Deferred));
            }
        } else {
            if let Some(end) = end_position {
                if end.dest() == anchor {
                    return Ok(Resolution::NeedsTypeFlip);
                }
                if end.start().is_some() {
                    next = Some(end.dest());
                }
            }

            // Leaving from the relay itself towards the next one
            let Some(next) = next else {
                if i > 0 {
                    let released = sensor.merge_and_clear_epochs(i)?;
                    return Ok(Resolution::Done(EpochOutcome::Released(released)));
                }
                return Ok(Resolution::Done(EpochOutcome::Deferred));
            };
            let total = self.topology.distance(anchor, next)?;
            Position::anchored(anchor, next, 0.0, total)
        };

        trace!(sensor = sensor.id(), index = i, ?kind, %start, "relay contact");
        sensor.epochs_mut()[i].set_package_positions(radius, &start)?;
        Ok(Resolution::Done(EpochOutcome::Resolved))
    }

    /// A lone approach package at the head of the queue is either a glancing
    /// contact (followed by a voyage) or the start of the next epoch's contact.
    fn merge_glancing_contact(&self, sensor: &mut Sensor) {
        let epochs = sensor.epochs_mut();
        for i in 0..epochs.len().saturating_sub(1) {
            if epochs[i].kind() == EpochType::Voyage {
                continue;
            }
            if epochs[i].len() == 1 && epochs[i].kind() == EpochType::RelayApproach {
                let relay = epochs[i].packages()[0].strongest_relay().map(|c| c.node_id);
                if epochs[i + 1].kind() == EpochType::Voyage {
                    epochs[i].set_kind(EpochType::RelayWithdrawal);
                } else if relay.is_some_and(|r| epochs[i + 1].has_contact_to(r)) {
                    let single = epochs.remove(i);
                    for package in single.into_packages().into_iter().rev() {
                        epochs[i].prepend_package(package);
                    }
                }
            }
            break;
        }
    }

    /// Resolves the sensor's epochs before `max_index` and hands out their packages
    pub fn clear_sensor_epochs(
        &self,
        sensor: &mut Sensor,
        max_index: usize,
        outbox: &mut Outbox,
    ) -> LocatorResult<Vec<Package>> {
        self.merge_glancing_contact(sensor);

        let mut max_index = max_index;
        let mut i = 0;
        while i < sensor.epochs().len() && i < max_index {
            match self.calculate_epoch_position(sensor, i)? {
                EpochOutcome::Resolved => {}
                EpochOutcome::Deferred => return Ok(Vec::new()),
                EpochOutcome::Released(packages) => return Ok(packages),
            }

            if self.config.checkpoints || self.config.path_rectification {
                if let Some(stop) = self.reconcile_contacts(sensor, i, &mut max_index, outbox)? {
                    return Ok(stop.into_packages());
                }
            }
            i += 1;
        }

        let count = max_index.min(sensor.epochs().len());
        if count == 0 {
            return Ok(Vec::new());
        }
        sensor.merge_and_clear_epochs(count)
    }

    /// Cross-checks the resolved epoch against every sensor it met
    fn reconcile_contacts(
        &self,
        sensor: &mut Sensor,
        i: usize,
        max_index: &mut usize,
        outbox: &mut Outbox,
    ) -> LocatorResult<Option<EpochOutcome>> {
        let met: Vec<NodeId> = sensor.epochs()[i].strongest_contacts().map(|(id, _)| id).collect();

        for other_id in met {
            let Some(other) = self.sensors.get(&other_id) else {
                continue;
            };

            if self.config.path_rectification && sensor.epochs()[i].kind() == EpochType::Voyage {
                match self.rectify_path(sensor, i, other, max_index) {
                    Ok(None) => {}
                    Ok(Some(outcome)) => return Ok(Some(outcome)),
                    Err(e) if e.is_recoverable() => {
                        warn!(sensor = sensor.id(), other = other_id, error = %e, "path rectification skipped");
                    }
                    Err(e) => return Err(e),
                }
            }

            if self.config.checkpoints {
                match self.checkpoint_for(sensor, i, other) {
                    Ok(Some(rendezvous)) => outbox.push((other_id, rendezvous)),
                    Ok(None) => {}
                    Err(e) if e.is_recoverable() => {
                        warn!(sensor = sensor.id(), other = other_id, error = %e, "checkpoint skipped");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }

    /// Latest timestamp still counted as simultaneous with `timestamp`
    fn contact_deadline(&self, timestamp: u64) -> u64 {
        timestamp.saturating_add(self.config.time_tolerance)
    }

    /// Splits a voyage whose contact with `other` happened before the two routes could have met
    fn rectify_path(
        &self,
        sensor: &mut Sensor,
        i: usize,
        other: &Sensor,
        max_index: &mut usize,
    ) -> LocatorResult<Option<EpochOutcome>> {
        let epoch = &sensor.epochs()[i];
        let (Some(at), Some(strong)) = (
            epoch.strongest_contact_index(other.id()),
            epoch.strongest_package_for(other.id()),
        ) else {
            return Ok(None);
        };
        let Some(position) = strong.position().copied() else {
            return Ok(None);
        };
        let Some(start) = position.start() else {
            return Ok(None);
        };
        let Some(last_relay) = other.last_relay_contact_id(Some(self.contact_deadline(strong.timestamp))) else {
            return Ok(None);
        };

        let confluence = self.topology.earliest_shared_node(start, last_relay, position.dest())?;
        let min_distance = self.topology.distance(start, confluence)?;
        if position.offset() >= min_distance {
            return Ok(None);
        }

        let end = self.topology.graph_edge_position(&Position::anchored(
            start,
            position.dest(),
            min_distance,
            position.total_distance(),
        ))?;
        debug!(
            sensor = sensor.id(),
            other = other.id(),
            offset = position.offset(),
            min_distance,
            "contact earlier than possible, splitting voyage"
        );

        if let Some(tail) = sensor.epochs_mut()[i].split(at, end) {
            sensor.epochs_mut().insert(i + 1, tail);
            *max_index = max_index.saturating_add(1);
        }

        match self.calculate_epoch_position(sensor, i)? {
            EpochOutcome::Resolved => Ok(None),
            outcome => Ok(Some(outcome)),
        }
    }

    /// Rendezvous for `other` if the contact lies on its way from its last relay
    fn checkpoint_for(&self, sensor: &Sensor, i: usize, other: &Sensor) -> LocatorResult<Option<RendezVous>> {
        let Some(strong) = sensor.epochs()[i].strongest_package_for(other.id()) else {
            return Ok(None);
        };
        let Some(position) = strong.position().filter(|p| p.is_anchored()) else {
            return Ok(None);
        };

        let edge = self.topology.graph_edge_position(position)?;
        let (Some(edge_start), Some(last_id)) = (edge.start(), other.last_relay_contact_id(None)) else {
            return Ok(None);
        };

        if self
            .topology
            .contains(edge_start, edge.dest(), &Position::route(last_id, edge.dest()))?
        {
            return Ok(Some(RendezVous::new(edge, sensor.id(), strong.timestamp)));
        }
        Ok(None)
    }
}
