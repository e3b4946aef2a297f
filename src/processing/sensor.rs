//! Per-sensor localization state

use tracing::trace;

use crate::core::{NodeId, NodeKind, Package, Position, RendezVous};
use crate::processing::epoch::{Epoch, EpochType};
use crate::validation::error::{LocatorError, LocatorResult};

/// Mobile node with its queue of unresolved epochs
#[derive(Debug, Clone)]
pub struct Sensor {
    id: NodeId,
    mystery_epochs: Vec<Epoch>,
    /// Timestamp of the last package handed out or of the previous epoch's end
    last_epoch_end: Option<u64>,
    pristine: bool,
    last_known_position: Option<Position>,
    last_resolved: Option<u64>,
    checkpoints: Vec<RendezVous>,
}

impl Sensor {
    pub fn new(id: NodeId) -> LocatorResult<Self> {
        if NodeKind::of(id) != NodeKind::Sensor {
            return Err(LocatorError::NotASensor(id));
        }
        Ok(Self {
            id,
            mystery_epochs: Vec::new(),
            last_epoch_end: None,
            pristine: true,
            last_known_position: None,
            last_resolved: None,
            checkpoints: Vec::new(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn epochs(&self) -> &[Epoch] {
        &self.mystery_epochs
    }

    pub(crate) fn epochs_mut(&mut self) -> &mut Vec<Epoch> {
        &mut self.mystery_epochs
    }

    pub fn latest_epoch(&self) -> Option<&Epoch> {
        self.mystery_epochs.last()
    }

    pub(crate) fn latest_epoch_mut(&mut self) -> Option<&mut Epoch> {
        self.mystery_epochs.last_mut()
    }

    /// Most recent buffered package
    pub fn last_package(&self) -> Option<&Package> {
        self.latest_epoch().and_then(|e| e.packages().last())
    }

    pub fn last_known_position(&self) -> Option<&Position> {
        self.last_known_position.as_ref()
    }

    /// Timestamp of the last resolved package
    pub fn last_resolved(&self) -> Option<u64> {
        self.last_resolved
    }

    pub fn checkpoints(&self) -> &[RendezVous] {
        &self.checkpoints
    }

    /// Opens a new epoch with `package` as its first member.
    ///
    /// Apart from the very first epoch of the sensor, the motion of a new
    /// epoch starts where the previous one ended.
    pub fn add_epoch(&mut self, kind: EpochType, package: Package) {
        if let Some(end) = self.latest_epoch().and_then(|e| e.end_time().ok()) {
            self.last_epoch_end = Some(end);
        }

        let epoch = if self.pristine {
            Epoch::new(kind, package)
        } else {
            let start = self.last_epoch_end.unwrap_or(package.timestamp);
            Epoch::starting_at(kind, package, start)
        };
        trace!(sensor = self.id, ?kind, index = self.mystery_epochs.len(), "opened epoch");
        self.mystery_epochs.push(epoch);
        self.pristine = false;
    }

    /// Removes the first `count` epochs and returns their packages in order
    pub fn merge_and_clear_epochs(&mut self, count: usize) -> LocatorResult<Vec<Package>> {
        if self.mystery_epochs.is_empty() || count == 0 {
            return Err(LocatorError::EmptyEpoch);
        }
        if count > self.mystery_epochs.len() {
            return Err(LocatorError::InvariantViolation(format!(
                "cannot clear {} of {} epochs of sensor {}",
                count,
                self.mystery_epochs.len(),
                self.id
            )));
        }

        let packages: Vec<Package> = self
            .mystery_epochs
            .drain(..count)
            .flat_map(Epoch::into_packages)
            .collect();

        let last = packages.last().ok_or(LocatorError::EmptyEpoch)?;
        self.last_epoch_end = Some(last.timestamp);
        self.last_resolved = Some(last.timestamp);
        if let Some(position) = last.position() {
            self.last_known_position = Some(*position);
        }

        let watermark = last.timestamp;
        self.checkpoints.retain(|c| c.timestamp > watermark);
        Ok(packages)
    }

    /// Consumes the most recent checkpoint strictly inside `(start, end)`.
    ///
    /// Older checkpoints in the same window are superseded and dropped.
    pub fn take_checkpoint(&mut self, start: u64, end: u64) -> Option<RendezVous> {
        let in_window = |c: &RendezVous| c.timestamp > start && c.timestamp < end;
        let chosen = self
            .checkpoints
            .iter()
            .filter(|c| in_window(*c))
            .max_by_key(|c| c.timestamp)
            .copied()?;

        self.checkpoints.retain(|c| !in_window(c));
        Some(chosen)
    }

    /// Registers a checkpoint unless it predates the last resolved package
    pub fn add_rendezvous(&mut self, rendezvous: RendezVous) -> bool {
        if self.last_resolved.is_some_and(|w| rendezvous.timestamp <= w) {
            return false;
        }
        self.checkpoints.push(rendezvous);
        true
    }

    /// Relay most recently contacted at or before `bound`, falling back to the last known position
    pub fn last_relay_contact_id(&self, bound: Option<u64>) -> Option<NodeId> {
        self.mystery_epochs
            .iter()
            .rev()
            .filter(|e| match (bound, e.latest()) {
                (Some(b), Ok(latest)) => latest.timestamp <= b,
                (None, Ok(_)) => true,
                (_, Err(_)) => false,
            })
            .find_map(Epoch::relay_id)
            .or_else(|| self.last_known_position.map(|p| p.dest()))
    }

    /// Folds every epoch after `anchor` and `package` into a single withdrawal epoch
    pub(crate) fn collapse_into_withdrawal(&mut self, anchor: Option<usize>, package: Package) {
        let from = anchor.map_or(0, |a| a + 1).min(self.mystery_epochs.len());
        let mut packages: Vec<Package> = self
            .mystery_epochs
            .drain(from..)
            .flat_map(Epoch::into_packages)
            .collect();
        packages.push(package);

        let extend_anchor = anchor
            .and_then(|a| self.mystery_epochs.get(a))
            .is_some_and(|e| e.kind() == EpochType::RelayWithdrawal);

        let mut packages = packages.into_iter();
        if !extend_anchor {
            if let Some(first) = packages.next() {
                self.add_epoch(EpochType::RelayWithdrawal, first);
            }
        }
        if let Some(latest) = self.mystery_epochs.last_mut() {
            for p in packages {
                latest.add_package(p);
            }
        }
    }

    /// Ends the latest epoch at a checkpoint and moves the rest, plus `package`, into a new epoch.
    ///
    /// Without a buffered package at or before the checkpoint the package is simply appended.
    pub(crate) fn split_latest_at_checkpoint(
        &mut self,
        checkpoint: RendezVous,
        package: Package,
        kind: EpochType,
    ) {
        let Some(latest) = self.mystery_epochs.last_mut() else {
            self.add_epoch(kind, package);
            return;
        };
        let Some(keep) = latest
            .packages()
            .iter()
            .rposition(|p| p.timestamp <= checkpoint.timestamp)
        else {
            latest.add_package(package);
            return;
        };

        let mut moved = latest.truncate_after(keep);
        latest.end_position = Some(checkpoint.position);
        latest.renew_strongest_contact_info();
        moved.push(package);

        let mut moved = moved.into_iter();
        if let Some(first) = moved.next() {
            self.add_epoch(kind, first);
        }
        if let Some(fresh) = self.mystery_epochs.last_mut() {
            for p in moved {
                fresh.add_package(p);
            }
        }

        let count = self.mystery_epochs.len();
        if count >= 2 {
            if let Some(contact) = self.mystery_epochs[count - 1].relay_contact() {
                self.mystery_epochs[count - 2].set_relay_contact(contact);
            }
        }
        trace!(
            sensor = self.id,
            checkpoint = checkpoint.timestamp,
            interceptor = checkpoint.interceptor,
            "split epoch at checkpoint"
        );
    }
}
