//! Per-peer dependency records and the minimum/convergence queries the time
//! coordinator runs over them.

use conductor_core::{keys::FederateId, time::Time};

use crate::messages::{Action, ActionMessage};

/// Convergence state reported by a peer during exec-mode entry and iterative
/// grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Convergence {
    /// No report yet for the current iteration.
    #[default]
    NonConverged,
    /// The peer is ready to proceed.
    Complete,
    /// The peer requested another iteration at the same logical time.
    Continue,
    /// The peer is in an error state.
    Error,
}

impl Convergence {
    /// A peer counts as converged once it has reported either outcome.
    pub const fn is_converged(self) -> bool {
        matches!(self, Self::Complete | Self::Continue)
    }
}

/// What is known about one peer of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyInfo {
    pub id: FederateId,
    /// Next time at which the peer can have events.
    pub time_next: Time,
    /// The peer's own next event time.
    pub te: Time,
    /// Minimum `te` over the peer's dependencies.
    pub tdemin: Time,
    /// Whether the peer's last word was a grant.
    pub grant: bool,
    pub converged: Convergence,
    pub last_iteration: i32,
}

impl DependencyInfo {
    fn new(id: FederateId) -> Self {
        Self {
            id,
            time_next: Time::ZERO,
            te: Time::ZERO,
            tdemin: Time::ZERO,
            grant: false,
            converged: Convergence::NonConverged,
            last_iteration: 0,
        }
    }

    /// Apply a received control message to this record. Returns true if
    /// anything changed.
    fn apply(&mut self, msg: &ActionMessage) -> bool {
        let before = self.clone();
        let converged = if msg.flags.error() {
            Convergence::Error
        } else if msg.flags.iteration_requested() {
            Convergence::Continue
        } else {
            Convergence::Complete
        };

        match msg.action {
            Action::TimeRequest => {
                self.time_next = msg.action_time;
                self.te = msg.te;
                self.tdemin = msg.tdemin;
                self.converged = converged;
                self.last_iteration = msg.counter;
                self.grant = false;
            }
            Action::TimeGrant => {
                // A granted peer will emit nothing before its granted time.
                self.time_next = msg.action_time;
                self.te = msg.action_time;
                self.tdemin = msg.action_time;
                self.converged = converged;
                self.grant = true;
            }
            Action::ExecRequest => {
                self.converged = converged;
                self.last_iteration = msg.counter;
                self.grant = false;
            }
            Action::ExecGrant => {
                self.converged = converged;
                self.last_iteration = msg.counter;
                self.grant = true;
            }
            Action::Error => {
                self.converged = Convergence::Error;
            }
            _ => {}
        }
        *self != before
    }
}

/// A time minimum together with the peer that produced it.
///
/// Ties go to the numerically smaller federate id for determinism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeMin {
    pub time: Time,
    pub fed: FederateId,
}

impl TimeMin {
    const NONE: Self = Self {
        time: Time::MAX,
        fed: FederateId::INVALID,
    };
}

/// The per-federate view of its dependencies.
///
/// Tables are small (typically well under 32 peers), so a flat sorted
/// sequence with binary search is the right shape.
#[derive(Debug, Default)]
pub struct DependencyTable {
    deps: Vec<DependencyInfo>,
}

impl DependencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Idempotent: returns false if the peer was already present.
    pub fn add(&mut self, id: FederateId) -> bool {
        match self.deps.binary_search_by_key(&id, |d| d.id) {
            Ok(_) => false,
            Err(pos) => {
                self.deps.insert(pos, DependencyInfo::new(id));
                true
            }
        }
    }

    pub fn remove(&mut self, id: FederateId) -> bool {
        match self.deps.binary_search_by_key(&id, |d| d.id) {
            Ok(pos) => {
                self.deps.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn get(&self, id: FederateId) -> Option<&DependencyInfo> {
        self.deps
            .binary_search_by_key(&id, |d| d.id)
            .ok()
            .map(|pos| &self.deps[pos])
    }

    pub fn contains(&self, id: FederateId) -> bool {
        self.get(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependencyInfo> {
        self.deps.iter()
    }

    /// Apply a received time/exec message to the sender's record. Returns
    /// true if the record changed; false also covers unknown senders.
    pub fn update(&mut self, msg: &ActionMessage) -> bool {
        match self.deps.binary_search_by_key(&msg.source_id, |d| d.id) {
            Ok(pos) => self.deps[pos].apply(msg),
            Err(_) => false,
        }
    }

    /// Minimum over `time_next` of all dependencies.
    pub fn min_next(&self) -> Time {
        self.deps
            .iter()
            .map(|d| d.time_next)
            .min()
            .unwrap_or(Time::MAX)
    }

    /// Minimum over the dependencies' own next event times.
    pub fn min_te(&self) -> TimeMin {
        self.fold_min(|d| d.te)
    }

    /// Minimum over the dependencies' advertised `tdemin`.
    pub fn min_tdemin(&self) -> TimeMin {
        self.fold_min(|d| d.tdemin)
    }

    fn fold_min(&self, key: impl Fn(&DependencyInfo) -> Time) -> TimeMin {
        // The table is sorted by id, so a strict comparison keeps the
        // smallest id on ties.
        self.deps.iter().fold(TimeMin::NONE, |acc, d| {
            let time = key(d);
            if time < acc.time {
                TimeMin { time, fed: d.id }
            } else {
                acc
            }
        })
    }

    /// Overall convergence at `iteration`: Error dominates, then any peer
    /// that has not reported for this round, then any standing iteration
    /// request.
    pub fn all_converged(&self, iteration: i32) -> Convergence {
        let mut result = Convergence::Complete;
        for d in &self.deps {
            if d.converged == Convergence::Error {
                return Convergence::Error;
            }
            if !d.converged.is_converged() || d.last_iteration < iteration {
                result = Convergence::NonConverged;
            } else if d.converged == Convergence::Continue && result == Convergence::Complete {
                result = Convergence::Continue;
            }
        }
        result
    }

    /// Mark every peer that has not yet reported at `iteration` as
    /// non-converged, opening a new convergence round.
    pub fn open_round(&mut self, iteration: i32) {
        for d in &mut self.deps {
            if d.last_iteration < iteration {
                d.converged = Convergence::NonConverged;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageFlags;

    fn fed(id: i32) -> FederateId {
        FederateId::new(id)
    }

    fn time_request(src: i32, at: f64, te: f64, tdemin: f64) -> ActionMessage {
        let mut msg = ActionMessage::new(Action::TimeRequest, fed(src));
        msg.action_time = Time::from_seconds(at);
        msg.te = Time::from_seconds(te);
        msg.tdemin = Time::from_seconds(tdemin);
        msg
    }

    #[test]
    fn add_is_idempotent() {
        let mut table = DependencyTable::new();
        assert!(table.add(fed(2)));
        assert!(table.add(fed(1)));
        assert!(!table.add(fed(2)));
        assert_eq!(table.len(), 2);
        assert!(table.remove(fed(2)));
        assert!(!table.remove(fed(2)));
    }

    #[test]
    fn update_applies_time_request() {
        let mut table = DependencyTable::new();
        table.add(fed(1));

        assert!(table.update(&time_request(1, 1.0, 2.0, 0.5)));
        let d = table.get(fed(1)).unwrap();
        assert_eq!(d.time_next, Time::from_seconds(1.0));
        assert_eq!(d.te, Time::from_seconds(2.0));
        assert_eq!(d.tdemin, Time::from_seconds(0.5));
        assert_eq!(d.converged, Convergence::Complete);

        // Re-applying the identical message changes nothing.
        assert!(!table.update(&time_request(1, 1.0, 2.0, 0.5)));
        // Unknown senders are ignored.
        assert!(!table.update(&time_request(9, 1.0, 2.0, 0.5)));

        // A grant pins every field of the record to the granted time.
        let mut grant = ActionMessage::new(Action::TimeGrant, fed(1));
        grant.action_time = Time::from_seconds(1.0);
        assert!(table.update(&grant));
        let d = table.get(fed(1)).unwrap();
        assert!(d.grant);
        assert_eq!(d.te, Time::from_seconds(1.0));
        assert_eq!(d.tdemin, Time::from_seconds(1.0));
    }

    #[test]
    fn minimums_break_ties_toward_smaller_id() {
        let mut table = DependencyTable::new();
        table.add(fed(5));
        table.add(fed(3));
        table.update(&time_request(5, 1.0, 2.0, 4.0));
        table.update(&time_request(3, 1.0, 2.0, 4.0));

        assert_eq!(table.min_te().fed, fed(3));
        assert_eq!(table.min_te().time, Time::from_seconds(2.0));
        assert_eq!(table.min_tdemin().fed, fed(3));
        assert_eq!(table.min_next(), Time::from_seconds(1.0));
    }

    #[test]
    fn empty_table_minimums_are_infinite() {
        let table = DependencyTable::new();
        assert_eq!(table.min_next(), Time::MAX);
        assert_eq!(table.min_te().time, Time::MAX);
        assert!(!table.min_te().fed.is_valid());
    }

    #[test]
    fn convergence_rounds() {
        let mut table = DependencyTable::new();
        table.add(fed(1));
        table.add(fed(2));
        assert_eq!(table.all_converged(0), Convergence::NonConverged);

        let mut exec = ActionMessage::new(Action::ExecRequest, fed(1));
        table.update(&exec);
        assert_eq!(table.all_converged(0), Convergence::NonConverged);

        exec.source_id = fed(2);
        exec.flags = MessageFlags::default().with_iteration_requested();
        table.update(&exec);
        assert_eq!(table.all_converged(0), Convergence::Continue);

        // Open round 1: both peers must report again.
        table.open_round(1);
        assert_eq!(table.all_converged(1), Convergence::NonConverged);

        let mut exec1 = ActionMessage::new(Action::ExecRequest, fed(1));
        exec1.counter = 1;
        table.update(&exec1);
        exec1.source_id = fed(2);
        table.update(&exec1);
        assert_eq!(table.all_converged(1), Convergence::Complete);
    }

    #[test]
    fn error_dominates() {
        let mut table = DependencyTable::new();
        table.add(fed(1));
        table.add(fed(2));
        table.update(&ActionMessage::new(Action::ExecRequest, fed(1)));

        let mut err = ActionMessage::new(Action::ExecRequest, fed(2));
        err.flags = MessageFlags::default().with_error();
        table.update(&err);
        assert_eq!(table.all_converged(0), Convergence::Error);
    }
}
