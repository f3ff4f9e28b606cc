//! The per-federate time coordination state machine.
//!
//! A coordinator negotiates grantable times with the federate's dependencies
//! and dependents by exchanging `TimeRequest`/`TimeGrant` and
//! `ExecRequest`/`ExecGrant` messages. All state here is touched by a single
//! worker; outbound traffic goes through an injected send function.

use conductor_core::{keys::FederateId, time::Time};

use crate::{
    dependencies::{Convergence, DependencyTable},
    messages::{Action, ActionMessage, MessageFlags},
};

/// Lifecycle phase of a federate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Created,
    Initializing,
    CheckingExec,
    Exec,
    Finalize,
    Error,
}

/// Timing parameters a federate imposes on its own grants.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Grants are rounded up onto this grid (disabled when zero).
    pub period: Time,
    /// Anchor of the period grid.
    pub offset: Time,
    /// Minimum advance between consecutive grants.
    pub min_time_delta: Time,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            period: Time::ZERO,
            offset: Time::ZERO,
            min_time_delta: Time::EPSILON,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("timed out waiting for a grant at {requested}")]
    GrantTimeout { requested: Time },

    #[error("dependency {0} advertised a time below the granted time")]
    InconsistentDependency(FederateId),

    #[error("operation not valid in phase {0:?}")]
    InvalidPhase(Phase),

    #[error("the federation entered an error state")]
    FederationErrorState,
}

pub struct TimeCoordinator {
    id: FederateId,
    timing: Timing,
    phase: Phase,

    /// The standing request asked for another iteration at the same time.
    iterating: bool,
    /// Set while exec-mode entry is being negotiated.
    checking_exec: bool,
    /// Set while a time request is blocked waiting for a grant.
    in_request: bool,
    interruptible: bool,

    time_granted: Time,
    time_requested: Time,
    time_next: Time,
    time_minde: Time,
    time_minminde: Time,
    time_allow: Time,
    time_exec: Time,
    time_message: Time,
    time_value: Time,

    iteration: i32,
    /// Dependency that produced `time_minde`; ties go to the smaller id.
    min_fed: FederateId,

    dependencies: DependencyTable,
    dependents: Vec<FederateId>,

    /// (action_time, te, tdemin) of the last broadcast request, used to
    /// decide whether a dependency update forces a rebroadcast.
    last_advertised: Option<(Time, Time, Time)>,

    send: Box<dyn FnMut(ActionMessage) + Send>,
}

impl std::fmt::Debug for TimeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeCoordinator")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("time_granted", &self.time_granted)
            .field("time_requested", &self.time_requested)
            .field("time_exec", &self.time_exec)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

impl TimeCoordinator {
    pub fn new(
        id: FederateId,
        timing: Timing,
        send: impl FnMut(ActionMessage) + Send + 'static,
    ) -> Self {
        Self {
            id,
            timing,
            phase: Phase::Created,
            iterating: false,
            checking_exec: false,
            in_request: false,
            interruptible: false,
            time_granted: Time::MIN,
            time_requested: Time::MAX,
            time_next: Time::ZERO,
            time_minde: Time::ZERO,
            time_minminde: Time::ZERO,
            time_allow: Time::MIN,
            time_exec: Time::MAX,
            time_message: Time::MAX,
            time_value: Time::MAX,
            iteration: 0,
            min_fed: FederateId::INVALID,
            dependencies: DependencyTable::new(),
            dependents: Vec::new(),
            last_advertised: None,
            send: Box::new(send),
        }
    }

    pub fn id(&self) -> FederateId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn granted(&self) -> Time {
        self.time_granted
    }

    pub fn requested(&self) -> Time {
        self.time_requested
    }

    pub fn iteration(&self) -> i32 {
        self.iteration
    }

    /// The dependency currently holding the minimum next-event time.
    pub fn min_fed(&self) -> FederateId {
        self.min_fed
    }

    pub fn executing(&self) -> bool {
        self.phase == Phase::Exec
    }

    pub fn in_request(&self) -> bool {
        self.in_request
    }

    pub fn dependencies(&self) -> &DependencyTable {
        &self.dependencies
    }

    pub fn dependents(&self) -> &[FederateId] {
        &self.dependents
    }

    /// Add a federate this one temporally depends on. Idempotent.
    pub fn add_dependency(&mut self, id: FederateId) -> bool {
        self.dependencies.add(id)
    }

    /// Add a federate that temporally depends on this one. Idempotent.
    pub fn add_dependent(&mut self, id: FederateId) -> bool {
        if self.dependents.contains(&id) {
            false
        } else {
            self.dependents.push(id);
            true
        }
    }

    /// Drop a dependency, e.g. after it disconnected. If it held the minimum
    /// the factors are recomputed, which may unblock a standing request.
    pub fn remove_dependency(&mut self, id: FederateId) -> bool {
        let removed = self.dependencies.remove(id);
        if removed {
            self.update_time_factors();
        }
        removed
    }

    pub fn remove_dependent(&mut self, id: FederateId) -> bool {
        let len = self.dependents.len();
        self.dependents.retain(|&d| d != id);
        self.dependents.len() != len
    }

    pub fn enter_initializing(&mut self) -> Result<(), CoordinationError> {
        if self.phase != Phase::Created {
            return Err(CoordinationError::InvalidPhase(self.phase));
        }
        self.phase = Phase::Initializing;
        Ok(())
    }

    /// Begin negotiating entry into the executing phase.
    ///
    /// Broadcasts `ExecRequest` with the requested convergence `mode` to all
    /// dependents and arms [`Self::check_exec_entry`].
    #[tracing::instrument(skip(self), fields(id = %self.id))]
    pub fn entering_exec_mode(&mut self, mode: Convergence) {
        if self.checking_exec || self.phase == Phase::Exec {
            return;
        }
        if self.phase == Phase::Created {
            self.phase = Phase::Initializing;
        }
        self.phase = Phase::CheckingExec;
        self.checking_exec = true;
        self.iterating = mode == Convergence::Continue;
        self.broadcast_exec_request();
    }

    /// Apply a received `ExecRequest`/`ExecGrant` from a dependency.
    pub fn process_exec_request(&mut self, msg: &ActionMessage) -> bool {
        self.dependencies.update(msg)
    }

    /// Decide whether the executing phase can be entered.
    ///
    /// `Complete` enters exec with `time_granted = 0`. `Continue` means the
    /// current round ended in an iteration request: the counter has been
    /// incremented, and — unless this federate itself asked to iterate, in
    /// which case the caller owns the rebroadcast — `ExecRequest` has already
    /// been rebroadcast with the new counter.
    #[tracing::instrument(skip(self), fields(id = %self.id, iteration = self.iteration))]
    pub fn check_exec_entry(&mut self) -> Convergence {
        if !self.checking_exec {
            return Convergence::NonConverged;
        }
        match self.dependencies.all_converged(self.iteration) {
            Convergence::Error => {
                self.phase = Phase::Error;
                Convergence::Error
            }
            Convergence::NonConverged => Convergence::NonConverged,
            state => {
                if self.iterating || state == Convergence::Continue {
                    self.iteration += 1;
                    self.dependencies.open_round(self.iteration);
                    tracing::debug!(iteration = self.iteration, "Exec entry iterates.");
                    if self.iterating {
                        self.iterating = false;
                        self.checking_exec = false;
                    } else {
                        self.broadcast_exec_request();
                    }
                    Convergence::Continue
                } else {
                    self.checking_exec = false;
                    self.phase = Phase::Exec;
                    self.time_granted = Time::ZERO;
                    tracing::debug!(iteration = self.iteration, "Entering executing phase.");
                    let mut grant = ActionMessage::new(Action::ExecGrant, self.id);
                    grant.counter = self.iteration;
                    self.broadcast(grant);
                    Convergence::Complete
                }
            }
        }
    }

    /// Record that an external value update at `t` is in flight.
    pub fn update_value_time(&mut self, t: Time) {
        if t < self.time_value {
            self.time_value = t;
            self.refresh_request();
        }
    }

    /// Record that an external message at `t` is in flight.
    pub fn update_message_time(&mut self, t: Time) {
        if t < self.time_message {
            self.time_message = t;
            self.refresh_request();
        }
    }

    /// Issue a time request.
    ///
    /// Computes the execution target and broadcasts `TimeRequest` carrying
    /// `(action_time = time_exec, te = time_next, tdemin = min_de)`. The
    /// caller then drives [`Self::check_time_grant`] as dependency reports
    /// arrive.
    #[tracing::instrument(skip(self), fields(id = %self.id, t = %t))]
    pub fn time_request(
        &mut self,
        t: Time,
        converged: Convergence,
        new_value_time: Time,
        new_message_time: Time,
        interruptible: bool,
    ) {
        self.time_value = self.time_value.min(new_value_time);
        self.time_message = self.time_message.min(new_message_time);
        // A request below the granted time is served at the granted time.
        self.time_requested = t.max(self.time_granted);
        self.interruptible = interruptible;
        self.iterating = converged == Convergence::Continue;
        if !self.iterating {
            self.iteration = 0;
        }
        self.in_request = true;
        // Seed the dependency-derived minimums before the first grant check;
        // an empty table yields an unbounded allowable time.
        self.recompute_minimums();
        self.update_next_times();
        self.broadcast_time_request();
    }

    /// Recompute `time_next` and `time_exec` from the request and any
    /// in-flight external events.
    fn update_next_times(&mut self) {
        if self.iterating {
            // Iterating holds the current time point.
            self.time_exec = self.time_granted.max(Time::ZERO);
            self.time_next = self
                .time_exec
                .saturating_add(self.timing.min_time_delta)
                .ceil_to_grid(self.timing.period, self.timing.offset);
            return;
        }
        let base = if self.interruptible {
            self.time_requested
                .min(self.time_value)
                .min(self.time_message)
        } else {
            self.time_requested
        };
        let floor = self
            .time_granted
            .max(Time::ZERO)
            .saturating_add(self.timing.min_time_delta);
        self.time_next = floor
            .max(base)
            .ceil_to_grid(self.timing.period, self.timing.offset);
        self.time_exec = self.time_requested.min(self.time_next);
    }

    /// Apply a received time-protocol message from a dependency.
    pub fn process_time_message(
        &mut self,
        msg: &ActionMessage,
    ) -> Result<bool, CoordinationError> {
        match msg.action {
            Action::TimeRequest | Action::TimeGrant => {
                if self.phase == Phase::Exec
                    && self.dependencies.contains(msg.source_id)
                    && msg.action_time < self.time_granted
                {
                    return Err(CoordinationError::InconsistentDependency(msg.source_id));
                }
                Ok(self.dependencies.update(msg))
            }
            _ => Ok(false),
        }
    }

    /// Recompute the dependency-derived minimums. Returns true iff the
    /// advertised values changed and the standing request was rebroadcast.
    pub fn update_time_factors(&mut self) -> bool {
        self.recompute_minimums();

        if !self.in_request {
            return false;
        }
        self.update_next_times();
        let advertised = (self.time_exec, self.time_next, self.time_minde);
        if self.last_advertised != Some(advertised) {
            tracing::debug!(
                exec = %self.time_exec,
                te = %self.time_next,
                tdemin = %self.time_minde,
                "Advertised times changed; rebroadcasting request."
            );
            self.broadcast_time_request();
            true
        } else {
            false
        }
    }

    /// Decide whether the standing time request can be granted.
    ///
    /// `Complete` grants and broadcasts `TimeGrant`; `Continue` grants the
    /// same time point again with an incremented iteration counter.
    #[tracing::instrument(skip(self), fields(id = %self.id, exec = %self.time_exec))]
    pub fn check_time_grant(&mut self) -> Convergence {
        if !self.in_request || self.phase != Phase::Exec {
            return Convergence::NonConverged;
        }

        let mut iterate_party = self.iterating;
        for d in self.dependencies.iter() {
            if d.converged == Convergence::Error {
                self.phase = Phase::Error;
                return Convergence::Error;
            }
            if d.time_next < self.time_exec || d.tdemin < self.time_exec {
                return Convergence::NonConverged;
            }
            if d.converged == Convergence::Continue && d.time_next == self.time_exec {
                iterate_party = true;
            }
        }
        if self.time_exec > self.time_allow {
            return Convergence::NonConverged;
        }

        if iterate_party {
            // Counters must match across dependencies before the round can
            // conclude.
            if self
                .dependencies
                .iter()
                .any(|d| d.last_iteration < self.iteration)
            {
                return Convergence::NonConverged;
            }
            self.time_granted = self.time_granted.max(self.time_exec);
            self.iteration += 1;
            let iteration = self.iteration;
            self.dependencies.open_round(iteration);
            self.in_request = false;
            tracing::debug!(granted = %self.time_granted, iteration, "Iterating at time point.");
            Convergence::Continue
        } else {
            let granted = self.time_exec.min(self.dependencies.min_next());
            self.time_granted = self.time_granted.max(granted);
            self.time_value = Time::MAX;
            self.time_message = Time::MAX;
            self.in_request = false;
            self.interruptible = false;
            self.last_advertised = None;
            tracing::debug!(granted = %self.time_granted, "Time grant complete.");

            let mut grant = ActionMessage::new(Action::TimeGrant, self.id);
            grant.action_time = self.time_granted;
            grant.te = self.time_granted;
            grant.tdemin = self.time_granted;
            grant.counter = self.iteration;
            self.broadcast(grant);
            Convergence::Complete
        }
    }

    /// Enter the error phase: an error-flagged grant at the requested time,
    /// then a disconnect broadcast.
    #[tracing::instrument(skip(self), fields(id = %self.id))]
    pub fn fail(&mut self) {
        self.phase = Phase::Error;
        self.in_request = false;
        let mut grant = ActionMessage::new(Action::TimeGrant, self.id);
        grant.action_time = self.time_requested;
        grant.flags = MessageFlags::default().with_error();
        self.broadcast(grant);
        self.broadcast(ActionMessage::new(Action::Disconnect, self.id));
    }

    /// Announce departure to every peer in either direction. Returns the
    /// number of peers notified, i.e. the acknowledgements to expect.
    pub fn begin_finalize(&mut self) -> usize {
        self.phase = Phase::Finalize;
        self.in_request = false;
        let mut peers = self.dependents.clone();
        for d in self.dependencies.iter() {
            if !peers.contains(&d.id) {
                peers.push(d.id);
            }
        }
        for &peer in &peers {
            let msg = ActionMessage::new(Action::Disconnect, self.id).to(peer);
            (self.send)(msg);
        }
        peers.len()
    }

    fn recompute_minimums(&mut self) {
        let min_te = self.dependencies.min_te();
        let min_tdemin = self.dependencies.min_tdemin();
        self.time_minde = min_te.time;
        self.min_fed = min_te.fed;
        self.time_minminde = min_tdemin.time;
        self.time_allow = self
            .time_minde
            .min(self.time_minminde.saturating_add(Time::EPSILON));
    }

    fn refresh_request(&mut self) {
        if self.in_request {
            self.update_next_times();
            let advertised = (self.time_exec, self.time_next, self.time_minde);
            if self.last_advertised != Some(advertised) {
                self.broadcast_time_request();
            }
        }
    }

    fn broadcast_exec_request(&mut self) {
        let mut msg = ActionMessage::new(Action::ExecRequest, self.id);
        msg.counter = self.iteration;
        if self.iterating {
            msg.flags = msg.flags.with_iteration_requested();
        }
        self.broadcast(msg);
    }

    fn broadcast_time_request(&mut self) {
        let min_te = self.dependencies.min_te();
        self.time_minde = min_te.time;
        self.min_fed = min_te.fed;

        let mut msg = ActionMessage::new(Action::TimeRequest, self.id);
        msg.action_time = self.time_exec;
        msg.te = self.time_next;
        msg.tdemin = self.time_minde;
        msg.counter = self.iteration;
        if self.iterating {
            msg.flags = msg.flags.with_iteration_requested();
        }
        if self.interruptible {
            msg.flags = msg.flags.with_interruptible();
        }
        self.last_advertised = Some((self.time_exec, self.time_next, self.time_minde));
        self.broadcast(msg);
    }

    fn broadcast(&mut self, template: ActionMessage) {
        for &dest in &self.dependents {
            let mut msg = template.clone();
            msg.dest_id = dest;
            (self.send)(msg);
        }
    }
}
