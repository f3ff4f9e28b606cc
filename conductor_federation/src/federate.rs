//! The federate interface layer: a user-facing handle plus the worker task
//! that owns all coordinator state.
//!
//! User calls post action messages into the federate's inbound queue and wait
//! on a watch channel for the matching grant notice; the single worker task
//! is the only thing that touches the coordinator. Transport producers (the
//! broker fabric) deliver into the same queue, so everything the coordinator
//! sees is serialized.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use conductor_core::{
    keys::{FederateId, GlobalHandle, InterfaceHandle},
    time::Time,
};
use tokio::sync::{mpsc, watch};

use crate::{
    broker::Broker,
    config::FederateConfig,
    coordinator::{CoordinationError, Phase, TimeCoordinator, Timing},
    dependencies::Convergence,
    filters::{FilterError, FilterOperation},
    messages::{Action, ActionMessage, SequenceLedger},
    FederationError,
};

/// Iteration behavior requested by a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterationRequest {
    #[default]
    NoIteration,
    ForceIteration,
}

/// Outcome of a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterationResult {
    /// Granted; proceed to the returned time.
    #[default]
    NextStep,
    /// Granted another iteration at the same time point.
    Iterating,
    /// The federate has left the federation.
    Halted,
    Error,
}

/// A message delivered to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMessage {
    pub source: GlobalHandle,
    pub time: Time,
    pub payload: Bytes,
}

/// What the worker publishes when a blocking call completes.
#[derive(Debug, Clone, Default)]
struct GrantNotice {
    nonce: u64,
    time: Time,
    iteration: i32,
    phase: Phase,
    result: IterationResult,
    error: bool,
}

#[derive(Debug)]
struct InputSlot {
    data: Bytes,
    time: Time,
    updated: bool,
}

impl Default for InputSlot {
    fn default() -> Self {
        Self {
            data: Bytes::new(),
            time: Time::MIN,
            updated: false,
        }
    }
}

type InputCallback = Box<dyn Fn(InterfaceHandle, Time) + Send>;

#[derive(Default)]
struct SharedState {
    inputs: Mutex<HashMap<InterfaceHandle, InputSlot>>,
    endpoints: Mutex<HashMap<InterfaceHandle, VecDeque<EndpointMessage>>>,
    callbacks: Mutex<HashMap<InterfaceHandle, InputCallback>>,
}

/// A payload waiting for the grant that makes it visible. Ordering is
/// (time, source_id, source_handle), with arrival order as the final tie
/// breaker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PendingEvent {
    time: Time,
    source_id: FederateId,
    source_handle: InterfaceHandle,
    arrival: u64,
    dest_handle: InterfaceHandle,
    payload: Bytes,
}

#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Initializing,
    ExecEntry { iterate: bool },
    Time { iterate: bool },
    Finalize,
}

#[derive(Debug, Clone, Copy)]
struct AppRequest {
    nonce: u64,
    kind: RequestKind,
}

struct Worker {
    id: FederateId,
    broker_id: FederateId,
    config: FederateConfig,
    coordinator: TimeCoordinator,
    inbound: mpsc::UnboundedReceiver<ActionMessage>,
    outbound: mpsc::UnboundedSender<ActionMessage>,
    grant_tx: watch::Sender<GrantNotice>,
    shared: Arc<SharedState>,
    ledger: SequenceLedger,
    pending_values: BinaryHeap<Reverse<PendingEvent>>,
    pending_messages: BinaryHeap<Reverse<PendingEvent>>,
    arrival: u64,
    request: Option<AppRequest>,
    acks_expected: usize,
    done: bool,
}

impl Worker {
    #[tracing::instrument(skip(self), fields(id = %self.id, name = %self.config.name))]
    async fn run(mut self) {
        loop {
            let finalizing = matches!(
                self.request,
                Some(AppRequest {
                    kind: RequestKind::Finalize,
                    ..
                })
            );
            let msg = if finalizing {
                match tokio::time::timeout(self.config.granted_wait, self.inbound.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        tracing::warn!("Finalize drain timed out; entering the error state.");
                        self.coordinator.fail();
                        self.notify(IterationResult::Error, true);
                        break;
                    }
                }
            } else {
                self.inbound.recv().await
            };
            let Some(msg) = msg else { break };

            // Payloads a federate sends itself still travel the fabric, so
            // only control actions posted by the handle count as commands.
            let command =
                msg.source_id == self.id && msg.dest_id == self.id && msg.action.is_control();
            if command {
                self.handle_command(msg);
            } else {
                self.handle_network(msg);
            }
            if self.done {
                break;
            }
        }
        tracing::debug!("Federate worker exiting.");
    }

    /// A call posted from the application side of the handle.
    fn handle_command(&mut self, msg: ActionMessage) {
        let nonce = msg.counter as u64;
        match msg.action {
            Action::Register => {
                match self.coordinator.enter_initializing() {
                    Ok(()) => {
                        self.request = Some(AppRequest {
                            nonce,
                            kind: RequestKind::Initializing,
                        });
                        self.notify(IterationResult::NextStep, false);
                        self.request = None;
                    }
                    Err(err) => {
                        tracing::error!(%err, "Cannot enter initializing mode.");
                        self.request = Some(AppRequest {
                            nonce,
                            kind: RequestKind::Initializing,
                        });
                        self.notify(IterationResult::Error, true);
                        self.request = None;
                    }
                }
            }
            Action::ExecRequest => {
                let iterate = msg.flags.iteration_requested();
                self.request = Some(AppRequest {
                    nonce,
                    kind: RequestKind::ExecEntry { iterate },
                });
                let mode = if iterate {
                    Convergence::Continue
                } else {
                    Convergence::Complete
                };
                self.coordinator.entering_exec_mode(mode);
                self.try_resolve();
            }
            Action::TimeRequest => {
                let iterate = msg.flags.iteration_requested();
                self.request = Some(AppRequest {
                    nonce,
                    kind: RequestKind::Time { iterate },
                });
                let mode = if iterate {
                    Convergence::Continue
                } else {
                    Convergence::Complete
                };
                let value_time = self.earliest(&self.pending_values);
                let message_time = self.earliest(&self.pending_messages);
                self.coordinator.time_request(
                    msg.action_time,
                    mode,
                    value_time,
                    message_time,
                    msg.flags.interruptible(),
                );
                self.try_resolve();
            }
            Action::Disconnect => {
                self.request = Some(AppRequest {
                    nonce,
                    kind: RequestKind::Finalize,
                });
                self.acks_expected = self.coordinator.begin_finalize();
                tracing::debug!(peers = self.acks_expected, "Draining for finalize.");
                if self.acks_expected == 0 {
                    self.finish_finalize();
                }
            }
            Action::Error => {
                // The application-side grant wait expired.
                self.coordinator.fail();
                self.notify(IterationResult::Error, true);
                self.request = None;
            }
            _ => tracing::debug!(%msg, "Unhandled command."),
        }
    }

    /// A message delivered by the fabric.
    fn handle_network(&mut self, msg: ActionMessage) {
        if !self.ledger.accept(&msg) {
            return;
        }
        match msg.action {
            Action::Data => {
                self.coordinator.update_value_time(msg.action_time);
                self.push_pending(msg, /* value */ true);
                self.try_resolve();
            }
            Action::Message => {
                self.coordinator.update_message_time(msg.action_time);
                self.push_pending(msg, /* value */ false);
                self.try_resolve();
            }
            Action::AddDependency => {
                self.coordinator.add_dependency(msg.source_id);
            }
            Action::AddDependent => {
                self.coordinator.add_dependent(msg.source_id);
            }
            Action::ExecRequest | Action::ExecGrant => {
                self.coordinator.process_exec_request(&msg);
                self.try_resolve();
            }
            Action::TimeRequest | Action::TimeGrant => {
                match self.coordinator.process_time_message(&msg) {
                    Ok(changed) => {
                        if changed {
                            self.coordinator.update_time_factors();
                        }
                        self.try_resolve();
                    }
                    Err(err) => {
                        tracing::error!(%err, "Inconsistent dependency report.");
                        self.coordinator.fail();
                        self.notify(IterationResult::Error, true);
                        self.request = None;
                    }
                }
            }
            Action::Disconnect => {
                let peer = msg.source_id;
                self.coordinator.remove_dependency(peer);
                self.coordinator.remove_dependent(peer);
                self.ledger.forget(peer);
                let ack = ActionMessage::new(Action::DisconnectAck, self.id).to(peer);
                let _ = self.outbound.send(ack);
                self.try_resolve();
            }
            Action::DisconnectAck => {
                if matches!(
                    self.request,
                    Some(AppRequest {
                        kind: RequestKind::Finalize,
                        ..
                    })
                ) {
                    self.acks_expected = self.acks_expected.saturating_sub(1);
                    if self.acks_expected == 0 {
                        self.finish_finalize();
                    }
                }
            }
            Action::Error => {
                self.coordinator.fail();
                self.notify(IterationResult::Error, true);
                self.request = None;
            }
            _ => tracing::debug!(%msg, "Unhandled network message."),
        }
    }

    /// Re-evaluate the standing blocking call after any state change.
    fn try_resolve(&mut self) {
        let Some(request) = self.request else { return };
        match request.kind {
            RequestKind::ExecEntry { iterate } => match self.coordinator.check_exec_entry() {
                Convergence::Complete => {
                    self.apply_grant(Time::ZERO);
                    self.notify(IterationResult::NextStep, false);
                    self.request = None;
                }
                Convergence::Continue if iterate => {
                    self.notify(IterationResult::Iterating, false);
                    self.request = None;
                }
                Convergence::Continue | Convergence::NonConverged => {}
                Convergence::Error => {
                    self.notify(IterationResult::Error, true);
                    self.request = None;
                }
            },
            RequestKind::Time { iterate } => match self.coordinator.check_time_grant() {
                Convergence::Complete => {
                    let granted = self.coordinator.granted();
                    self.apply_grant(granted);
                    self.notify(IterationResult::NextStep, false);
                    self.request = None;
                }
                Convergence::Continue => {
                    let granted = self.coordinator.granted();
                    self.apply_grant(granted);
                    let result = if iterate {
                        IterationResult::Iterating
                    } else {
                        IterationResult::NextStep
                    };
                    self.notify(result, false);
                    self.request = None;
                }
                Convergence::NonConverged => {}
                Convergence::Error => {
                    self.notify(IterationResult::Error, true);
                    self.request = None;
                }
            },
            RequestKind::Initializing | RequestKind::Finalize => {}
        }
    }

    fn finish_finalize(&mut self) {
        // Deregister only after every peer acknowledged, so their
        // acknowledgements could still be routed to us.
        let bye = ActionMessage::new(Action::Disconnect, self.id).to(self.broker_id);
        let _ = self.outbound.send(bye);
        self.notify(IterationResult::Halted, false);
        self.request = None;
        self.done = true;
    }

    /// Make every payload with `time <= granted` visible: values land in
    /// their input slots, messages in their endpoint queues.
    fn apply_grant(&mut self, granted: Time) {
        let mut updates: Vec<(InterfaceHandle, Time)> = Vec::new();
        {
            let mut inputs = self.shared.inputs.lock().unwrap();
            // Updates surfaced by an earlier grant go stale now.
            for slot in inputs.values_mut() {
                if slot.updated && slot.time < granted {
                    slot.updated = false;
                }
            }
            while let Some(Reverse(event)) = self.pending_values.peek() {
                if event.time > granted {
                    break;
                }
                let Reverse(event) = self.pending_values.pop().unwrap();
                if let Some(slot) = inputs.get_mut(&event.dest_handle) {
                    slot.data = event.payload;
                    slot.time = event.time.max(Time::ZERO);
                    slot.updated = true;
                    updates.push((event.dest_handle, slot.time));
                } else {
                    tracing::warn!(handle = %event.dest_handle, "Value for an unknown input.");
                }
            }
        }
        {
            let mut endpoints = self.shared.endpoints.lock().unwrap();
            while let Some(Reverse(event)) = self.pending_messages.peek() {
                if event.time > granted {
                    break;
                }
                let Reverse(event) = self.pending_messages.pop().unwrap();
                if let Some(queue) = endpoints.get_mut(&event.dest_handle) {
                    queue.push_back(EndpointMessage {
                        source: GlobalHandle::new(event.source_id, event.source_handle),
                        time: event.time.max(Time::ZERO),
                        payload: event.payload,
                    });
                } else {
                    tracing::warn!(handle = %event.dest_handle, "Message for an unknown endpoint.");
                }
            }
        }
        let callbacks = self.shared.callbacks.lock().unwrap();
        for (handle, time) in updates {
            if let Some(callback) = callbacks.get(&handle) {
                callback(handle, time);
            }
        }
    }

    fn push_pending(&mut self, msg: ActionMessage, value: bool) {
        self.arrival += 1;
        let event = PendingEvent {
            time: msg.action_time,
            source_id: msg.source_id,
            source_handle: msg.source_handle,
            arrival: self.arrival,
            dest_handle: msg.dest_handle,
            payload: msg.payload,
        };
        if value {
            self.pending_values.push(Reverse(event));
        } else {
            self.pending_messages.push(Reverse(event));
        }
    }

    fn earliest(&self, heap: &BinaryHeap<Reverse<PendingEvent>>) -> Time {
        heap.peek().map(|Reverse(e)| e.time).unwrap_or(Time::MAX)
    }

    fn notify(&mut self, result: IterationResult, error: bool) {
        let nonce = self.request.map(|r| r.nonce).unwrap_or(0);
        let notice = GrantNotice {
            nonce,
            time: self.coordinator.granted(),
            iteration: self.coordinator.iteration(),
            phase: self.coordinator.phase(),
            result,
            error,
        };
        self.grant_tx.send_replace(notice);
    }
}

/// A federate: the application's view of one simulator in the federation.
///
/// Registration calls go straight to the broker directory. Data-plane and
/// time-protocol calls post action messages to the worker; the blocking ones
/// wait on the grant watch with the configured `granted_wait` bound.
pub struct Federate {
    id: FederateId,
    broker: Arc<Broker>,
    config: FederateConfig,
    to_worker: mpsc::UnboundedSender<ActionMessage>,
    grant_rx: watch::Receiver<GrantNotice>,
    shared: Arc<SharedState>,
    publications: Mutex<HashMap<InterfaceHandle, GlobalHandle>>,
    next_nonce: AtomicU64,
}

impl std::fmt::Debug for Federate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Federate")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .finish_non_exhaustive()
    }
}

impl Federate {
    /// Register with the broker and spawn the worker and its in-process
    /// transport drain.
    pub fn create(broker: &Arc<Broker>, config: FederateConfig) -> Result<Self, FederationError> {
        let (to_worker, inbound) = mpsc::unbounded_channel();
        let id =
            broker.register_federate(&config.name, config.min_time_delta, to_worker.clone())?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ActionMessage>();
        {
            // The in-process transport: drain the outbound queue into the
            // broker fabric.
            let broker = Arc::clone(broker);
            tokio::spawn(async move {
                while let Some(msg) = outbound_rx.recv().await {
                    broker.route(msg);
                }
            });
        }

        let timing = Timing {
            period: config.period,
            offset: config.offset,
            min_time_delta: config.min_time_delta,
        };
        let coordinator = TimeCoordinator::new(id, timing, {
            let outbound = outbound_tx.clone();
            let mut ledger = SequenceLedger::new();
            move |mut msg: ActionMessage| {
                ledger.stamp(&mut msg);
                let _ = outbound.send(msg);
            }
        });

        let (grant_tx, grant_rx) = watch::channel(GrantNotice::default());
        let shared = Arc::new(SharedState::default());
        let worker = Worker {
            id,
            broker_id: broker.id(),
            config: config.clone(),
            coordinator,
            inbound,
            outbound: outbound_tx.clone(),
            grant_tx,
            shared: Arc::clone(&shared),
            ledger: SequenceLedger::new(),
            pending_values: BinaryHeap::new(),
            pending_messages: BinaryHeap::new(),
            arrival: 0,
            request: None,
            acks_expected: 0,
            done: false,
        };
        tokio::spawn(worker.run());

        Ok(Self {
            id,
            broker: Arc::clone(broker),
            config,
            to_worker,
            grant_rx,
            shared,
            publications: Mutex::new(HashMap::new()),
            next_nonce: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> FederateId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Granted time as of the last completed blocking call.
    pub fn granted_time(&self) -> Time {
        self.grant_rx.borrow().time
    }

    /// Iteration counter as of the last completed blocking call.
    pub fn current_iteration(&self) -> i32 {
        self.grant_rx.borrow().iteration
    }

    pub fn phase(&self) -> Phase {
        self.grant_rx.borrow().phase
    }

    // ---- registration ----------------------------------------------------

    pub fn register_publication(
        &self,
        name: &str,
        type_tag: &str,
        unit: Option<&str>,
    ) -> Result<InterfaceHandle, FederationError> {
        let handle = self
            .broker
            .register_publication(self.id, name, false, type_tag, unit)?;
        self.publications.lock().unwrap().insert(handle.handle, handle);
        Ok(handle.handle)
    }

    pub fn register_global_publication(
        &self,
        name: &str,
        type_tag: &str,
        unit: Option<&str>,
    ) -> Result<InterfaceHandle, FederationError> {
        let handle = self
            .broker
            .register_publication(self.id, name, true, type_tag, unit)?;
        self.publications.lock().unwrap().insert(handle.handle, handle);
        Ok(handle.handle)
    }

    pub fn register_input(
        &self,
        name: &str,
        type_tag: &str,
    ) -> Result<InterfaceHandle, FederationError> {
        let handle = self.broker.register_input(self.id, name, false, type_tag)?;
        self.shared
            .inputs
            .lock()
            .unwrap()
            .insert(handle.handle, InputSlot::default());
        Ok(handle.handle)
    }

    pub fn register_global_input(
        &self,
        name: &str,
        type_tag: &str,
    ) -> Result<InterfaceHandle, FederationError> {
        let handle = self.broker.register_input(self.id, name, true, type_tag)?;
        self.shared
            .inputs
            .lock()
            .unwrap()
            .insert(handle.handle, InputSlot::default());
        Ok(handle.handle)
    }

    /// Register an input that tracks the named publication. The publication
    /// may not exist yet; the subscription stays pending until it appears.
    pub fn register_subscription(&self, target: &str) -> Result<InterfaceHandle, FederationError> {
        let input_name = format!("_input_{target}");
        let handle = self.register_input(&input_name, "def")?;
        self.add_target(handle, target)?;
        Ok(handle)
    }

    /// Point an existing input at a publication by name.
    pub fn add_target(
        &self,
        input: InterfaceHandle,
        target: &str,
    ) -> Result<(), FederationError> {
        if !self.shared.inputs.lock().unwrap().contains_key(&input) {
            return Err(FederationError::InvalidHandle(input));
        }
        self.broker
            .add_target(GlobalHandle::new(self.id, input), target)?;
        Ok(())
    }

    pub fn register_endpoint(&self, name: &str) -> Result<InterfaceHandle, FederationError> {
        let handle = self.broker.register_endpoint(self.id, name, false)?;
        self.shared
            .endpoints
            .lock()
            .unwrap()
            .insert(handle.handle, VecDeque::new());
        Ok(handle.handle)
    }

    pub fn register_global_endpoint(&self, name: &str) -> Result<InterfaceHandle, FederationError> {
        let handle = self.broker.register_endpoint(self.id, name, true)?;
        self.shared
            .endpoints
            .lock()
            .unwrap()
            .insert(handle.handle, VecDeque::new());
        Ok(handle.handle)
    }

    pub fn register_filter(&self, name: &str) -> Result<InterfaceHandle, FederationError> {
        let handle = self.broker.register_filter(self.id, name, true)?;
        Ok(handle.handle)
    }

    pub fn set_filter(
        &self,
        filter: InterfaceHandle,
        operation: FilterOperation,
    ) -> Result<(), FilterError> {
        self.broker
            .set_filter_operation(GlobalHandle::new(self.id, filter), operation)
    }

    pub fn add_filter_source_target(
        &self,
        filter: InterfaceHandle,
        endpoint: &str,
    ) -> Result<(), FilterError> {
        self.broker
            .add_filter_source_target(GlobalHandle::new(self.id, filter), endpoint)
    }

    pub fn add_filter_destination_target(
        &self,
        filter: InterfaceHandle,
        endpoint: &str,
    ) -> Result<(), FilterError> {
        self.broker
            .add_filter_destination_target(GlobalHandle::new(self.id, filter), endpoint)
    }

    pub fn remove_filter_target(
        &self,
        filter: InterfaceHandle,
        endpoint: &str,
    ) -> Result<(), FilterError> {
        self.broker
            .remove_filter_target(GlobalHandle::new(self.id, filter), endpoint)
    }

    /// Invoke `callback` whenever the input surfaces a new value.
    pub fn on_input_update(
        &self,
        input: InterfaceHandle,
        callback: impl Fn(InterfaceHandle, Time) + Send + 'static,
    ) -> Result<(), FederationError> {
        if !self.shared.inputs.lock().unwrap().contains_key(&input) {
            return Err(FederationError::InvalidHandle(input));
        }
        self.shared
            .callbacks
            .lock()
            .unwrap()
            .insert(input, Box::new(callback));
        Ok(())
    }

    // ---- data plane ------------------------------------------------------

    /// Publish an opaque value on a publication handle, stamped with the
    /// current granted time. Values published before the executing phase
    /// deliver at startup.
    pub fn publish(
        &self,
        publication: InterfaceHandle,
        payload: impl Into<Bytes>,
    ) -> Result<(), FederationError> {
        if !self
            .publications
            .lock()
            .unwrap()
            .contains_key(&publication)
        {
            return Err(FederationError::InvalidHandle(publication));
        }
        let mut msg = ActionMessage::new(Action::Data, self.id);
        msg.source_handle = publication;
        msg.payload = payload.into();
        msg.action_time = self.current_stamp();
        self.broker.route(msg);
        Ok(())
    }

    /// Latest visible value of an input. Clears the updated flag.
    pub fn get_value(&self, input: InterfaceHandle) -> Result<Bytes, FederationError> {
        let mut inputs = self.shared.inputs.lock().unwrap();
        let slot = inputs
            .get_mut(&input)
            .ok_or(FederationError::InvalidHandle(input))?;
        slot.updated = false;
        Ok(slot.data.clone())
    }

    /// Whether the input received a value since the last `get_value`.
    pub fn is_updated(&self, input: InterfaceHandle) -> Result<bool, FederationError> {
        let inputs = self.shared.inputs.lock().unwrap();
        inputs
            .get(&input)
            .map(|slot| slot.updated)
            .ok_or(FederationError::InvalidHandle(input))
    }

    pub fn get_last_update_time(&self, input: InterfaceHandle) -> Result<Time, FederationError> {
        let inputs = self.shared.inputs.lock().unwrap();
        inputs
            .get(&input)
            .map(|slot| slot.time)
            .ok_or(FederationError::InvalidHandle(input))
    }

    /// Send an opaque message from an endpoint to a named destination
    /// endpoint; it passes the filter pipelines on the way.
    pub fn send_message(
        &self,
        endpoint: InterfaceHandle,
        destination: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), FederationError> {
        if !self.shared.endpoints.lock().unwrap().contains_key(&endpoint) {
            return Err(FederationError::InvalidHandle(endpoint));
        }
        let mut msg = ActionMessage::new(Action::Message, self.id);
        msg.source_handle = endpoint;
        msg.payload = payload.into();
        msg.name = Some(destination.to_owned());
        msg.action_time = self.current_stamp();
        self.broker.route(msg);
        Ok(())
    }

    pub fn has_message(&self, endpoint: InterfaceHandle) -> Result<bool, FederationError> {
        let endpoints = self.shared.endpoints.lock().unwrap();
        endpoints
            .get(&endpoint)
            .map(|queue| !queue.is_empty())
            .ok_or(FederationError::InvalidHandle(endpoint))
    }

    /// Pop the oldest delivered message from an endpoint.
    pub fn get_message(
        &self,
        endpoint: InterfaceHandle,
    ) -> Result<Option<EndpointMessage>, FederationError> {
        let msg = {
            let mut endpoints = self.shared.endpoints.lock().unwrap();
            endpoints
                .get_mut(&endpoint)
                .ok_or(FederationError::InvalidHandle(endpoint))?
                .pop_front()
        };
        if msg.is_some() {
            self.broker
                .message_surfaced(GlobalHandle::new(self.id, endpoint));
        }
        Ok(msg)
    }

    // ---- lifecycle -------------------------------------------------------

    pub async fn enter_initializing_mode(&self) -> Result<(), FederationError> {
        let (nonce, rx) = self.begin_call();
        let mut msg = ActionMessage::new(Action::Register, self.id).to(self.id);
        msg.counter = nonce as i32;
        self.post(msg);
        self.await_notice(nonce, rx, Time::ZERO).await.map(|_| ())
    }

    pub async fn enter_executing_mode(&self) -> Result<(), FederationError> {
        loop {
            match self
                .enter_executing_mode_iterative(IterationRequest::NoIteration)
                .await?
            {
                IterationResult::NextStep => return Ok(()),
                IterationResult::Iterating => continue,
                IterationResult::Halted | IterationResult::Error => {
                    return Err(CoordinationError::FederationErrorState.into())
                }
            }
        }
    }

    pub async fn enter_executing_mode_iterative(
        &self,
        request: IterationRequest,
    ) -> Result<IterationResult, FederationError> {
        let (nonce, rx) = self.begin_call();
        let mut msg = ActionMessage::new(Action::ExecRequest, self.id).to(self.id);
        msg.counter = nonce as i32;
        if request == IterationRequest::ForceIteration {
            msg.flags = msg.flags.with_iteration_requested();
        }
        self.post(msg);
        let notice = self.await_notice(nonce, rx, Time::ZERO).await?;
        Ok(notice.result)
    }

    /// Request an advance to `t`. Returns the granted time, which may be
    /// below `t` for interruptible federates.
    pub async fn request_time(&self, t: Time) -> Result<Time, FederationError> {
        let (granted, _) = self
            .request_time_iterative(t, IterationRequest::NoIteration)
            .await?;
        Ok(granted)
    }

    pub async fn request_time_iterative(
        &self,
        t: Time,
        request: IterationRequest,
    ) -> Result<(Time, IterationResult), FederationError> {
        let (nonce, rx) = self.begin_call();
        let mut msg = ActionMessage::new(Action::TimeRequest, self.id).to(self.id);
        msg.counter = nonce as i32;
        msg.action_time = t;
        if request == IterationRequest::ForceIteration {
            msg.flags = msg.flags.with_iteration_requested();
        }
        if self.config.interruptible {
            msg.flags = msg.flags.with_interruptible();
        }
        self.post(msg);
        let notice = self.await_notice(nonce, rx, t).await?;
        Ok((notice.time, notice.result))
    }

    /// Leave the federation: drain until every peer has acknowledged the
    /// disconnect or the configured timeout elapses.
    pub async fn finalize(&self) -> Result<(), FederationError> {
        let (nonce, rx) = self.begin_call();
        let mut msg = ActionMessage::new(Action::Disconnect, self.id).to(self.id);
        msg.counter = nonce as i32;
        self.post(msg);
        let notice = self.await_notice(nonce, rx, Time::MAX).await?;
        match notice.result {
            IterationResult::Halted => Ok(()),
            _ => Err(CoordinationError::FederationErrorState.into()),
        }
    }

    // ---- plumbing --------------------------------------------------------

    fn begin_call(&self) -> (u64, watch::Receiver<GrantNotice>) {
        let nonce = self.next_nonce.fetch_add(1, Ordering::SeqCst);
        (nonce, self.grant_rx.clone())
    }

    /// Logical time stamped onto outgoing payloads: the granted time once
    /// executing, or a pre-start marker that delivers at the startup grant.
    fn current_stamp(&self) -> Time {
        let notice = self.grant_rx.borrow();
        if notice.phase == Phase::Exec {
            notice.time.max(Time::ZERO)
        } else {
            Time::MIN
        }
    }

    fn post(&self, msg: ActionMessage) {
        if self.to_worker.send(msg).is_err() {
            tracing::error!(id = %self.id, "Federate worker is gone.");
        }
    }

    async fn await_notice(
        &self,
        nonce: u64,
        mut rx: watch::Receiver<GrantNotice>,
        requested: Time,
    ) -> Result<GrantNotice, FederationError> {
        loop {
            match tokio::time::timeout(self.config.granted_wait, rx.changed()).await {
                Err(_) => {
                    // The grant wait expired: tell the worker to fail the
                    // federation and surface the timeout to the caller.
                    let mut fail = ActionMessage::new(Action::Error, self.id).to(self.id);
                    fail.counter = nonce as i32;
                    self.post(fail);
                    return Err(CoordinationError::GrantTimeout { requested }.into());
                }
                Ok(Err(_)) => {
                    return Err(CoordinationError::FederationErrorState.into());
                }
                Ok(Ok(())) => {
                    let notice = rx.borrow().clone();
                    if notice.nonce != nonce {
                        continue;
                    }
                    if notice.error {
                        return Err(CoordinationError::FederationErrorState.into());
                    }
                    return Ok(notice);
                }
            }
        }
    }
}

