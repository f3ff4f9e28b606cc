//! Federation-wide broker state: the name directory, data links, dependency
//! registry, and the in-process message fabric.
//!
//! A broker is an explicit handle (no process-global state): several
//! federations can coexist in one process by holding separate brokers. The
//! name directory is the only structure shared across federates and sits
//! behind a single reader-writer lock.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex, RwLock,
    },
};

use conductor_core::{
    keys::{FederateId, GlobalHandle, InterfaceHandle},
    time::Time,
};
use petgraph::{algo::is_cyclic_directed, graphmap::DiGraphMap};
use tokio::sync::mpsc;

use crate::{
    filters::{EndpointFilters, FilterError, FilterOperation, SharedOperation},
    messages::{Action, ActionMessage},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("duplicate name `{0}`")]
    DuplicateName(String),

    #[error("unknown target `{0}`")]
    UnknownTarget(String),

    #[error("federate {0} is not registered")]
    UnknownFederate(FederateId),

    #[error("zero-delta dependency cycle via `{0}`")]
    ZeroDeltaCycle(String),
}

#[derive(Debug, Clone)]
struct InterfaceMeta {
    type_tag: String,
    unit: Option<String>,
}

#[derive(Debug)]
struct FederateRecord {
    id: FederateId,
    name: String,
    queue: mpsc::UnboundedSender<ActionMessage>,
    min_time_delta: Time,
}

#[derive(Debug)]
struct CoreRecord {
    id: FederateId,
    name: String,
    queue: mpsc::UnboundedSender<ActionMessage>,
}

/// The name directory plus everything needed to route in-process traffic.
#[derive(Debug, Default)]
struct Directory {
    federates: HashMap<FederateId, FederateRecord>,
    federate_names: HashMap<String, FederateId>,
    cores: HashMap<FederateId, CoreRecord>,

    publications: HashMap<String, GlobalHandle>,
    inputs: HashMap<String, GlobalHandle>,
    endpoints: HashMap<String, GlobalHandle>,
    filters: HashMap<String, GlobalHandle>,

    owners: HashMap<GlobalHandle, FederateId>,
    handle_names: HashMap<GlobalHandle, String>,
    meta: HashMap<GlobalHandle, InterfaceMeta>,

    /// publication -> subscribed inputs
    links: HashMap<GlobalHandle, Vec<GlobalHandle>>,
    /// publication name -> inputs waiting for it to appear
    pending_targets: HashMap<String, Vec<GlobalHandle>>,
    /// Explicit broker-installed (publication name, input name) wires.
    /// Additive: links are never removed.
    data_links: Vec<(String, String)>,

    /// (source, dependent) pairs that exist as coordinator dependencies.
    dependency_edges: Vec<(FederateId, FederateId)>,
}

impl Directory {
    fn deliver(&self, dest: FederateId, msg: ActionMessage) {
        if let Some(fed) = self.federates.get(&dest) {
            if fed.queue.send(msg).is_err() {
                tracing::warn!(%dest, "Federate queue closed; dropping message.");
            }
        } else if let Some(core) = self.cores.get(&dest) {
            if core.queue.send(msg).is_err() {
                tracing::warn!(%dest, "Core link closed; dropping message.");
            }
        } else {
            tracing::debug!(%dest, "No destination for message; dropping.");
        }
    }

    /// Interface names are prefixed with the owning federate's name unless
    /// registered as global.
    fn scoped_name(
        &self,
        fed: FederateId,
        name: &str,
        global: bool,
    ) -> Result<String, RegistrationError> {
        if global {
            return Ok(name.to_owned());
        }
        let record = self
            .federates
            .get(&fed)
            .ok_or(RegistrationError::UnknownFederate(fed))?;
        Ok(format!("{}/{}", record.name, name))
    }

    fn min_time_delta(&self, fed: FederateId) -> Time {
        self.federates
            .get(&fed)
            .map(|f| f.min_time_delta)
            .unwrap_or(Time::EPSILON)
    }

    /// Would adding `source -> dependent` close a cycle whose members all
    /// have a zero minimum time delta? Positive deltas guarantee progress
    /// around a cycle; all-zero cycles deadlock and are rejected.
    fn creates_zero_delta_cycle(&self, source: FederateId, dependent: FederateId) -> bool {
        if self.min_time_delta(source) > Time::ZERO
            || self.min_time_delta(dependent) > Time::ZERO
        {
            return false;
        }
        let mut graph: DiGraphMap<i32, ()> = DiGraphMap::new();
        for &(src, dst) in &self.dependency_edges {
            if self.min_time_delta(src) == Time::ZERO && self.min_time_delta(dst) == Time::ZERO {
                graph.add_edge(src.raw(), dst.raw(), ());
            }
        }
        graph.add_edge(source.raw(), dependent.raw(), ());
        is_cyclic_directed(&graph)
    }
}

#[derive(Debug, Default)]
struct FilterRegistry {
    operations: HashMap<GlobalHandle, SharedOperation>,
    chains: HashMap<GlobalHandle, EndpointFilters>,
}

/// The federation broker.
pub struct Broker {
    id: FederateId,
    federation: String,
    state: RwLock<Directory>,
    filters: Mutex<FilterRegistry>,
    /// Messages delivered to a destination endpoint but not yet surfaced by
    /// the application; guards filter target removal.
    in_flight: Mutex<HashMap<GlobalHandle, usize>>,
    next_handle: AtomicI32,
    next_federate: AtomicI32,
    next_core: AtomicI32,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("federation", &self.federation)
            .finish_non_exhaustive()
    }
}

impl Broker {
    pub fn new(federation: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: FederateId::new(-1),
            federation: federation.into(),
            state: RwLock::new(Directory::default()),
            filters: Mutex::new(FilterRegistry::default()),
            in_flight: Mutex::new(HashMap::new()),
            next_handle: AtomicI32::new(0),
            next_federate: AtomicI32::new(0),
            next_core: AtomicI32::new(-2),
        })
    }

    pub fn id(&self) -> FederateId {
        self.id
    }

    pub fn federation(&self) -> &str {
        &self.federation
    }

    fn allocate_handle(&self) -> InterfaceHandle {
        InterfaceHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    // ---- membership -----------------------------------------------------

    /// Register a federate, wiring its inbound queue into the fabric.
    pub fn register_federate(
        &self,
        name: &str,
        min_time_delta: Time,
        queue: mpsc::UnboundedSender<ActionMessage>,
    ) -> Result<FederateId, RegistrationError> {
        let mut state = self.state.write().unwrap();
        if state.federate_names.contains_key(name) {
            return Err(RegistrationError::DuplicateName(name.to_owned()));
        }
        let id = FederateId::new(self.next_federate.fetch_add(1, Ordering::SeqCst));
        state.federate_names.insert(name.to_owned(), id);
        state.federates.insert(
            id,
            FederateRecord {
                id,
                name: name.to_owned(),
                queue,
                min_time_delta,
            },
        );
        tracing::info!(%id, name, "Registered federate.");
        Ok(id)
    }

    /// Remove a federate after it has finalized.
    pub fn deregister_federate(&self, id: FederateId) {
        let mut state = self.state.write().unwrap();
        if let Some(record) = state.federates.remove(&id) {
            state.federate_names.remove(&record.name);
        }
        state.dependency_edges.retain(|&(s, d)| s != id && d != id);
        tracing::info!(%id, "Deregistered federate.");
    }

    /// Attach a child core's outbound queue; assigns the core id and returns
    /// it with the federation id, completing the register handshake.
    pub fn register_core_link(
        &self,
        name: &str,
        queue: mpsc::UnboundedSender<ActionMessage>,
    ) -> Result<(FederateId, String), RegistrationError> {
        let mut state = self.state.write().unwrap();
        if state.cores.values().any(|c| c.name == name) {
            return Err(RegistrationError::DuplicateName(name.to_owned()));
        }
        let id = FederateId::new(self.next_core.fetch_sub(1, Ordering::SeqCst));
        state.cores.insert(
            id,
            CoreRecord {
                id,
                name: name.to_owned(),
                queue,
            },
        );
        Ok((id, self.federation.clone()))
    }

    /// Drop a disconnected core and tell every federate so dependency tables
    /// shrink accordingly.
    pub fn drop_core_link(&self, id: FederateId) {
        let mut state = self.state.write().unwrap();
        if state.cores.remove(&id).is_none() {
            return;
        }
        state.dependency_edges.retain(|&(s, d)| s != id && d != id);
        for fed in state.federates.values() {
            let _ = fed.queue.send(ActionMessage::new(Action::Disconnect, id).to(fed.id));
        }
    }

    // ---- interface registration -----------------------------------------

    pub fn register_publication(
        &self,
        fed: FederateId,
        name: &str,
        global: bool,
        type_tag: &str,
        unit: Option<&str>,
    ) -> Result<GlobalHandle, RegistrationError> {
        let mut state = self.state.write().unwrap();
        let key = state.scoped_name(fed, name, global)?;
        if state.publications.contains_key(&key) {
            return Err(RegistrationError::DuplicateName(key));
        }
        let handle = GlobalHandle::new(fed, self.allocate_handle());
        state.publications.insert(key.clone(), handle);
        state.owners.insert(handle, fed);
        state.handle_names.insert(handle, key.clone());
        state.meta.insert(
            handle,
            InterfaceMeta {
                type_tag: type_tag.to_owned(),
                unit: unit.map(str::to_owned),
            },
        );
        tracing::debug!(%fed, key, "Registered publication.");

        // A publication appearing resolves subscriptions parked on its name
        // and any data links that mention it.
        if let Some(waiting) = state.pending_targets.remove(&key) {
            for input in waiting {
                link(&mut state, handle, input)?;
            }
        }
        let linked: Vec<String> = state
            .data_links
            .iter()
            .filter(|(src, _)| *src == key)
            .map(|(_, dst)| dst.clone())
            .collect();
        for dst in linked {
            if let Some(&input) = state.inputs.get(&dst) {
                link(&mut state, handle, input)?;
            }
        }
        Ok(handle)
    }

    pub fn register_input(
        &self,
        fed: FederateId,
        name: &str,
        global: bool,
        type_tag: &str,
    ) -> Result<GlobalHandle, RegistrationError> {
        let mut state = self.state.write().unwrap();
        let key = state.scoped_name(fed, name, global)?;
        if state.inputs.contains_key(&key) {
            return Err(RegistrationError::DuplicateName(key));
        }
        let handle = GlobalHandle::new(fed, self.allocate_handle());
        state.inputs.insert(key.clone(), handle);
        state.owners.insert(handle, fed);
        state.handle_names.insert(handle, key.clone());
        state.meta.insert(
            handle,
            InterfaceMeta {
                type_tag: type_tag.to_owned(),
                unit: None,
            },
        );
        tracing::debug!(%fed, key, "Registered input.");

        let linked: Vec<String> = state
            .data_links
            .iter()
            .filter(|(_, dst)| *dst == key)
            .map(|(src, _)| src.clone())
            .collect();
        for src in linked {
            if let Some(&publication) = state.publications.get(&src) {
                link(&mut state, publication, handle)?;
            }
        }
        Ok(handle)
    }

    /// Point an input at a publication by name. If the publication does not
    /// exist yet the subscription is pending until it appears.
    pub fn add_target(
        &self,
        input: GlobalHandle,
        target: &str,
    ) -> Result<(), RegistrationError> {
        let mut state = self.state.write().unwrap();
        if let Some(&publication) = state.publications.get(target) {
            link(&mut state, publication, input)
        } else {
            tracing::debug!(target, "Subscription pending on an unpublished name.");
            state
                .pending_targets
                .entry(target.to_owned())
                .or_default()
                .push(input);
            Ok(())
        }
    }

    /// Install an explicit publication-to-input wire, possibly before either
    /// side exists. Links are additive.
    pub fn data_link(&self, source: &str, target: &str) -> Result<(), RegistrationError> {
        let mut state = self.state.write().unwrap();
        state
            .data_links
            .push((source.to_owned(), target.to_owned()));
        let publication = state.publications.get(source).copied();
        let input = state.inputs.get(target).copied();
        if let (Some(publication), Some(input)) = (publication, input) {
            link(&mut state, publication, input)?;
        }
        Ok(())
    }

    pub fn register_endpoint(
        &self,
        fed: FederateId,
        name: &str,
        global: bool,
    ) -> Result<GlobalHandle, RegistrationError> {
        let mut state = self.state.write().unwrap();
        let key = state.scoped_name(fed, name, global)?;
        if state.endpoints.contains_key(&key) {
            return Err(RegistrationError::DuplicateName(key));
        }
        let handle = GlobalHandle::new(fed, self.allocate_handle());
        state.endpoints.insert(key.clone(), handle);
        state.owners.insert(handle, fed);
        state.handle_names.insert(handle, key.clone());
        self.filters
            .lock()
            .unwrap()
            .chains
            .entry(handle)
            .or_default();
        tracing::debug!(%fed, key, "Registered endpoint.");
        Ok(handle)
    }

    pub fn register_filter(
        &self,
        fed: FederateId,
        name: &str,
        global: bool,
    ) -> Result<GlobalHandle, RegistrationError> {
        let mut state = self.state.write().unwrap();
        let key = state.scoped_name(fed, name, global)?;
        if state.filters.contains_key(&key) {
            return Err(RegistrationError::DuplicateName(key));
        }
        let handle = GlobalHandle::new(fed, self.allocate_handle());
        state.filters.insert(key.clone(), handle);
        state.owners.insert(handle, fed);
        state.handle_names.insert(handle, key);
        Ok(handle)
    }

    // ---- filter pipeline wiring ------------------------------------------

    /// Install or replace a filter's operation. Chains already holding the
    /// filter keep their position and see the new operation.
    pub fn set_filter_operation(
        &self,
        filter: GlobalHandle,
        operation: FilterOperation,
    ) -> Result<(), FilterError> {
        let mut registry = self.filters.lock().unwrap();
        match registry.operations.get(&filter) {
            Some(shared) => *shared.lock().unwrap() = operation,
            None => {
                registry
                    .operations
                    .insert(filter, SharedOperation::new(operation.into()));
            }
        }
        Ok(())
    }

    pub fn add_filter_source_target(
        &self,
        filter: GlobalHandle,
        endpoint: &str,
    ) -> Result<(), FilterError> {
        self.attach_filter(filter, endpoint, true)
    }

    pub fn add_filter_destination_target(
        &self,
        filter: GlobalHandle,
        endpoint: &str,
    ) -> Result<(), FilterError> {
        self.attach_filter(filter, endpoint, false)
    }

    fn attach_filter(
        &self,
        filter: GlobalHandle,
        endpoint: &str,
        source: bool,
    ) -> Result<(), FilterError> {
        let handle = self.endpoint_handle(endpoint)?;
        let mut registry = self.filters.lock().unwrap();
        let operation = registry
            .operations
            .get(&filter)
            .cloned()
            .ok_or_else(|| FilterError::UnknownFilter(format!("{filter}")))?;
        let chains = registry.chains.entry(handle).or_default();
        let chain = if source {
            &mut chains.source
        } else {
            &mut chains.destination
        };
        chain.push_shared(filter.handle, operation);
        Ok(())
    }

    /// Detach a filter from an endpoint, symmetrically for source and
    /// destination chains. Refused while messages are still in flight to the
    /// endpoint to avoid lost deliveries.
    pub fn remove_filter_target(
        &self,
        filter: GlobalHandle,
        endpoint: &str,
    ) -> Result<(), FilterError> {
        let handle = self.endpoint_handle(endpoint)?;
        if self
            .in_flight
            .lock()
            .unwrap()
            .get(&handle)
            .copied()
            .unwrap_or(0)
            > 0
        {
            return Err(FilterError::TargetBusy(endpoint.to_owned()));
        }
        let mut registry = self.filters.lock().unwrap();
        if let Some(chains) = registry.chains.get_mut(&handle) {
            let detached = chains.source.detach(filter.handle);
            if !(chains.destination.detach(filter.handle) || detached) {
                tracing::debug!(endpoint, "Filter was not attached to the endpoint.");
            }
        }
        Ok(())
    }

    fn endpoint_handle(&self, endpoint: &str) -> Result<GlobalHandle, FilterError> {
        self.state
            .read()
            .unwrap()
            .endpoints
            .get(endpoint)
            .copied()
            .ok_or_else(|| FilterError::UnknownEndpoint(endpoint.to_owned()))
    }

    /// Called when the application pops a delivered message off an endpoint.
    pub fn message_surfaced(&self, endpoint: GlobalHandle) {
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(&endpoint) {
            *count = count.saturating_sub(1);
        }
    }

    // ---- the fabric ------------------------------------------------------

    /// Route one hop of federation traffic.
    pub fn route(&self, msg: ActionMessage) {
        match msg.action {
            Action::Data => self.route_data(msg),
            Action::Message => self.route_message(msg),
            _ if msg.dest_id == self.id => self.handle_own(msg),
            _ => self.state.read().unwrap().deliver(msg.dest_id, msg),
        }
    }

    fn handle_own(&self, msg: ActionMessage) {
        match msg.action {
            Action::Disconnect => self.deregister_federate(msg.source_id),
            _ => tracing::debug!(%msg, "Broker ignoring message."),
        }
    }

    /// Fan a published value out to every linked input.
    fn route_data(&self, msg: ActionMessage) {
        let state = self.state.read().unwrap();
        let source = GlobalHandle::new(msg.source_id, msg.source_handle);
        let Some(targets) = state.links.get(&source) else {
            tracing::trace!(%source, "Publication has no subscribers.");
            return;
        };
        for &input in targets {
            let Some(&owner) = state.owners.get(&input) else {
                continue;
            };
            let mut copy = msg.clone();
            copy.dest_id = owner;
            copy.dest_handle = input.handle;
            state.deliver(owner, copy);
        }
    }

    /// Push an endpoint message through the source chain, resolve each
    /// output's destination, run its destination chain, and deliver.
    fn route_message(&self, msg: ActionMessage) {
        let source = GlobalHandle::new(msg.source_id, msg.source_handle);
        let outputs = {
            let mut registry = self.filters.lock().unwrap();
            match registry.chains.get_mut(&source) {
                Some(chains) if !chains.source.is_empty() => chains.source.apply(msg),
                _ => vec![msg],
            }
        };
        for out in outputs {
            self.deliver_message(out);
        }
    }

    fn deliver_message(&self, msg: ActionMessage) {
        let dest = {
            let state = self.state.read().unwrap();
            let Some(name) = msg.name.as_deref() else {
                tracing::warn!(%msg, "Endpoint message without a destination name.");
                return;
            };
            match state.endpoints.get(name) {
                Some(&handle) => handle,
                None => {
                    tracing::warn!(name, "Message for an unknown endpoint; dropping.");
                    return;
                }
            }
        };

        let finals = {
            let mut registry = self.filters.lock().unwrap();
            match registry.chains.get_mut(&dest) {
                Some(chains) if !chains.destination.is_empty() => {
                    chains.destination.apply(msg)
                }
                _ => vec![msg],
            }
        };

        let state = self.state.read().unwrap();
        let dest_name = state.handle_names.get(&dest).cloned();
        for mut out in finals {
            // A destination-side reroute re-resolves once, without another
            // pass through filter chains.
            let handle = if out.name.as_deref() == dest_name.as_deref() {
                dest
            } else {
                match out.name.as_deref().and_then(|n| state.endpoints.get(n)) {
                    Some(&handle) => handle,
                    None => {
                        tracing::warn!(?out.name, "Rerouted to an unknown endpoint; dropping.");
                        continue;
                    }
                }
            };
            let Some(&owner) = state.owners.get(&handle) else {
                continue;
            };
            out.dest_id = owner;
            out.dest_handle = handle.handle;
            *self.in_flight.lock().unwrap().entry(handle).or_insert(0) += 1;
            state.deliver(owner, out);
        }
    }

    /// Interface metadata (declared type tag and unit) for a handle.
    pub fn interface_type(&self, handle: GlobalHandle) -> Option<(String, Option<String>)> {
        self.state
            .read()
            .unwrap()
            .meta
            .get(&handle)
            .map(|m| (m.type_tag.clone(), m.unit.clone()))
    }

    /// JSON snapshot of federation membership, written by brokers on request.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read().unwrap();
        let mut federates: Vec<_> = state
            .federates
            .values()
            .map(|f| serde_json::json!({ "id": f.id.raw(), "name": f.name }))
            .collect();
        federates.sort_by_key(|v| v["id"].as_i64());
        let mut cores: Vec<_> = state
            .cores
            .values()
            .map(|c| serde_json::json!({ "id": c.id.raw(), "name": c.name }))
            .collect();
        cores.sort_by_key(|v| v["id"].as_i64());

        let sorted_names = |map: &HashMap<String, GlobalHandle>| {
            let mut names: Vec<_> = map.keys().cloned().collect();
            names.sort();
            names
        };

        serde_json::json!({
            "federation": self.federation,
            "broker": self.id.raw(),
            "federates": federates,
            "cores": cores,
            "publications": sorted_names(&state.publications),
            "inputs": sorted_names(&state.inputs),
            "endpoints": sorted_names(&state.endpoints),
            "filters": sorted_names(&state.filters),
            "data_links": state.data_links,
        })
    }
}

/// Wire a publication to an input and create the corresponding dependency
/// edge between their owners. Idempotent per pair; links are additive.
fn link(
    state: &mut Directory,
    publication: GlobalHandle,
    input: GlobalHandle,
) -> Result<(), RegistrationError> {
    let already = state
        .links
        .get(&publication)
        .map(|targets| targets.contains(&input))
        .unwrap_or(false);
    if already {
        return Ok(());
    }

    let source = *state
        .owners
        .get(&publication)
        .expect("publication without an owner");
    let dependent = *state.owners.get(&input).expect("input without an owner");

    // Same-federate loops deliver locally and impose no time dependency.
    if source != dependent && !state.dependency_edges.contains(&(source, dependent)) {
        if state.creates_zero_delta_cycle(source, dependent) {
            let name = state
                .handle_names
                .get(&publication)
                .cloned()
                .unwrap_or_default();
            return Err(RegistrationError::ZeroDeltaCycle(name));
        }
        state.dependency_edges.push((source, dependent));
        state.deliver(
            dependent,
            ActionMessage::new(Action::AddDependency, source).to(dependent),
        );
        state.deliver(
            source,
            ActionMessage::new(Action::AddDependent, dependent).to(source),
        );
    }

    state.links.entry(publication).or_default().push(input);
    tracing::debug!(%publication, %input, "Linked publication to input.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn federate(
        broker: &Arc<Broker>,
        name: &str,
        delta: Time,
    ) -> (FederateId, mpsc::UnboundedReceiver<ActionMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = broker.register_federate(name, delta, tx).unwrap();
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ActionMessage>) -> Vec<ActionMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test_log::test(tokio::test)]
    async fn scoped_and_global_names() {
        let broker = Broker::new("naming");
        let (fed, _rx) = federate(&broker, "fed0", Time::EPSILON);

        broker
            .register_publication(fed, "pub1", false, "string", None)
            .unwrap();
        let global = broker
            .register_publication(fed, "pub2", true, "int32", Some("V"))
            .unwrap();

        let snapshot = broker.snapshot();
        let names = snapshot["publications"].as_array().unwrap();
        assert!(names.contains(&serde_json::json!("fed0/pub1")));
        assert!(names.contains(&serde_json::json!("pub2")));
        assert_eq!(
            broker.interface_type(global),
            Some(("int32".to_owned(), Some("V".to_owned())))
        );
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_names_are_rejected_without_breaking_the_federate() {
        let broker = Broker::new("dups");
        let (fed, _rx) = federate(&broker, "fed0", Time::EPSILON);

        broker
            .register_publication(fed, "pub1", true, "string", None)
            .unwrap();
        assert!(matches!(
            broker.register_publication(fed, "pub1", true, "string", None),
            Err(RegistrationError::DuplicateName(_))
        ));
        // The federate remains usable.
        broker
            .register_publication(fed, "pub2", true, "string", None)
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn pending_subscription_resolves_when_the_publication_appears() {
        let broker = Broker::new("pending");
        let (f1, mut rx1) = federate(&broker, "fed0", Time::EPSILON);
        let (f2, mut rx2) = federate(&broker, "fed1", Time::EPSILON);

        let input = broker.register_input(f2, "inp", false, "string").unwrap();
        broker.add_target(input, "pub1").unwrap();
        // Nothing linked yet.
        assert!(drain(&mut rx2).is_empty());

        broker
            .register_publication(f1, "pub1", true, "string", None)
            .unwrap();
        let to_subscriber = drain(&mut rx2);
        assert!(to_subscriber
            .iter()
            .any(|m| m.action == Action::AddDependency && m.source_id == f1));
        let to_publisher = drain(&mut rx1);
        assert!(to_publisher
            .iter()
            .any(|m| m.action == Action::AddDependent && m.source_id == f2));
    }

    #[test_log::test(tokio::test)]
    async fn data_link_installs_before_either_endpoint_exists() {
        let broker = Broker::new("datalink");
        broker.data_link("pub1", "inp1").unwrap();

        let (f1, _rx1) = federate(&broker, "fed0", Time::EPSILON);
        let (f2, mut rx2) = federate(&broker, "fed1", Time::EPSILON);

        let publication = broker
            .register_publication(f1, "pub1", true, "string", None)
            .unwrap();
        broker.register_input(f2, "inp1", true, "string").unwrap();
        assert!(drain(&mut rx2)
            .iter()
            .any(|m| m.action == Action::AddDependency && m.source_id == f1));

        // Publishing now reaches fed1's input.
        let mut data = ActionMessage::new(Action::Data, f1).at(Time::ZERO);
        data.source_handle = publication.handle;
        broker.route(data);
        assert!(drain(&mut rx2).iter().any(|m| m.action == Action::Data));
    }

    #[test_log::test(tokio::test)]
    async fn zero_delta_cycles_are_rejected_at_registration() {
        let broker = Broker::new("cycles");
        let (f1, _rx1) = federate(&broker, "fed0", Time::ZERO);
        let (f2, _rx2) = federate(&broker, "fed1", Time::ZERO);

        broker
            .register_publication(f1, "a_out", true, "double", None)
            .unwrap();
        broker
            .register_publication(f2, "b_out", true, "double", None)
            .unwrap();
        let b_in = broker.register_input(f2, "b_in", true, "double").unwrap();
        let a_in = broker.register_input(f1, "a_in", true, "double").unwrap();

        broker.add_target(b_in, "a_out").unwrap();
        // Closing the loop with both deltas at zero must fail.
        assert!(matches!(
            broker.add_target(a_in, "b_out"),
            Err(RegistrationError::ZeroDeltaCycle(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn positive_delta_cycles_are_allowed() {
        let broker = Broker::new("cycles-ok");
        let (f1, _rx1) = federate(&broker, "fed0", Time::from_seconds(1.0));
        let (f2, _rx2) = federate(&broker, "fed1", Time::from_seconds(1.0));

        broker
            .register_publication(f1, "a_out", true, "double", None)
            .unwrap();
        broker
            .register_publication(f2, "b_out", true, "double", None)
            .unwrap();
        let b_in = broker.register_input(f2, "b_in", true, "double").unwrap();
        let a_in = broker.register_input(f1, "a_in", true, "double").unwrap();

        broker.add_target(b_in, "a_out").unwrap();
        broker.add_target(a_in, "b_out").unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn busy_filter_targets_cannot_be_removed() {
        let broker = Broker::new("filters");
        let (f1, mut rx1) = federate(&broker, "fed0", Time::EPSILON);
        let ep = broker.register_endpoint(f1, "ep1", true).unwrap();
        let filter = broker.register_filter(f1, "delay1", true).unwrap();
        broker
            .set_filter_operation(filter, FilterOperation::delay(Time::from_seconds(0.5)))
            .unwrap();
        broker.add_filter_destination_target(filter, "ep1").unwrap();

        // Deliver a message to the endpoint; it is now in flight.
        let msg = ActionMessage::new(Action::Message, f1)
            .at(Time::from_seconds(1.0))
            .with_name("ep1");
        broker.route(msg);
        assert!(matches!(
            broker.remove_filter_target(filter, "ep1"),
            Err(FilterError::TargetBusy(_))
        ));

        // Once the application surfaces it, removal succeeds.
        assert!(drain(&mut rx1).iter().any(|m| m.action == Action::Message));
        broker.message_surfaced(ep);
        broker.remove_filter_target(filter, "ep1").unwrap();
    }
}
