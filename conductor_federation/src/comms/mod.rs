//! Route table and transport adapters.
//!
//! The route table maps destination federates to routes and routes to
//! outbound channels. Channels are established lazily from an endpoint
//! identifier string on first transmit. In-order delivery is guaranteed per
//! route; cross-route reordering is reconciled upstream by (source, sequence).

pub mod tcp;

use std::collections::HashMap;

use conductor_core::keys::{FederateId, RouteId};
use tokio::sync::mpsc;

use crate::frame::ProtocolViolation;
use crate::messages::ActionMessage;

#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported endpoint scheme in `{0}`")]
    UnsupportedScheme(String),

    #[error("malformed endpoint `{0}`")]
    MalformedEndpoint(String),

    #[error("no route registered as {0}")]
    UnknownRoute(RouteId),

    #[error("the peer rejected the connection: {0}")]
    Rejected(String),

    #[error("the connection closed unexpectedly")]
    UnexpectedClose,

    #[error("protocol violation: {0}")]
    Violation(#[from] ProtocolViolation),
}

/// A parsed transport endpoint identifier.
///
/// This crate ships working adapters for `tcp` and in-process channels; the
/// remaining schemes parse for configuration purposes and fail at connect
/// time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Zmq(String),
    Ipc(String),
    Inproc(String),
    Mpi { rank: u32, tag: u32 },
}

impl std::str::FromStr for Endpoint {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| CommsError::MalformedEndpoint(s.to_owned()))?;
        match scheme {
            "tcp" => Ok(Self::Tcp(rest.to_owned())),
            "zmq" => Ok(Self::Zmq(rest.to_owned())),
            "ipc" => Ok(Self::Ipc(rest.to_owned())),
            "inproc" => Ok(Self::Inproc(rest.to_owned())),
            "mpi" => {
                let (rank, tag) = rest
                    .split_once(':')
                    .ok_or_else(|| CommsError::MalformedEndpoint(s.to_owned()))?;
                let rank = rank
                    .parse()
                    .map_err(|_| CommsError::MalformedEndpoint(s.to_owned()))?;
                let tag = tag
                    .parse()
                    .map_err(|_| CommsError::MalformedEndpoint(s.to_owned()))?;
                Ok(Self::Mpi { rank, tag })
            }
            _ => Err(CommsError::UnsupportedScheme(s.to_owned())),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Zmq(addr) => write!(f, "zmq://{addr}"),
            Self::Ipc(name) => write!(f, "ipc://{name}"),
            Self::Inproc(name) => write!(f, "inproc://{name}"),
            Self::Mpi { rank, tag } => write!(f, "mpi://{rank}:{tag}"),
        }
    }
}

/// Budget of tolerated protocol violations before a route is torn down.
#[derive(Debug)]
pub struct ViolationBudget {
    seen: u32,
    limit: u32,
}

impl Default for ViolationBudget {
    fn default() -> Self {
        Self { seen: 0, limit: 8 }
    }
}

impl ViolationBudget {
    pub fn new(limit: u32) -> Self {
        Self { seen: 0, limit }
    }

    pub fn seen(&self) -> u32 {
        self.seen
    }

    /// Record a violation; returns true when the route should be torn down.
    pub fn record(&mut self, violation: &ProtocolViolation) -> bool {
        self.seen += 1;
        tracing::warn!(%violation, count = self.seen, "Dropping malformed frame.");
        self.seen >= self.limit
    }
}

#[derive(Debug)]
struct Route {
    connection: String,
    channel: Option<mpsc::UnboundedSender<ActionMessage>>,
}

/// Maps `federate -> route -> channel`.
#[derive(Debug)]
pub struct RouteTable {
    routes: HashMap<RouteId, Route>,
    by_federate: HashMap<FederateId, RouteId>,
    /// Sink for traffic received back over established channels.
    inbound: mpsc::UnboundedSender<ActionMessage>,
}

impl RouteTable {
    pub fn new(inbound: mpsc::UnboundedSender<ActionMessage>) -> Self {
        Self {
            routes: HashMap::new(),
            by_federate: HashMap::new(),
            inbound,
        }
    }

    /// Register a route by its endpoint identifier. The channel is
    /// established lazily on first transmit.
    pub fn add_route(&mut self, route: RouteId, connection: impl Into<String>) {
        self.routes.insert(
            route,
            Route {
                connection: connection.into(),
                channel: None,
            },
        );
    }

    /// Bind an already-established channel, e.g. an in-process queue.
    pub fn bind(&mut self, route: RouteId, channel: mpsc::UnboundedSender<ActionMessage>) {
        self.routes.insert(
            route,
            Route {
                connection: format!("inproc://{}", route),
                channel: Some(channel),
            },
        );
    }

    pub fn set_route_for(&mut self, fed: FederateId, route: RouteId) {
        self.by_federate.insert(fed, route);
    }

    /// The route for a destination; unknown destinations go to the parent.
    pub fn route_for(&self, fed: FederateId) -> RouteId {
        self.by_federate.get(&fed).copied().unwrap_or(RouteId::PARENT)
    }

    pub fn remove_route(&mut self, route: RouteId) {
        self.routes.remove(&route);
        self.by_federate.retain(|_, r| *r != route);
    }

    /// Serialize and enqueue a message on a route, connecting first if the
    /// route is not yet established.
    pub async fn transmit(
        &mut self,
        route: RouteId,
        msg: ActionMessage,
    ) -> Result<(), CommsError> {
        let entry = self
            .routes
            .get_mut(&route)
            .ok_or(CommsError::UnknownRoute(route))?;

        if entry.channel.is_none() {
            let endpoint: Endpoint = entry.connection.parse()?;
            let channel = match endpoint {
                Endpoint::Tcp(addr) => tcp::connect(&addr, self.inbound.clone()).await?.sender,
                other => return Err(CommsError::UnsupportedScheme(other.to_string())),
            };
            entry.channel = Some(channel);
        }

        let channel = entry.channel.as_ref().unwrap();
        if channel.send(msg).is_err() {
            entry.channel = None;
            return Err(CommsError::UnexpectedClose);
        }
        Ok(())
    }

    /// Transmit to a federate via its assigned route. Payload frames that
    /// cannot be delivered are surfaced as missed updates, not errors.
    pub async fn transmit_to(
        &mut self,
        fed: FederateId,
        msg: ActionMessage,
    ) -> Result<(), CommsError> {
        let route = self.route_for(fed);
        let payload = !msg.action.is_control();
        match self.transmit(route, msg).await {
            Err(err) if payload => {
                tracing::warn!(%fed, %err, "Dropped a payload frame; surfacing as a missed update.");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Action;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            "tcp://127.0.0.1:23405".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:23405".into())
        );
        assert_eq!(
            "inproc://broker-0".parse::<Endpoint>().unwrap(),
            Endpoint::Inproc("broker-0".into())
        );
        assert_eq!(
            "mpi://3:7".parse::<Endpoint>().unwrap(),
            Endpoint::Mpi { rank: 3, tag: 7 }
        );
        assert!(matches!(
            "carrier-pigeon://x".parse::<Endpoint>(),
            Err(CommsError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            "tcp:127.0.0.1".parse::<Endpoint>(),
            Err(CommsError::MalformedEndpoint(_))
        ));
    }

    #[test]
    fn violation_budget_trips_at_the_limit() {
        let mut budget = ViolationBudget::new(2);
        let violation = ProtocolViolation::BadVersion(9);
        assert!(!budget.record(&violation));
        assert!(budget.record(&violation));
    }

    #[tokio::test]
    async fn unsupported_scheme_fails_at_connect_time() {
        let (inbound, _rx) = mpsc::unbounded_channel();
        let mut table = RouteTable::new(inbound);
        table.add_route(RouteId::new(1), "zmq://127.0.0.1:5555");

        let msg = ActionMessage::new(Action::Register, FederateId::new(-2));
        assert!(matches!(
            table.transmit(RouteId::new(1), msg).await,
            Err(CommsError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn bound_routes_deliver_in_order() {
        let (inbound, _inbound_rx) = mpsc::unbounded_channel();
        let mut table = RouteTable::new(inbound);
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.bind(RouteId::new(3), tx);
        table.set_route_for(FederateId::new(5), RouteId::new(3));

        for i in 0..4 {
            let msg = ActionMessage::new(Action::Data, FederateId::new(1))
                .to(FederateId::new(5))
                .at(conductor_core::time::Time::from_nanos(i));
            table.transmit_to(FederateId::new(5), msg).await.unwrap();
        }
        for i in 0..4 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.action_time.as_nanos(), i);
        }
    }
}
