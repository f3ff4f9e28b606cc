//! Federation message fabric and time coordination.
//!
//! A federation is a set of independent simulators ("federates") that exchange
//! timestamped values and messages while advancing a shared logical clock. The
//! pieces here are the per-federate [`coordinator::TimeCoordinator`] state
//! machine, the [`broker::Broker`] that owns the federation-wide name
//! directory and routes traffic, the [`comms`] transport layer, the
//! [`filters`] pipeline interposed on message endpoints, and the user-facing
//! [`federate::Federate`] interface.

pub mod broker;
pub mod comms;
pub mod config;
pub mod coordinator;
pub mod dependencies;
pub mod federate;
pub mod filters;
pub mod frame;
pub mod messages;

pub use broker::Broker;
pub use config::{CoreConfig, CoreType, FederateConfig};
pub use coordinator::{Phase, TimeCoordinator, Timing};
pub use dependencies::{Convergence, DependencyInfo, DependencyTable};
pub use federate::{EndpointMessage, Federate, IterationRequest, IterationResult};
pub use filters::FilterOperation;
pub use messages::{Action, ActionMessage, MessageFlags};

use conductor_core::keys::InterfaceHandle;

/// Top-level error type covering the federation error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("registration failed: {0}")]
    Registration(#[from] broker::RegistrationError),

    #[error("connection failed: {0}")]
    Connection(#[from] comms::CommsError),

    #[error("time coordination failed: {0}")]
    TimeCoordination(#[from] coordinator::CoordinationError),

    #[error("filter error: {0}")]
    Filter(#[from] filters::FilterError),

    #[error("invalid handle: {0}")]
    InvalidHandle(InterfaceHandle),
}
