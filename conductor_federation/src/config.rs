//! Configuration records consumed by brokers, cores, and federates.

use std::time::Duration;

use conductor_core::time::Time;
use serde::{Deserialize, Serialize};

/// Transport selection for a core or broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreType {
    Tcp,
    Zmq,
    Ipc,
    Mpi,
    /// In-process fabric, used by single-process federations and tests.
    #[default]
    Test,
}

impl std::str::FromStr for CoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "zmq" => Ok(Self::Zmq),
            "ipc" => Ok(Self::Ipc),
            "mpi" => Ok(Self::Mpi),
            "test" => Ok(Self::Test),
            other => Err(format!("unknown core type `{other}`")),
        }
    }
}

impl std::fmt::Display for CoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Tcp => "tcp",
            Self::Zmq => "zmq",
            Self::Ipc => "ipc",
            Self::Mpi => "mpi",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}

/// Configuration record for a core or broker process, typically assembled
/// from the command line by an external wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Federate or broker name.
    pub name: String,
    pub core_type: CoreType,
    /// Address of the parent broker, if any.
    pub broker: Option<String>,
    /// Expected child count for a broker.
    pub federates: usize,
    /// Connection and shutdown timeout.
    pub timeout: Duration,
    /// Verbosity, 0..=7.
    pub log_level: u8,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name: "conductor".to_owned(),
            core_type: CoreType::Test,
            broker: None,
            federates: 1,
            timeout: Duration::from_secs(30),
            log_level: 3,
        }
    }
}

/// Per-federate timing and naming configuration.
#[derive(Debug, Clone)]
pub struct FederateConfig {
    pub name: String,
    /// Grants snap up onto this grid when non-zero.
    pub period: Time,
    /// Anchor of the period grid.
    pub offset: Time,
    /// Minimum advance between consecutive grants. Must be positive for any
    /// federate participating in a dependency cycle.
    pub min_time_delta: Time,
    /// Requests may be granted below their target when an earlier external
    /// event arrives.
    pub interruptible: bool,
    /// Upper bound on how long a blocking call may wait for its grant.
    pub granted_wait: Duration,
}

impl FederateConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            period: Time::ZERO,
            offset: Time::ZERO,
            min_time_delta: Time::EPSILON,
            interruptible: false,
            granted_wait: Duration::from_secs(5),
        }
    }

    pub fn with_period(mut self, period: Time) -> Self {
        self.period = period;
        self
    }

    pub fn with_offset(mut self, offset: Time) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_min_time_delta(mut self, delta: Time) -> Self {
        self.min_time_delta = delta;
        self
    }

    pub fn interruptible(mut self) -> Self {
        self.interruptible = true;
        self
    }

    pub fn with_granted_wait(mut self, wait: Duration) -> Self {
        self.granted_wait = wait;
        self
    }
}
