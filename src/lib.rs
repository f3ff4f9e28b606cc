//! Conductor is a distributed time-coordination core for co-simulation: it
//! hosts independent simulators ("federates") that exchange typed values and
//! discrete messages while advancing a shared logical clock.
//!
//! ## Example
//!
//! A single federate publishing to itself through the in-process fabric:
//!
//! ```no_run
//! use conductor::core::time::Time;
//! use conductor::federation::{Broker, Federate, FederateConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::new("demo");
//!     let fed = Federate::create(
//!         &broker,
//!         FederateConfig::new("fed0").with_min_time_delta(Time::from_seconds(1.0)),
//!     )?;
//!     let pub1 = fed.register_global_publication("pub1", "string", None)?;
//!     let sub1 = fed.register_subscription("pub1")?;
//!
//!     fed.enter_executing_mode().await?;
//!     fed.publish(pub1, &b"string1"[..])?;
//!     let granted = fed.request_time(Time::from_seconds(1.0)).await?;
//!     assert_eq!(granted, Time::from_seconds(1.0));
//!     assert_eq!(fed.get_value(sub1)?.as_ref(), b"string1");
//!     fed.finalize().await?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "runner")]
pub mod runner;

// Re-exports
pub use conductor_core as core;
pub use conductor_federation as federation;
