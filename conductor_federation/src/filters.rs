//! Ordered transforms applied to in-flight messages at endpoint boundaries.
//!
//! Each endpoint carries two chains: source filters run when a message leaves
//! the endpoint, destination filters on arrival. Non-cloning filters produce
//! zero or one message; cloning filters emit the original untouched plus one
//! copy per extra target. Random filters draw from a seeded generator so a
//! replayed iteration produces identical outcomes.

use conductor_core::{keys::InterfaceHandle, time::Time};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::messages::ActionMessage;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("filter target `{0}` has messages in flight")]
    TargetBusy(String),

    #[error("unknown endpoint `{0}`")]
    UnknownEndpoint(String),

    #[error("unknown filter `{0}`")]
    UnknownFilter(String),
}

/// A user-supplied message operator.
pub trait FilterOperator: Send {
    /// Transform one message into zero or more messages. The first output is
    /// treated as the primary delivery.
    fn process(&mut self, msg: ActionMessage) -> Vec<ActionMessage>;
}

impl<F> FilterOperator for F
where
    F: FnMut(ActionMessage) -> Vec<ActionMessage> + Send,
{
    fn process(&mut self, msg: ActionMessage) -> Vec<ActionMessage> {
        self(msg)
    }
}

/// The defined filter kinds.
pub enum FilterOperation {
    /// Shift delivery time by a fixed amount.
    Delay(Time),
    /// Shift delivery time by a normally distributed amount.
    RandomDelay {
        mean: Time,
        stddev: Time,
        rng: StdRng,
    },
    /// Drop the message with the given probability.
    RandomDrop { probability: f64, rng: StdRng },
    /// Redirect matching messages to another endpoint.
    Reroute {
        target: String,
        /// Destination-name prefix that must match for the reroute to apply;
        /// `None` reroutes everything.
        condition: Option<String>,
    },
    /// Deliver the original plus a copy to each extra target.
    Clone { targets: Vec<String> },
    /// Pass only messages the predicate accepts.
    Firewall(Box<dyn Fn(&ActionMessage) -> bool + Send>),
    /// A user-supplied operator.
    Custom(Box<dyn FilterOperator>),
}

impl std::fmt::Debug for FilterOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delay(t) => f.debug_tuple("Delay").field(t).finish(),
            Self::RandomDelay { mean, stddev, .. } => f
                .debug_struct("RandomDelay")
                .field("mean", mean)
                .field("stddev", stddev)
                .finish_non_exhaustive(),
            Self::RandomDrop { probability, .. } => f
                .debug_struct("RandomDrop")
                .field("probability", probability)
                .finish_non_exhaustive(),
            Self::Reroute { target, condition } => f
                .debug_struct("Reroute")
                .field("target", target)
                .field("condition", condition)
                .finish(),
            Self::Clone { targets } => f.debug_struct("Clone").field("targets", targets).finish(),
            Self::Firewall(_) => f.write_str("Firewall(..)"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FilterOperation {
    pub fn delay(delay: Time) -> Self {
        Self::Delay(delay)
    }

    pub fn random_delay(mean: Time, stddev: Time, seed: u64) -> Self {
        Self::RandomDelay {
            mean,
            stddev,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn random_drop(probability: f64, seed: u64) -> Self {
        Self::RandomDrop {
            probability,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn reroute(target: impl Into<String>, condition: Option<String>) -> Self {
        Self::Reroute {
            target: target.into(),
            condition,
        }
    }

    pub fn clone_to(targets: Vec<String>) -> Self {
        Self::Clone { targets }
    }

    pub fn firewall(predicate: impl Fn(&ActionMessage) -> bool + Send + 'static) -> Self {
        Self::Firewall(Box::new(predicate))
    }

    pub fn custom(operator: impl FilterOperator + 'static) -> Self {
        Self::Custom(Box::new(operator))
    }

    pub const fn is_cloning(&self) -> bool {
        matches!(self, Self::Clone { .. })
    }

    /// Apply the filter to one message.
    pub fn apply(&mut self, msg: ActionMessage) -> Vec<ActionMessage> {
        match self {
            Self::Delay(delay) => {
                let mut msg = msg;
                msg.action_time = msg.action_time.saturating_add(*delay);
                vec![msg]
            }
            Self::RandomDelay { mean, stddev, rng } => {
                let mut msg = msg;
                // Irwin-Hall approximation of a standard normal draw.
                let normal: f64 = (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0;
                let delay = mean.as_seconds() + stddev.as_seconds() * normal;
                let delay = Time::from_seconds(delay.max(0.0));
                msg.action_time = msg.action_time.saturating_add(delay);
                vec![msg]
            }
            Self::RandomDrop { probability, rng } => {
                if rng.gen::<f64>() < *probability {
                    vec![]
                } else {
                    vec![msg]
                }
            }
            Self::Reroute { target, condition } => {
                let matches = match (condition.as_deref(), msg.name.as_deref()) {
                    (Some(prefix), Some(dest)) => dest.starts_with(prefix),
                    (Some(_), None) => false,
                    (None, _) => true,
                };
                let mut msg = msg;
                if matches {
                    msg.name = Some(target.clone());
                    msg.dest_handle = InterfaceHandle::INVALID;
                }
                vec![msg]
            }
            Self::Clone { targets } => {
                // The original always leads; clones must not mutate it.
                let mut out = Vec::with_capacity(1 + targets.len());
                for target in targets.iter() {
                    let mut copy = msg.clone();
                    copy.name = Some(target.clone());
                    copy.dest_handle = InterfaceHandle::INVALID;
                    out.push(copy);
                }
                out.insert(0, msg);
                out
            }
            Self::Firewall(predicate) => {
                if predicate(&msg) {
                    vec![msg]
                } else {
                    vec![]
                }
            }
            Self::Custom(operator) => operator.process(msg),
        }
    }
}

/// A filter operation shared between the registry and every chain the filter
/// is attached to.
pub type SharedOperation = std::sync::Arc<std::sync::Mutex<FilterOperation>>;

/// One registered filter stage within a chain.
#[derive(Debug)]
pub struct FilterStage {
    pub handle: InterfaceHandle,
    pub operation: SharedOperation,
}

/// A totally ordered chain of filters; the order is registration order.
#[derive(Debug, Default)]
pub struct FilterChain {
    stages: Vec<FilterStage>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn push(&mut self, handle: InterfaceHandle, operation: FilterOperation) {
        self.push_shared(handle, SharedOperation::new(operation.into()));
    }

    pub fn push_shared(&mut self, handle: InterfaceHandle, operation: SharedOperation) {
        self.stages.push(FilterStage { handle, operation });
    }

    /// Detach a filter from this chain. Returns false if it was not attached.
    pub fn detach(&mut self, handle: InterfaceHandle) -> bool {
        let len = self.stages.len();
        self.stages.retain(|s| s.handle != handle);
        self.stages.len() != len
    }

    pub fn contains(&self, handle: InterfaceHandle) -> bool {
        self.stages.iter().any(|s| s.handle == handle)
    }

    /// Run a message through every stage in order. Cloning stages fan out;
    /// later stages see every message produced by earlier ones.
    pub fn apply(&mut self, msg: ActionMessage) -> Vec<ActionMessage> {
        let mut current = vec![msg];
        for stage in &mut self.stages {
            let mut operation = stage.operation.lock().unwrap();
            let mut next = Vec::with_capacity(current.len());
            for msg in current {
                next.extend(operation.apply(msg));
            }
            current = next;
        }
        current
    }
}

/// The source and destination chains attached to one endpoint.
#[derive(Debug, Default)]
pub struct EndpointFilters {
    pub source: FilterChain,
    pub destination: FilterChain,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use conductor_core::keys::FederateId;
    use crate::messages::Action;

    fn message(dest: &str, at: f64) -> ActionMessage {
        ActionMessage::new(Action::Message, FederateId::new(1))
            .at(Time::from_seconds(at))
            .with_payload(Bytes::from_static(b"ping"))
            .with_name(dest)
    }

    #[test]
    fn delay_shifts_delivery_time() {
        let mut op = FilterOperation::delay(Time::from_seconds(0.5));
        let out = op.apply(message("ep2", 1.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action_time, Time::from_seconds(1.5));
    }

    #[test]
    fn clone_preserves_the_original() {
        let mut op = FilterOperation::clone_to(vec!["spy1".into(), "spy2".into()]);
        let original = message("ep2", 1.0);
        let out = op.apply(original.clone());

        assert_eq!(out.len(), 3);
        assert_eq!(out[0], original);
        assert_eq!(out[1].name.as_deref(), Some("spy1"));
        assert_eq!(out[2].name.as_deref(), Some("spy2"));
        assert_eq!(out[1].payload, original.payload);
        assert_eq!(out[1].action_time, original.action_time);
    }

    #[test]
    fn reroute_honors_its_condition() {
        let mut op = FilterOperation::reroute("detour", Some("ep".into()));
        let out = op.apply(message("ep2", 1.0));
        assert_eq!(out[0].name.as_deref(), Some("detour"));

        let out = op.apply(message("other", 1.0));
        assert_eq!(out[0].name.as_deref(), Some("other"));
    }

    #[test]
    fn firewall_drops_rejected_messages() {
        let mut op = FilterOperation::firewall(|msg: &ActionMessage| !msg.payload.is_empty());
        assert_eq!(op.apply(message("ep2", 1.0)).len(), 1);

        let mut empty = message("ep2", 1.0);
        empty.payload = Bytes::new();
        assert!(op.apply(empty).is_empty());
    }

    #[test]
    fn seeded_random_filters_replay_identically() {
        let run = |seed: u64| -> Vec<bool> {
            let mut op = FilterOperation::random_drop(0.5, seed);
            (0..64)
                .map(|i| !op.apply(message("ep2", i as f64)).is_empty())
                .collect()
        };
        assert_eq!(run(7), run(7));
        assert_ne!(run(7), run(8));

        let delays = |seed: u64| -> Vec<Time> {
            let mut op =
                FilterOperation::random_delay(Time::from_seconds(0.5), Time::from_seconds(0.1), seed);
            (0..16)
                .map(|i| op.apply(message("ep2", i as f64))[0].action_time)
                .collect()
        };
        assert_eq!(delays(3), delays(3));
    }

    #[test]
    fn chain_applies_in_registration_order() {
        let mut chain = FilterChain::new();
        chain.push(
            InterfaceHandle::new(1),
            FilterOperation::delay(Time::from_seconds(0.5)),
        );
        chain.push(
            InterfaceHandle::new(2),
            FilterOperation::firewall(|msg: &ActionMessage| {
                msg.action_time < Time::from_seconds(2.0)
            }),
        );

        // 1.0 -> delayed to 1.5, passes the firewall.
        assert_eq!(chain.apply(message("ep2", 1.0)).len(), 1);
        // 1.8 -> delayed to 2.3, dropped by the firewall. Swapping the order
        // would have passed it, so chain order is observable.
        assert!(chain.apply(message("ep2", 1.8)).is_empty());
    }

    #[test]
    fn cloning_stage_fans_out_through_later_stages() {
        let mut chain = FilterChain::new();
        chain.push(
            InterfaceHandle::new(1),
            FilterOperation::clone_to(vec!["spy".into()]),
        );
        chain.push(
            InterfaceHandle::new(2),
            FilterOperation::delay(Time::from_seconds(1.0)),
        );

        let out = chain.apply(message("ep2", 1.0));
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|m| m.action_time == Time::from_seconds(2.0)));
    }

    #[test]
    fn detach_is_order_preserving() {
        let mut chain = FilterChain::new();
        chain.push(InterfaceHandle::new(1), FilterOperation::delay(Time::EPSILON));
        chain.push(InterfaceHandle::new(2), FilterOperation::delay(Time::EPSILON));
        assert!(chain.detach(InterfaceHandle::new(1)));
        assert!(!chain.detach(InterfaceHandle::new(1)));
        assert!(chain.contains(InterfaceHandle::new(2)));
    }
}
