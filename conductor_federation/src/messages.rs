//! The action message: the tagged, timestamped record carried on every hop of
//! the federation fabric, and the sequence ledger that makes control-frame
//! replay idempotent.

use std::collections::HashMap;

use bytes::Bytes;
use conductor_core::{
    keys::{FederateId, InterfaceHandle},
    time::Time,
};
use serde::{Deserialize, Serialize};

/// Kind of an [`ActionMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Action {
    TimeRequest = 1,
    TimeGrant = 2,
    ExecRequest = 3,
    ExecGrant = 4,
    Data = 5,
    Message = 6,
    Register = 7,
    RegisterReply = 8,
    Disconnect = 9,
    DisconnectAck = 10,
    Error = 11,
    AddDependency = 12,
    AddDependent = 13,
}

impl Action {
    pub fn from_wire(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::TimeRequest,
            2 => Self::TimeGrant,
            3 => Self::ExecRequest,
            4 => Self::ExecGrant,
            5 => Self::Data,
            6 => Self::Message,
            7 => Self::Register,
            8 => Self::RegisterReply,
            9 => Self::Disconnect,
            10 => Self::DisconnectAck,
            11 => Self::Error,
            12 => Self::AddDependency,
            13 => Self::AddDependent,
            _ => return None,
        })
    }

    pub const fn to_wire(self) -> u16 {
        self as u16
    }

    /// Control actions, as opposed to payload-bearing `Data`/`Message`
    /// frames, which are ordered by time and surfaced as missed updates when
    /// they cannot be delivered.
    pub const fn is_control(self) -> bool {
        !matches!(self, Self::Data | Self::Message)
    }

    /// Actions subject to sequence-counter replay suppression: the time and
    /// exec protocol streams. Registration and disconnect traffic is
    /// idempotent by construction and passes unsequenced.
    pub const fn is_sequenced(self) -> bool {
        matches!(
            self,
            Self::TimeRequest | Self::TimeGrant | Self::ExecRequest | Self::ExecGrant | Self::Error
        )
    }
}

/// Bitset of per-message flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MessageFlags(u16);

impl MessageFlags {
    const ITERATION_REQUESTED: u16 = 1 << 0;
    const REQUIRED: u16 = 1 << 1;
    const INTERRUPTIBLE: u16 = 1 << 2;
    const ERROR: u16 = 1 << 3;

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn iteration_requested(self) -> bool {
        self.0 & Self::ITERATION_REQUESTED != 0
    }

    pub const fn required(self) -> bool {
        self.0 & Self::REQUIRED != 0
    }

    pub const fn interruptible(self) -> bool {
        self.0 & Self::INTERRUPTIBLE != 0
    }

    pub const fn error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub const fn with_iteration_requested(self) -> Self {
        Self(self.0 | Self::ITERATION_REQUESTED)
    }

    pub const fn with_required(self) -> Self {
        Self(self.0 | Self::REQUIRED)
    }

    pub const fn with_interruptible(self) -> Self {
        Self(self.0 | Self::INTERRUPTIBLE)
    }

    pub const fn with_error(self) -> Self {
        Self(self.0 | Self::ERROR)
    }
}

/// The record carried on every hop: control traffic for the time protocol and
/// payload traffic for values and messages.
///
/// Messages are value types; ownership passes on enqueue. The payload is an
/// opaque octet block — the fabric never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionMessage {
    pub action: Action,
    pub source_id: FederateId,
    pub dest_id: FederateId,
    pub source_handle: InterfaceHandle,
    pub dest_handle: InterfaceHandle,
    /// Event time for payloads; requested/granted time for the time protocol.
    pub action_time: Time,
    /// Sender's own next event time.
    pub te: Time,
    /// Minimum `te` across the sender's dependencies.
    pub tdemin: Time,
    /// Iteration index within the current logical time point.
    pub counter: i32,
    /// Per-(source, dest) replay counter, stamped by the [`SequenceLedger`].
    pub sequence: i32,
    pub flags: MessageFlags,
    pub payload: Bytes,
    pub name: Option<String>,
}

impl ActionMessage {
    pub fn new(action: Action, source_id: FederateId) -> Self {
        Self {
            action,
            source_id,
            dest_id: FederateId::INVALID,
            source_handle: InterfaceHandle::INVALID,
            dest_handle: InterfaceHandle::INVALID,
            action_time: Time::ZERO,
            te: Time::ZERO,
            tdemin: Time::MAX,
            counter: 0,
            sequence: 0,
            flags: MessageFlags::default(),
            payload: Bytes::new(),
            name: None,
        }
    }

    pub fn to(mut self, dest: FederateId) -> Self {
        self.dest_id = dest;
        self
    }

    pub fn at(mut self, time: Time) -> Self {
        self.action_time = time;
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl std::fmt::Display for ActionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}[{} -> {} @ {}]",
            self.action, self.source_id, self.dest_id, self.action_time
        )
    }
}

/// Per-(source, dest) sequence counters for idempotent replay.
///
/// Senders stamp outgoing control frames; receivers discard a control frame
/// whose counter is at or below the last one seen for that pair. `Data` and
/// `Message` frames pass through untouched — they are ordered by
/// `action_time` instead.
#[derive(Debug, Default)]
pub struct SequenceLedger {
    last_sent: HashMap<(FederateId, FederateId), i32>,
    last_seen: HashMap<(FederateId, FederateId), i32>,
}

impl SequenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp an outgoing frame with the next sequence number for its pair.
    pub fn stamp(&mut self, msg: &mut ActionMessage) {
        if !msg.action.is_sequenced() {
            return;
        }
        let next = self
            .last_sent
            .entry((msg.source_id, msg.dest_id))
            .or_insert(0);
        *next += 1;
        msg.sequence = *next;
    }

    /// Returns false when the frame is a replay on a sequenced stream.
    pub fn accept(&mut self, msg: &ActionMessage) -> bool {
        if !msg.action.is_sequenced() {
            return true;
        }
        let last = self
            .last_seen
            .entry((msg.source_id, msg.dest_id))
            .or_insert(0);
        if msg.sequence <= *last {
            tracing::debug!(%msg, sequence = msg.sequence, "Discarding replayed control frame.");
            false
        } else {
            *last = msg.sequence;
            true
        }
    }

    /// Forget a peer, e.g. after a disconnect tears its routes down.
    pub fn forget(&mut self, peer: FederateId) {
        self.last_sent.retain(|(src, dst), _| *src != peer && *dst != peer);
        self.last_seen.retain(|(src, dst), _| *src != peer && *dst != peer);
    }
}
