//! Identifier newtypes for federation participants and their interfaces.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Globally unique identifier of a federation participant.
///
/// Non-negative values identify federates; negative values are reserved for
/// brokers and cores.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FederateId(i32);

impl FederateId {
    pub const INVALID: Self = Self(i32::MIN);

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn is_broker(self) -> bool {
        self.0 < 0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != i32::MIN
    }
}

impl From<i32> for FederateId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FederateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_broker() {
            write!(f, "broker({})", self.0)
        } else {
            write!(f, "fed({})", self.0)
        }
    }
}

/// Handle of a publication, input, endpoint, or filter, unique within its
/// owning core.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct InterfaceHandle(i32);

impl InterfaceHandle {
    pub const INVALID: Self = Self(-1);

    pub const fn new(handle: i32) -> Self {
        Self(handle)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for InterfaceHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl From<i32> for InterfaceHandle {
    fn from(handle: i32) -> Self {
        Self(handle)
    }
}

impl std::fmt::Display for InterfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// A globally registered interface: the owning core plus its local handle.
///
/// A `(core, handle)` pair is never reused within a federation lifetime.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalHandle {
    pub core: FederateId,
    pub handle: InterfaceHandle,
}

impl GlobalHandle {
    pub const fn new(core: FederateId, handle: InterfaceHandle) -> Self {
        Self { core, handle }
    }
}

impl std::fmt::Display for GlobalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.core, self.handle)
    }
}

/// Key into a core's route table.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RouteId(i32);

impl RouteId {
    /// Route 0 always points at the parent broker.
    pub const PARENT: Self = Self(0);

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "route{}", self.0)
    }
}
