//! Collaborator interfaces the bus consumes.
//!
//! The bus never creates or frees device objects. It only holds them,
//! forwards requests to them and tells them when their logical reference
//! count changes.

use derive_more::Display;

use crate::bus::BusId;
use crate::error::BusError;

/// Identity of the driver instance a device object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[display("driver{_0}")]
pub struct DriverId(pub u32);

/// A child device object managed by the surrounding device layer.
pub trait ChildDevice: Send + Sync {
    /// The driver instance that created this device.
    fn driver(&self) -> DriverId;

    /// Take one logical reference. Called when the device's node is linked.
    fn reference(&self);

    /// Drop one logical reference. Called when the device's node is
    /// unlinked, or when a bus holding it is dropped.
    fn dereference(&self);
}

/// The bus's own device identity.
///
/// Its driver must match the driver of every child added to the bus, and
/// it receives every request the drain loop dispatches.
pub trait FunctionDevice: Send + Sync {
    fn driver(&self) -> DriverId;

    /// Process a request on the bus thread. The implementation owns the
    /// request from here on and must eventually complete it.
    fn dispatch(&self, request: Box<dyn Request>);
}

/// Parent-visible identity of the bus, told when its children change.
pub trait TopologySink: Send + Sync {
    /// Called at most once per drain pass, after all node changes in that
    /// pass have been applied.
    fn relations_changed(&self, bus: BusId);
}

/// An opaque request travelling through the bus.
pub trait Request: Send {
    /// Report the final status of the request to its originator.
    fn complete(self: Box<Self>, result: Result<(), BusError>);
}
