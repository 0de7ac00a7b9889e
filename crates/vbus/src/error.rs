use derive_more::{Display, Error};

/// Errors reported synchronously by bus operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// Missing function device, mismatched driver, or a node in the wrong
    /// linked state for the requested operation.
    #[display("invalid parameter")]
    InvalidParameter,
    /// The work queue is full. Retryable.
    #[display("insufficient resources")]
    InsufficientResources,
    /// The bus is stopping, or has no device to handle the request.
    /// Terminal for this bus.
    #[display("no such device")]
    NoSuchDevice,
    /// The drain thread could not be created.
    #[display("failed to spawn bus thread")]
    ThreadSpawn,
}
