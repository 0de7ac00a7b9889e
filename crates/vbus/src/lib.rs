//! Virtual device bus core.
//!
//! A [`Bus`] owns an ordered set of child [`Node`]s and a queue of pending
//! work. Any thread may enqueue node additions, node removals, requests
//! and custom callbacks; one dedicated drain thread applies them in order.
//! Child topology is therefore only ever mutated on that thread, which the
//! owner-thread check lets callers verify.
//!
//! Unit numbers are the smallest non-negative integers not in use, so gaps
//! left by removed children are reused by the next addition.
//!
//! The work queue is bounded by [`BusConfig::queue_depth`]. A full queue
//! is backpressure: enqueue operations return
//! [`BusError::InsufficientResources`] and may be retried once the drain
//! thread catches up.
//!
//! This crate targets hosted platforms. It spawns `std` threads and links
//! the `std` implementation of `critical-section`, which backs every lock
//! here, so binaries depending on it must not provide another one.

#[macro_use]
mod fmt;

mod bus;
mod config;
mod device;
mod error;
mod handle;
mod node;
mod owner;
mod registry;
mod state;
mod thread;
mod work;

pub use bus::{Bus, BusId, BusMutex, DrainReport, Nodes, Pending};
pub use config::{BusConfig, DEFAULT_HEARTBEAT, QUEUE_DEPTH};
pub use embassy_time::Duration;
pub use device::{ChildDevice, DriverId, FunctionDevice, Request, TopologySink};
pub use error::BusError;
pub use node::Node;
pub use state::BusState;
pub use thread::{default_thread, ThreadRoutine};
