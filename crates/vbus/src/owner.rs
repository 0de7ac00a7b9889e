use std::sync::OnceLock;
use std::thread::{self, ThreadId};

/// Best-effort record of the one thread allowed to touch bus topology.
///
/// The slot is claimed once and never transferred.
pub(crate) struct OwnerGuard {
    owner: OnceLock<ThreadId>,
}

impl OwnerGuard {
    pub(crate) const fn new() -> Self {
        Self { owner: OnceLock::new() }
    }

    /// Claim the slot for the calling thread. `false` if already claimed,
    /// including by the caller itself.
    pub(crate) fn register(&self) -> bool {
        self.owner.set(thread::current().id()).is_ok()
    }

    /// `true` only when an owner exists and it is not the calling thread.
    pub(crate) fn not_owned(&self) -> bool {
        self.owner.get().is_some_and(|owner| *owner != thread::current().id())
    }

    pub(crate) fn owner(&self) -> Option<ThreadId> {
        self.owner.get().copied()
    }
}
