use core::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;

use crate::bus::{Bus, BusMutex};
use crate::device::Request;
use crate::error::BusError;
use crate::node::Node;

/// Arbitrary work scheduled onto the bus thread.
pub(crate) type CustomWork = Box<dyn FnOnce(&Bus) + Send>;

/// One deferred bus operation.
pub(crate) enum WorkItem {
    AddNode(Arc<Node>),
    RemoveNode(Arc<Node>),
    Dispatch(Box<dyn Request>),
    Custom(CustomWork),
}

struct Slots {
    items: VecDeque<WorkItem>,
    depth: usize,
    closed: bool,
}

/// Bounded FIFO of pending work items, closed for good once the bus stops.
///
/// Any thread may push; only the draining thread pops. The closed latch
/// lives under the same lock as the items, so a push either lands before
/// [`close`](Self::close) or is refused.
pub(crate) struct WorkQueue {
    slots: Mutex<BusMutex, RefCell<Slots>>,
}

impl WorkQueue {
    /// A queue holding at most `depth` items. A depth of zero is raised to
    /// one.
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            slots: Mutex::new(RefCell::new(Slots {
                items: VecDeque::new(),
                depth: depth.max(1),
                closed: false,
            })),
        }
    }

    /// Append the item `wrap` builds from `payload`.
    ///
    /// The payload is handed back with [`BusError::NoSuchDevice`] once the
    /// queue is closed, or with [`BusError::InsufficientResources`] while
    /// it is full.
    pub(crate) fn push<T>(
        &self,
        payload: T,
        wrap: impl FnOnce(T) -> WorkItem,
    ) -> Result<(), (BusError, T)> {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            if slots.closed {
                return Err((BusError::NoSuchDevice, payload));
            }
            if slots.items.len() >= slots.depth {
                return Err((BusError::InsufficientResources, payload));
            }
            slots.items.push_back(wrap(payload));
            Ok(())
        })
    }

    pub(crate) fn pop(&self) -> Option<WorkItem> {
        self.slots.lock(|slots| slots.borrow_mut().items.pop_front())
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock(|slots| slots.borrow().items.len())
    }

    /// Refuse every later push. Returns `true` for the call that closed it.
    pub(crate) fn close(&self) -> bool {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            !core::mem::replace(&mut slots.closed, true)
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.slots.lock(|slots| slots.borrow().closed)
    }
}
