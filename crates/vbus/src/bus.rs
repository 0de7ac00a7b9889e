use core::cell::{Cell, RefCell};
use core::fmt;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use derive_more::Display;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use portable_atomic::{AtomicU64, Ordering};

use crate::config::BusConfig;
use crate::device::{FunctionDevice, Request, TopologySink};
use crate::error::BusError;
use crate::handle::DeviceRef;
use crate::node::Node;
use crate::owner::OwnerGuard;
use crate::registry::NodeRegistry;
use crate::state::{BusState, StateCell};
use crate::thread::{default_thread, ThreadRoutine};
use crate::work::{CustomWork, WorkItem, WorkQueue};

/// Raw mutex behind every lock in this crate. Buses are shared between
/// arbitrary producer threads and their drain thread.
pub type BusMutex = CriticalSectionRawMutex;

/// Process-unique identity of a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[display("bus{_0}")]
pub struct BusId(pub(crate) u64);

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// A request was queued; its completion is reported through
/// [`Request::complete`], not to the enqueuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Pending;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Items taken off the queue and applied.
    pub processed: usize,
    /// At least one node was linked or unlinked.
    pub topology_changed: bool,
    /// The parent was sent a relations-changed notification.
    pub notified: bool,
}

/// One logical device bus.
///
/// Any thread may enqueue work. A single drain thread applies it: child
/// nodes are linked and unlinked only there, so the registry needs no lock
/// beyond the short critical sections that make it `Sync`.
pub struct Bus {
    id: BusId,
    this: Weak<Bus>,
    config: BusConfig,
    state: StateCell,
    wake: Signal<BusMutex, ()>,
    owner: OwnerGuard,
    routine: Mutex<BusMutex, Cell<ThreadRoutine>>,
    function: Mutex<BusMutex, RefCell<Option<Arc<dyn FunctionDevice>>>>,
    parent: Mutex<BusMutex, RefCell<Option<Arc<dyn TopologySink>>>>,
    nodes: Mutex<BusMutex, RefCell<NodeRegistry>>,
    queue: WorkQueue,
}

impl Bus {
    /// Create a bus with default settings.
    pub fn new() -> Arc<Self> {
        Self::with_config(BusConfig::default())
    }

    /// Create an idle bus: no children, empty queue, wake signal clear,
    /// default thread routine, no owner and no attached devices.
    pub fn with_config(config: BusConfig) -> Arc<Self> {
        let id = BusId(NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed));
        let queue = WorkQueue::new(config.queue_depth);
        Arc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            config,
            state: StateCell::new(),
            wake: Signal::new(),
            owner: OwnerGuard::new(),
            routine: Mutex::new(Cell::new(default_thread as ThreadRoutine)),
            function: Mutex::new(RefCell::new(None)),
            parent: Mutex::new(RefCell::new(None)),
            nodes: Mutex::new(RefCell::new(NodeRegistry::new())),
            queue,
        })
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Attached identities
    // ---------------------------------------------------------------------

    /// Attach the bus's own device. Returns the one it replaces.
    pub fn attach_function_device(
        &self,
        device: Arc<dyn FunctionDevice>,
    ) -> Option<Arc<dyn FunctionDevice>> {
        self.function.lock(|f| f.borrow_mut().replace(device))
    }

    pub fn detach_function_device(&self) -> Option<Arc<dyn FunctionDevice>> {
        self.function.lock(|f| f.borrow_mut().take())
    }

    pub fn function_device(&self) -> Option<Arc<dyn FunctionDevice>> {
        self.function.lock(|f| f.borrow().clone())
    }

    /// Attach the parent that receives relations-changed notifications.
    pub fn attach_parent(
        &self,
        parent: Arc<dyn TopologySink>,
    ) -> Option<Arc<dyn TopologySink>> {
        self.parent.lock(|p| p.borrow_mut().replace(parent))
    }

    pub fn detach_parent(&self) -> Option<Arc<dyn TopologySink>> {
        self.parent.lock(|p| p.borrow_mut().take())
    }

    fn parent(&self) -> Option<Arc<dyn TopologySink>> {
        self.parent.lock(|p| p.borrow().clone())
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    pub fn state(&self) -> BusState {
        self.state.current()
    }

    /// State before the most recent [`set_state`](Self::set_state).
    pub fn old_state(&self) -> BusState {
        self.state.previous()
    }

    /// Record a PnP transition. Returns the state being left.
    pub fn set_state(&self, next: BusState) -> BusState {
        let old = self.state.set(next);
        debug!("{}: state {:?} -> {:?}", self.id, old, next);
        old
    }

    /// Undo the last transition, e.g. when a pending stop is cancelled.
    pub fn restore_state(&self) -> BusState {
        let undone = self.state.restore();
        debug!("{}: state {:?} undone", self.id, undone);
        undone
    }

    /// Latch the stop flag and wake the drain loop.
    ///
    /// One-way: every enqueue after this fails with
    /// [`BusError::NoSuchDevice`]. The latch is taken under the queue lock,
    /// so a concurrent enqueue either lands first and is drained or
    /// cancelled, or is refused.
    pub fn stop(&self) {
        if self.queue.close() {
            info!("{}: stopping", self.id);
        }
        self.wake.signal(());
    }

    pub fn is_stopping(&self) -> bool {
        self.queue.is_closed()
    }

    // ---------------------------------------------------------------------
    // Ownership
    // ---------------------------------------------------------------------

    /// Claim the bus for the calling thread.
    ///
    /// Returns `false` if an owner is already registered.
    pub fn register_owner_thread(&self) -> bool {
        self.owner.register()
    }

    /// `true` if another thread owns the bus.
    ///
    /// Topology reads such as [`next_node`](Self::next_node) and
    /// [`node_count`](Self::node_count) are only race-free when this returns
    /// `false`.
    pub fn not_owned(&self) -> bool {
        self.owner.not_owned()
    }

    pub fn owner_thread(&self) -> Option<ThreadId> {
        self.owner.owner()
    }

    // ---------------------------------------------------------------------
    // Enqueue
    // ---------------------------------------------------------------------

    fn enqueue<T>(
        &self,
        payload: T,
        wrap: impl FnOnce(T) -> WorkItem,
    ) -> Result<(), (BusError, T)> {
        self.queue.push(payload, wrap)?;
        // Fire and forget.
        self.wake.signal(());
        Ok(())
    }

    /// Queue `node` to be linked by the drain thread.
    ///
    /// Acceptance says nothing about when the node is linked. Do not add
    /// the same node to more than one bus.
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidParameter`] if no function device is attached,
    ///   the node's device belongs to another driver, or the node is
    ///   already linked.
    /// - [`BusError::NoSuchDevice`] if the bus is stopping.
    /// - [`BusError::InsufficientResources`] if the queue is full.
    pub fn add_node(&self, node: &Arc<Node>) -> Result<(), BusError> {
        let function =
            self.function_device().ok_or(BusError::InvalidParameter)?;
        if function.driver() != node.device().driver() || node.is_linked() {
            return Err(BusError::InvalidParameter);
        }
        self.enqueue(Arc::clone(node), WorkItem::AddNode).map_err(|(e, _)| {
            debug!("{}: add rejected: {}", self.id, e);
            e
        })
    }

    /// Queue `node` to be unlinked by the drain thread.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidParameter`] if the node is not linked to this
    /// bus, otherwise as [`add_node`](Self::add_node).
    pub fn remove_node(&self, node: &Arc<Node>) -> Result<(), BusError> {
        if node.bus_id() != Some(self.id) {
            return Err(BusError::InvalidParameter);
        }
        self.enqueue(Arc::clone(node), WorkItem::RemoveNode).map_err(
            |(e, _)| {
                debug!("{}: remove rejected: {}", self.id, e);
                e
            },
        )
    }

    /// Queue a request for the function device.
    ///
    /// On success the bus owns the request. On failure it is handed back
    /// together with the error so the caller can complete it.
    ///
    /// # Errors
    ///
    /// [`BusError::NoSuchDevice`] if the bus is stopping,
    /// [`BusError::InsufficientResources`] if the queue is full.
    pub fn enqueue_request(
        &self,
        request: Box<dyn Request>,
    ) -> Result<Pending, (BusError, Box<dyn Request>)> {
        self.enqueue(request, WorkItem::Dispatch)
            .map(|()| Pending)
            .map_err(|(e, request)| {
                debug!("{}: request rejected: {}", self.id, e);
                (e, request)
            })
    }

    /// Queue `work` to run on the drain thread with this bus.
    ///
    /// Anything the closure captures is dropped after it runs, or when it
    /// is cancelled or rejected.
    ///
    /// # Errors
    ///
    /// As [`enqueue_request`](Self::enqueue_request).
    pub fn enqueue_custom<F>(&self, work: F) -> Result<(), BusError>
    where
        F: FnOnce(&Bus) + Send + 'static,
    {
        let work: CustomWork = Box::new(work);
        self.enqueue(work, WorkItem::Custom).map_err(|(e, _)| {
            debug!("{}: custom work rejected: {}", self.id, e);
            e
        })
    }

    /// Number of items waiting to be drained.
    pub fn queued_items(&self) -> usize {
        self.queue.len()
    }

    // ---------------------------------------------------------------------
    // Drain
    // ---------------------------------------------------------------------

    /// Apply every queued item in order, then notify the parent once if any
    /// node was linked or unlinked.
    ///
    /// Meant to be called from the bus's drain thread. A custom thread
    /// routine must call this in its loop.
    pub fn process_work_items(&self) -> DrainReport {
        let mut report = DrainReport::default();

        while let Some(item) = self.queue.pop() {
            match item {
                WorkItem::AddNode(node) => {
                    report.topology_changed |= self.link_node(node);
                }
                WorkItem::RemoveNode(node) => {
                    report.topology_changed |= self.unlink_node(node);
                }
                WorkItem::Dispatch(request) => self.dispatch(request),
                WorkItem::Custom(work) => {
                    debug!("{}: custom work item", self.id);
                    work(self);
                }
            }
            report.processed += 1;
        }

        if report.topology_changed {
            if let Some(parent) = self.parent() {
                debug!("{}: relations changed", self.id);
                parent.relations_changed(self.id);
                report.notified = true;
            }
        }
        report
    }

    /// Discard every queued item without applying it.
    ///
    /// Queued requests are completed with [`BusError::NoSuchDevice`];
    /// node and custom items are dropped. Returns the number discarded.
    pub fn cancel_work_items(&self) -> usize {
        debug!("{}: cancelling work items", self.id);
        let mut cancelled = 0;
        while let Some(item) = self.queue.pop() {
            if let WorkItem::Dispatch(request) = item {
                request.complete(Err(BusError::NoSuchDevice));
            }
            cancelled += 1;
        }
        cancelled
    }

    fn link_node(&self, node: Arc<Node>) -> bool {
        if node.is_linked() {
            warn!("{}: node already linked, add ignored", self.id);
            return false;
        }
        let device = DeviceRef::acquire(node.device());
        let unit = self.nodes.lock(|nodes| {
            let unit = nodes.borrow_mut().insert(Arc::clone(&node), device);
            node.link(self.id, self.this.clone(), unit);
            unit
        });
        debug!("{}: added node at unit {}", self.id, unit);
        true
    }

    fn unlink_node(&self, node: Arc<Node>) -> bool {
        let device = self.nodes.lock(|nodes| {
            let device = nodes.borrow_mut().remove(&node)?;
            node.unlink();
            Some(device)
        });
        match device {
            Some(device) => {
                // Released outside the lock; this calls into the device.
                drop(device);
                debug!("{}: removed unit {:?}", self.id, node.unit());
                true
            }
            None => {
                warn!("{}: node not on this bus, remove ignored", self.id);
                false
            }
        }
    }

    fn dispatch(&self, request: Box<dyn Request>) {
        match self.function_device() {
            Some(function) => function.dispatch(request),
            None => {
                debug!("{}: no function device, failing request", self.id);
                request.complete(Err(BusError::NoSuchDevice));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Topology reads
    // ---------------------------------------------------------------------

    /// The child following `prev` in unit-number order, or the first child
    /// when `prev` is `None`.
    ///
    /// Only meaningful on the owning thread; see
    /// [`not_owned`](Self::not_owned).
    pub fn next_node(&self, prev: Option<&Node>) -> Option<Arc<Node>> {
        let after = match prev {
            Some(prev) => Some(prev.unit()?),
            None => None,
        };
        self.nodes.lock(|nodes| nodes.borrow().next_after(after))
    }

    /// Iterate children in unit-number order.
    pub fn nodes(&self) -> Nodes<'_> {
        Nodes { bus: self, prev: None, done: false }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock(|nodes| nodes.borrow().len())
    }

    // ---------------------------------------------------------------------
    // Thread
    // ---------------------------------------------------------------------

    /// Replace the routine [`start_thread`](Self::start_thread) runs.
    ///
    /// A custom routine must call
    /// [`process_work_items`](Self::process_work_items) in its loop and
    /// [`cancel_work_items`](Self::cancel_work_items) before returning.
    pub fn set_thread_routine(&self, routine: ThreadRoutine) {
        self.routine.lock(|r| r.set(routine));
    }

    pub(crate) fn thread_routine(&self) -> ThreadRoutine {
        self.routine.lock(|r| r.get())
    }

    pub(crate) fn wake(&self) -> &Signal<BusMutex, ()> {
        &self.wake
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.cancel_work_items();
        // Device references go with the registry entries; the nodes
        // themselves outlive the bus and must read as unlinked.
        for node in self.nodes.get_mut().get_mut().drain() {
            node.unlink();
        }
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stopping", &self.is_stopping())
            .field("nodes", &self.node_count())
            .field("queued", &self.queued_items())
            .finish_non_exhaustive()
    }
}

/// Iterator over a bus's children. See [`Bus::nodes`].
pub struct Nodes<'a> {
    bus: &'a Bus,
    prev: Option<Arc<Node>>,
    done: bool,
}

impl Iterator for Nodes<'_> {
    type Item = Arc<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.bus.next_node(self.prev.as_deref());
        match &next {
            Some(node) => self.prev = Some(Arc::clone(node)),
            None => self.done = true,
        }
        next
    }
}
