use core::cell::RefCell;
use core::fmt;
use std::sync::{Arc, Weak};

use embassy_sync::blocking_mutex::Mutex;

use crate::bus::{Bus, BusId, BusMutex};
use crate::device::ChildDevice;
use crate::error::BusError;

/// Where a node currently sits.
#[derive(Default)]
struct Link {
    /// Set while the node is on a bus, cleared on removal.
    bus: Option<(BusId, Weak<Bus>)>,
    /// Last unit number assigned. Kept after removal.
    unit: Option<u32>,
}

/// A child device's registration record on a bus.
///
/// The caller owns the node. The bus only holds a shared reference while
/// the node is linked, and fills in the unit number and back-reference
/// when the node's add request is drained.
pub struct Node {
    device: Arc<dyn ChildDevice>,
    link: Mutex<BusMutex, RefCell<Link>>,
}

impl Node {
    /// Create an unlinked node for `device`.
    pub fn new(device: Arc<dyn ChildDevice>) -> Arc<Self> {
        let link = Mutex::new(RefCell::new(Link::default()));
        Arc::new(Self { device, link })
    }

    /// The child device this node registers.
    pub fn device(&self) -> &Arc<dyn ChildDevice> {
        &self.device
    }

    /// The unit number assigned when the node was last linked, or `None` if
    /// it has never been linked.
    pub fn unit(&self) -> Option<u32> {
        self.link.lock(|link| link.borrow().unit)
    }

    pub fn is_linked(&self) -> bool {
        self.link.lock(|link| link.borrow().bus.is_some())
    }

    /// Id of the bus the node is linked to.
    pub fn bus_id(&self) -> Option<BusId> {
        self.link.lock(|link| link.borrow().bus.as_ref().map(|(id, _)| *id))
    }

    /// The bus the node is linked to, if both still exist.
    pub fn bus(&self) -> Option<Arc<Bus>> {
        self.link.lock(|link| {
            link.borrow().bus.as_ref().and_then(|(_, bus)| bus.upgrade())
        })
    }

    /// Request removal from whichever bus the node is linked to.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidParameter`] if the node is not linked or its bus
    /// is gone; otherwise as [`Bus::remove_node`].
    pub fn remove(self: &Arc<Self>) -> Result<(), BusError> {
        let bus = self.bus().ok_or(BusError::InvalidParameter)?;
        bus.remove_node(self)
    }

    pub(crate) fn link(&self, id: BusId, bus: Weak<Bus>, unit: u32) {
        self.link.lock(|link| {
            let mut link = link.borrow_mut();
            link.bus = Some((id, bus));
            link.unit = Some(unit);
        });
    }

    pub(crate) fn unlink(&self) {
        self.link.lock(|link| link.borrow_mut().bus = None);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("driver", &self.device.driver())
            .field("bus", &self.bus_id())
            .field("unit", &self.unit())
            .finish()
    }
}
