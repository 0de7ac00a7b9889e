use std::sync::Arc;

use crate::device::ChildDevice;

/// RAII token for one logical reference on a child device.
///
/// Acquiring the token calls [`ChildDevice::reference`]; dropping it calls
/// [`ChildDevice::dereference`]. The registry keeps one token per linked
/// node, so the device's count is raised for exactly as long as the node
/// sits on a bus.
pub(crate) struct DeviceRef {
    device: Arc<dyn ChildDevice>,
}

impl DeviceRef {
    pub(crate) fn acquire(device: &Arc<dyn ChildDevice>) -> Self {
        device.reference();
        Self { device: Arc::clone(device) }
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        self.device.dereference();
    }
}
