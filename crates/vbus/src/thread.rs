use std::sync::Arc;
use std::thread::{self, JoinHandle};

use embassy_time::with_timeout;

use crate::bus::Bus;
use crate::error::BusError;

/// Body of a bus thread. Runs once; the thread exits when it returns.
pub type ThreadRoutine = fn(&Arc<Bus>);

/// The routine every bus starts with.
///
/// Claims the bus for the current thread, then drives [`Bus::run`] to
/// completion.
pub fn default_thread(bus: &Arc<Bus>) {
    if !bus.register_owner_thread() {
        warn!("{}: owner already registered", bus.id());
    }
    futures::executor::block_on(bus.run());
}

impl Bus {
    /// Spawn the dedicated thread that drains this bus.
    ///
    /// The thread holds a reference to the bus until its routine returns.
    /// Call [`stop`](Self::stop) and join the handle to shut it down.
    ///
    /// # Errors
    ///
    /// [`BusError::ThreadSpawn`] if the OS refuses to create the thread.
    pub fn start_thread(self: &Arc<Self>) -> Result<JoinHandle<()>, BusError> {
        let bus = Arc::clone(self);
        let routine = self.thread_routine();

        let mut builder = thread::Builder::new()
            .name(format!("{}-{}", self.config().thread_name, self.id().0));
        if let Some(size) = self.config().stack_size {
            builder = builder.stack_size(size);
        }

        let handle = builder
            .spawn(move || {
                debug!("{}: thread started", bus.id());
                routine(&bus);
                debug!("{}: exiting", bus.id());
            })
            .map_err(|_| {
                error!("{}: failed to spawn bus thread", self.id());
                BusError::ThreadSpawn
            })?;

        info!("{}: thread running", self.id());
        Ok(handle)
    }

    /// The default drain loop.
    ///
    /// Sleeps until signalled or until the heartbeat elapses, then drains
    /// the queue. Once the stop flag is seen at the top of the loop, every
    /// item still queued is cancelled and the future completes.
    pub async fn run(&self) {
        while !self.is_stopping() {
            trace!("{}: alive", self.id());

            // Timing out is the heartbeat, not an error.
            let _ = with_timeout(self.config().heartbeat, self.wake().wait())
                .await;
            self.wake().reset();

            self.process_work_items();
        }

        self.cancel_work_items();
    }
}
