use embassy_time::Duration;

/// Default number of work items a bus holds before enqueue operations
/// report [`BusError::InsufficientResources`](crate::BusError).
pub const QUEUE_DEPTH: usize = 64;

/// Wake interval of the default drain loop when nobody signals it.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Per-bus settings, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Upper bound on how long the drain loop sleeps between checks of the
    /// stop flag.
    pub heartbeat: Duration,
    /// Prefix of the drain thread's name. The bus id is appended.
    pub thread_name: String,
    /// Stack size for the drain thread, or `None` for the platform default.
    pub stack_size: Option<usize>,
    /// Work items held before enqueue reports backpressure. At least one.
    pub queue_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            thread_name: String::from("vbus"),
            stack_size: None,
            queue_depth: QUEUE_DEPTH,
        }
    }
}

impl BusConfig {
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }
}
