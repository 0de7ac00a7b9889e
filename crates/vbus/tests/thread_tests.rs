use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration as StdDuration;

use vbus::{
    Bus, BusConfig, BusError, ChildDevice, DriverId, Duration, FunctionDevice,
    Node, Request,
};

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

const DRIVER: DriverId = DriverId(1);

struct MockDevice;

impl ChildDevice for MockDevice {
    fn driver(&self) -> DriverId {
        DRIVER
    }
    fn reference(&self) {}
    fn dereference(&self) {}
}

struct MockFunction;

impl FunctionDevice for MockFunction {
    fn driver(&self) -> DriverId {
        DRIVER
    }

    fn dispatch(&self, request: Box<dyn Request>) {
        request.complete(Ok(()));
    }
}

/// Request that reports its completion over a channel.
struct ChannelRequest(mpsc::Sender<Result<(), BusError>>);

impl Request for ChannelRequest {
    fn complete(self: Box<Self>, result: Result<(), BusError>) {
        let _ = self.0.send(result);
    }
}

/// Request that counts its completions, whatever the outcome.
struct CountingRequest(Arc<AtomicUsize>);

impl Request for CountingRequest {
    fn complete(self: Box<Self>, _: Result<(), BusError>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

const WAIT: StdDuration = StdDuration::from_secs(5);

fn make_bus(config: BusConfig) -> Arc<Bus> {
    let bus = Bus::with_config(config);
    bus.attach_function_device(Arc::new(MockFunction));
    bus
}

/// Run a closure on the bus thread and wait for its result.
fn on_bus_thread<T, F>(bus: &Bus, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&Bus) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    bus.enqueue_custom(move |bus| {
        let _ = tx.send(f(bus));
    })
    .unwrap();
    rx.recv_timeout(WAIT).expect("bus thread did not run custom work")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn custom_work_runs_once_on_the_bus_thread() {
    let bus = make_bus(BusConfig::default());
    let handle = bus.start_thread().unwrap();
    let bus_thread = handle.thread().id();

    let counter = Arc::new(AtomicUsize::new(0));
    let count = counter.clone();
    let ran_on = on_bus_thread(&bus, move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        thread::current().id()
    });

    assert_eq!(ran_on, bus_thread);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    bus.stop();
    handle.join().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn default_thread_claims_ownership() {
    let bus = make_bus(BusConfig::default());
    let handle = bus.start_thread().unwrap();
    let bus_thread = handle.thread().id();

    let owned_inside = on_bus_thread(&bus, |bus| !bus.not_owned());
    assert!(owned_inside);
    assert_eq!(bus.owner_thread(), Some(bus_thread));
    assert!(bus.not_owned());
    assert!(!bus.register_owner_thread());

    bus.stop();
    handle.join().unwrap();
}

#[test]
fn thread_is_named_after_the_bus() {
    let bus = make_bus(BusConfig::default().with_thread_name("vblk"));
    let handle = bus.start_thread().unwrap();
    let name = handle.thread().name().map(str::to_owned);

    bus.stop();
    handle.join().unwrap();
    assert!(name.unwrap().starts_with("vblk-"));
}

#[test]
fn concurrent_adds_produce_dense_sorted_units() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 6;

    let bus = make_bus(BusConfig::default());
    let handle = bus.start_thread().unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let bus = bus.clone();
            thread::spawn(move || {
                (0..PER_PRODUCER)
                    .map(|_| {
                        let node = Node::new(Arc::new(MockDevice));
                        // The queue is bounded; back off while it is full.
                        loop {
                            match bus.add_node(&node) {
                                Ok(()) => break,
                                Err(BusError::InsufficientResources) => {
                                    thread::yield_now()
                                }
                                Err(e) => panic!("add failed: {e}"),
                            }
                        }
                        node
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let nodes: Vec<Arc<Node>> = producers
        .into_iter()
        .flat_map(|p| p.join().unwrap())
        .collect();

    let units = on_bus_thread(&bus, |bus| {
        bus.nodes().map(|n| n.unit().unwrap()).collect::<Vec<_>>()
    });
    let expected: Vec<u32> = (0..(PRODUCERS * PER_PRODUCER) as u32).collect();
    assert_eq!(units, expected);
    assert!(nodes.iter().all(|n| n.is_linked()));

    bus.stop();
    handle.join().unwrap();
}

#[test]
fn stop_wakes_a_sleeping_thread() {
    // Heartbeat far beyond the test timeout: only the stop signal can end
    // the wait in time.
    let config =
        BusConfig::default().with_heartbeat(Duration::from_secs(3600));
    let bus = make_bus(config);
    let handle = bus.start_thread().unwrap();
    on_bus_thread(&bus, |_| ());

    let (tx, rx) = mpsc::channel();
    let joiner = thread::spawn(move || {
        let _ = tx.send(handle.join().is_ok());
    });
    bus.stop();

    assert_eq!(rx.recv_timeout(WAIT), Ok(true));
    joiner.join().unwrap();
}

#[test]
fn loop_survives_heartbeat_timeouts() {
    let config =
        BusConfig::default().with_heartbeat(Duration::from_millis(5));
    let bus = make_bus(config);
    let handle = bus.start_thread().unwrap();

    // Several heartbeats elapse with nothing queued.
    thread::sleep(StdDuration::from_millis(50));
    assert!(!handle.is_finished());
    assert_eq!(on_bus_thread(&bus, |bus| bus.node_count()), 0);

    bus.stop();
    handle.join().unwrap();
}

#[test]
fn requests_are_dispatched_by_the_thread() {
    let bus = make_bus(BusConfig::default());
    let handle = bus.start_thread().unwrap();

    let (tx, rx) = mpsc::channel();
    let _pending =
        bus.enqueue_request(Box::new(ChannelRequest(tx))).ok().unwrap();
    assert_eq!(rx.recv_timeout(WAIT), Ok(Ok(())));

    bus.stop();
    handle.join().unwrap();
}

#[test]
fn work_after_stop_is_rejected() {
    let bus = make_bus(BusConfig::default());
    let handle = bus.start_thread().unwrap();
    bus.stop();
    handle.join().unwrap();

    assert_eq!(bus.enqueue_custom(|_| {}), Err(BusError::NoSuchDevice));
    assert_eq!(bus.queued_items(), 0);
}

#[test]
fn enqueue_racing_stop_never_strands_work() {
    const ROUNDS: usize = 100;
    const PRODUCERS: usize = 4;

    for _ in 0..ROUNDS {
        let bus = make_bus(BusConfig::default());
        let handle = bus.start_thread().unwrap();
        let completed = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(PRODUCERS + 1));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let bus = bus.clone();
                let completed = completed.clone();
                let start = start.clone();
                thread::spawn(move || {
                    start.wait();
                    let mut accepted = 0;
                    loop {
                        let request =
                            Box::new(CountingRequest(completed.clone()));
                        match bus.enqueue_request(request) {
                            Ok(_) => accepted += 1,
                            Err((BusError::InsufficientResources, _)) => {
                                thread::yield_now()
                            }
                            Err((BusError::NoSuchDevice, _)) => break accepted,
                            Err((e, _)) => panic!("enqueue failed: {e}"),
                        }
                    }
                })
            })
            .collect();

        start.wait();
        bus.stop();
        handle.join().unwrap();
        let accepted: usize =
            producers.into_iter().map(|p| p.join().unwrap()).sum();

        // Everything accepted was either dispatched or cancelled.
        assert_eq!(bus.queued_items(), 0);
        assert_eq!(completed.load(Ordering::SeqCst), accepted);
    }
}

static CUSTOM_ROUTINE_RAN: AtomicBool = AtomicBool::new(false);

fn polling_routine(bus: &Arc<Bus>) {
    CUSTOM_ROUTINE_RAN.store(true, Ordering::SeqCst);
    while !bus.is_stopping() {
        bus.process_work_items();
        thread::sleep(StdDuration::from_millis(1));
    }
    bus.cancel_work_items();
}

#[test]
fn custom_thread_routine_replaces_default_loop() {
    let bus = make_bus(BusConfig::default());
    bus.set_thread_routine(polling_routine);
    let handle = bus.start_thread().unwrap();

    let owner = on_bus_thread(&bus, |bus| bus.owner_thread());
    // Only the default routine registers itself as owner.
    assert_eq!(owner, None);

    bus.stop();
    handle.join().unwrap();
    assert!(CUSTOM_ROUTINE_RAN.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// Async loop
// ---------------------------------------------------------------------------

#[futures_test::test]
async fn run_on_stopped_bus_cancels_pending_work() {
    let bus = make_bus(BusConfig::default());
    let (tx, rx) = mpsc::channel();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();

    bus.enqueue_custom(move |_| flag.store(true, Ordering::SeqCst))
        .unwrap();
    let _pending =
        bus.enqueue_request(Box::new(ChannelRequest(tx))).ok().unwrap();
    bus.stop();

    bus.run().await;

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(bus.queued_items(), 0);
    assert_eq!(rx.try_recv(), Ok(Err(BusError::NoSuchDevice)));
}
