//! Worker (generic producer), spec §4.2.
//!
//! One `Worker<T>` owns one device: its own acquisition thread, a bounded
//! FIFO of `T` events, and the `thread_live`/`go_time` flag pair that forms
//! the Idle/Armed/Running state machine. The acquisition loop itself is the
//! same shape in every original worker (`worker_3316.cxx::WorkLoop`,
//! `worker_caenusb.hh::WorkLoop`): poll `EventAvailable`, push on hit,
//! short-sleep on miss, long-sleep when disarmed. What differs per device is
//! how `EventAvailable`/`GetEvent` talk to hardware, captured here by the
//! `DeviceDriver` trait.

pub mod usb;
pub mod vme;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::config::ConfigNode;
use crate::error::DaqError;
use crate::events::DeviceEvent;
use crate::runtime::{LONG_SLEEP, SHORT_SLEEP};

/// Device-specific half of a worker: how to tell whether an event is ready
/// and how to read it out. `t0` is the acquisition-start reference the
/// driver stamps `system_clock` against (spec §6, "not wall time").
pub trait DeviceDriver<T: DeviceEvent>: Send {
    fn event_available(&mut self) -> bool;
    fn get_event(&mut self, t0: Instant) -> T;

    /// Called once at acquisition start / stop, for drivers that need to
    /// arm/disarm hardware around the work loop (USB digitizers).
    fn start_acquisition(&mut self) {}
    fn stop_acquisition(&mut self) {}
}

/// State machine from spec §4.2: `Idle` (thread_live=false, go_time=false),
/// `Armed` (thread_live=true, go_time=false), `Running` (both true).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Armed,
    Running,
}

struct Queue<T> {
    data: Mutex<VecDeque<T>>,
    has_event: AtomicBool,
}

impl<T> Queue<T> {
    fn new() -> Self {
        Self {
            data: Mutex::new(VecDeque::new()),
            has_event: AtomicBool::new(false),
        }
    }
}

/// One device's producer: thread lifecycle, acquisition lifecycle, bounded
/// event queue. `T` is the device-event record type (spec §3).
pub struct Worker<T: DeviceEvent> {
    name: String,
    config: Option<Arc<ConfigNode>>,
    thread_live: Arc<AtomicBool>,
    go_time: Arc<AtomicBool>,
    queue: Arc<Queue<T>>,
    handle: Option<JoinHandle<()>>,
    driver: Option<Box<dyn DeviceDriver<T>>>,
}

impl<T: DeviceEvent> Worker<T> {
    pub fn new(name: impl Into<String>, driver: Box<dyn DeviceDriver<T>>) -> Self {
        Self {
            name: name.into(),
            config: None,
            thread_live: Arc::new(AtomicBool::new(false)),
            go_time: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(Queue::new()),
            handle: None,
            driver: Some(driver),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores the worker's configuration handle (spec §3 "a configuration
    /// handle"; spec §4.2 `LoadConfig`). Concrete per-model keys
    /// (`device_id`, `base_address`, register maps, etc.) are out of scope
    /// here (spec §1), consumed instead by whatever builds this worker's
    /// `DeviceDriver`; this just holds the handle for later lookup.
    pub fn load_config(&mut self, config: Arc<ConfigNode>) {
        debug!("worker `{}` loaded configuration", self.name);
        self.config = Some(config);
    }

    pub fn config(&self) -> Option<&Arc<ConfigNode>> {
        self.config.as_ref()
    }

    pub fn state(&self) -> WorkerState {
        match (
            self.thread_live.load(Ordering::Acquire),
            self.go_time.load(Ordering::Acquire),
        ) {
            (false, _) => WorkerState::Idle,
            (true, false) => WorkerState::Armed,
            (true, true) => WorkerState::Running,
        }
    }

    /// Idle → Armed. Spawns the acquisition thread; it idles in the outer
    /// `thread_live` loop until `StartWorker` flips `go_time`.
    pub fn start_thread(&mut self) {
        if self.thread_live.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut driver = self.driver.take().expect("worker driver already taken");
        let thread_live = self.thread_live.clone();
        let go_time = self.go_time.clone();
        let queue = self.queue.clone();
        let name = self.name.clone();

        self.handle = Some(thread::spawn(move || {
            let t0 = Instant::now();
            driver.start_acquisition();

            while thread_live.load(Ordering::Acquire) {
                while go_time.load(Ordering::Acquire) {
                    if driver.event_available() {
                        let event = driver.get_event(t0);
                        queue.data.lock().push_back(event);
                        queue.has_event.store(true, Ordering::Release);
                    } else {
                        thread::yield_now();
                        thread::sleep(SHORT_SLEEP);
                    }
                    if !thread_live.load(Ordering::Acquire) {
                        break;
                    }
                }
                thread::yield_now();
                thread::sleep(LONG_SLEEP);
            }

            driver.stop_acquisition();
            log::debug!("worker `{name}` acquisition thread exiting");
        }));
    }

    /// Armed → Running.
    pub fn start_worker(&self) {
        self.go_time.store(true, Ordering::Release);
    }

    /// Running → Armed.
    pub fn stop_worker(&self) {
        self.go_time.store(false, Ordering::Release);
    }

    /// `*` → Idle. Idempotent: a second call on an already-idle worker is a
    /// no-op, and a failed join is logged once rather than propagated
    /// (spec §4.2 "StopThread must be idempotent").
    pub fn stop_thread(&mut self) {
        if !self.thread_live.swap(false, Ordering::AcqRel) {
            return;
        }
        self.go_time.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{}", DaqError::JoinFailed(self.name.clone()));
            }
        }
    }

    pub fn has_event(&self) -> bool {
        self.queue.has_event.load(Ordering::Acquire)
    }

    pub fn num_events(&self) -> usize {
        self.queue.data.lock().len()
    }

    /// Returns the device-type default on an empty queue rather than
    /// blocking or erroring (spec §4.2 rationale: aggregator decisions use
    /// `HasEvent`/`NumEvents`, so this call is side-effect-minimal).
    pub fn pop_event(&self) -> T {
        let mut data = self.queue.data.lock();
        match data.pop_front() {
            Some(event) => {
                if data.is_empty() {
                    self.queue.has_event.store(false, Ordering::Release);
                }
                event
            }
            None => T::zeroed(),
        }
    }

    pub fn flush_events(&self) {
        let mut data = self.queue.data.lock();
        data.clear();
        self.queue.has_event.store(false, Ordering::Release);
    }

    pub fn any_multi_event(&self) -> bool {
        self.queue.data.lock().len() > 1
    }
}

impl<T: DeviceEvent> Drop for Worker<T> {
    fn drop(&mut self) {
        if self.thread_live.load(Ordering::Acquire) {
            warn!("worker `{}` dropped while still running, stopping", self.name);
            self.stop_thread();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Caen5720Event;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct ScriptedDriver {
        remaining: u32,
        counter: Arc<AtomicU32>,
    }

    impl DeviceDriver<Caen5720Event> for ScriptedDriver {
        fn event_available(&mut self) -> bool {
            self.remaining > 0
        }

        fn get_event(&mut self, _t0: Instant) -> Caen5720Event {
            self.remaining -= 1;
            let idx = self.counter.fetch_add(1, Ordering::SeqCst) as u64;
            Caen5720Event {
                event_index: idx,
                ..Caen5720Event::zeroed()
            }
        }
    }

    #[test]
    fn produces_events_in_order_then_clears_has_event() {
        let counter = Arc::new(AtomicU32::new(0));
        let driver = ScriptedDriver { remaining: 3, counter };
        let mut worker = Worker::new("scripted", Box::new(driver));

        assert_eq!(worker.state(), WorkerState::Idle);
        worker.start_thread();
        assert_eq!(worker.state(), WorkerState::Armed);
        worker.start_worker();
        assert_eq!(worker.state(), WorkerState::Running);

        let deadline = Instant::now() + Duration::from_millis(500);
        while worker.num_events() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(worker.pop_event().event_index, 0);
        assert_eq!(worker.pop_event().event_index, 1);
        assert_eq!(worker.pop_event().event_index, 2);
        assert!(!worker.has_event());

        worker.stop_worker();
        worker.stop_thread();
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[test]
    fn pop_on_empty_returns_zeroed_default() {
        let driver = ScriptedDriver {
            remaining: 0,
            counter: Arc::new(AtomicU32::new(0)),
        };
        let worker: Worker<Caen5720Event> = Worker::new("idle", Box::new(driver));
        let event = worker.pop_event();
        assert_eq!(event.event_index, 0);
        assert!(!worker.has_event());
    }

    #[test]
    fn stop_thread_is_idempotent() {
        let driver = ScriptedDriver {
            remaining: 0,
            counter: Arc::new(AtomicU32::new(0)),
        };
        let mut worker: Worker<Caen5720Event> = Worker::new("idle", Box::new(driver));
        worker.start_thread();
        worker.stop_thread();
        worker.stop_thread();
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[test]
    fn load_config_stores_the_handle() {
        let driver = ScriptedDriver {
            remaining: 0,
            counter: Arc::new(AtomicU32::new(0)),
        };
        let mut worker: Worker<Caen5720Event> = Worker::new("w0", Box::new(driver));
        assert!(worker.config().is_none());

        let config = Arc::new(ConfigNode::from_value(serde_json::json!({
            "trigger_type": "ttl",
        })));
        worker.load_config(config);
        assert_eq!(
            worker.config().unwrap().get_str_or("trigger_type", ""),
            "ttl"
        );
    }
}
