//! Event aggregator (spec §4.4).
//!
//! Not a standalone runtime object in the source either: it's the
//! wait-then-gather protocol the top-level orchestration runs on each
//! trigger edge, built from `WorkerRegistry::all_workers_have_event` /
//! `get_event_data` / `flush_event_data`. `collect_bundle` packages that
//! protocol as a single call since nothing upstream needs the intermediate
//! states.

use std::time::{Duration, Instant};

use log::warn;

use crate::events::{
    Caen1742Event, Caen5720Event, Caen5730Event, Caen6742Event, Drs4Event, Sis3302Event,
    Sis3316Event, Sis3350Event,
};
use crate::registry::WorkerRegistry;

/// One composite record per accepted trigger: one slot per worker, grouped
/// by device type (spec §3 "Composite event bundle").
#[derive(Debug, Clone, Default)]
pub struct EventBundle {
    pub sis_3302: Vec<Sis3302Event>,
    pub sis_3316: Vec<Sis3316Event>,
    pub sis_3350: Vec<Sis3350Event>,
    pub caen_6742: Vec<Caen6742Event>,
    pub caen_1742: Vec<Caen1742Event>,
    pub drs4: Vec<Drs4Event>,
    pub caen_5720: Vec<Caen5720Event>,
    pub caen_5730: Vec<Caen5730Event>,
}

/// Waits until every worker has at least one event, or until `timeout`
/// elapses, then gathers exactly one bundle and flushes stragglers so they
/// cannot contaminate the next trigger's bundle (spec §4.4).
pub fn collect_bundle(registry: &WorkerRegistry, timeout: Duration) -> EventBundle {
    let deadline = Instant::now() + timeout;
    while !registry.all_workers_have_event() && Instant::now() < deadline {
        std::thread::yield_now();
        std::thread::sleep(Duration::from_micros(10));
    }

    if !registry.all_workers_have_event() {
        warn!("aggregator timed out waiting for all workers, some slots will be default");
    }

    let bundle = registry.get_event_data();
    registry.flush_event_data();
    bundle
}

/// Detects pacing violations (a worker producing faster than triggers
/// arrive) and warns without failing (spec §4.4 `AnyWorkersHaveMultiEvent`).
pub fn warn_on_multi_event(registry: &WorkerRegistry) {
    if registry.any_workers_have_multi_event() {
        warn!("at least one worker is producing faster than triggers are arriving");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeviceEvent;
    use crate::registry::WorkerHandle;
    use crate::worker::{DeviceDriver, Worker};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    struct GateDriver {
        ready: Arc<AtomicBool>,
        fired: bool,
    }

    impl DeviceDriver<Caen5720Event> for GateDriver {
        fn event_available(&mut self) -> bool {
            self.ready.load(Ordering::Acquire) && !self.fired
        }
        fn get_event(&mut self, _t0: Instant) -> Caen5720Event {
            self.fired = true;
            Caen5720Event {
                event_index: 1,
                ..Caen5720Event::zeroed()
            }
        }
    }

    #[test]
    fn missing_worker_gets_default_slot_after_timeout() {
        let mut registry = WorkerRegistry::new();

        let ready0 = Arc::new(AtomicBool::new(true));
        let mut w0 = Worker::new(
            "w0",
            Box::new(GateDriver { ready: ready0, fired: false }),
        );
        w0.start_thread();
        w0.start_worker();
        registry.push(WorkerHandle::Caen5720(w0));

        let never_ready = Arc::new(AtomicBool::new(false));
        let mut w1 = Worker::new(
            "w1",
            Box::new(GateDriver { ready: never_ready, fired: false }),
        );
        w1.start_thread();
        w1.start_worker();
        registry.push(WorkerHandle::Caen5720(w1));

        let bundle = collect_bundle(&registry, Duration::from_millis(20));
        assert_eq!(bundle.caen_5720.len(), 2);
        assert_eq!(bundle.caen_5720[0].event_index, 1);
        assert_eq!(bundle.caen_5720[1].event_index, 0);
        assert!(!registry.any_workers_have_event());
    }
}
