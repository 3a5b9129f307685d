//! Worker registry (spec §4.3).
//!
//! The original models the heterogeneous worker collection as a
//! `boost::variant` over worker-template pointers with a visitor per
//! operation (`examples/original_source/src/worker_list.cxx`). The set of
//! device types is closed at build time, so per spec §9 this is a tagged
//! enum here instead of a trait object: `WorkerHandle` wraps exactly one
//! `Worker<T>` per supported device type, and every collective operation is
//! an exhaustive match rather than a vtable call.

use crate::aggregator::EventBundle;
use crate::events::{
    Caen1742Event, Caen5720Event, Caen5730Event, Caen6742Event, Drs4Event, Sis3302Event,
    Sis3316Event, Sis3350Event,
};
use crate::worker::{Worker, WorkerState};

/// One entry per supported device type (spec §4.3 "dispatch is exhaustive
/// over the closed set of supported device types").
pub enum WorkerHandle {
    Sis3302(Worker<Sis3302Event>),
    Sis3316(Worker<Sis3316Event>),
    Sis3350(Worker<Sis3350Event>),
    Caen6742(Worker<Caen6742Event>),
    Caen1742(Worker<Caen1742Event>),
    Drs4(Worker<Drs4Event>),
    Caen5720(Worker<Caen5720Event>),
    Caen5730(Worker<Caen5730Event>),
}

macro_rules! for_each_worker {
    ($self:expr, $w:ident => $body:expr) => {
        match $self {
            WorkerHandle::Sis3302($w) => $body,
            WorkerHandle::Sis3316($w) => $body,
            WorkerHandle::Sis3350($w) => $body,
            WorkerHandle::Caen6742($w) => $body,
            WorkerHandle::Caen1742($w) => $body,
            WorkerHandle::Drs4($w) => $body,
            WorkerHandle::Caen5720($w) => $body,
            WorkerHandle::Caen5730($w) => $body,
        }
    };
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        for_each_worker!(self, w => w.name())
    }

    pub fn state(&self) -> WorkerState {
        for_each_worker!(self, w => w.state())
    }

    fn start_thread(&mut self) {
        for_each_worker!(self, w => w.start_thread())
    }

    fn start_worker(&self) {
        for_each_worker!(self, w => w.start_worker())
    }

    fn stop_worker(&self) {
        for_each_worker!(self, w => w.stop_worker())
    }

    fn stop_thread(&mut self) {
        for_each_worker!(self, w => w.stop_thread())
    }

    fn has_event(&self) -> bool {
        for_each_worker!(self, w => w.has_event())
    }

    fn num_events(&self) -> usize {
        for_each_worker!(self, w => w.num_events())
    }

    fn flush_events(&self) {
        for_each_worker!(self, w => w.flush_events())
    }

    /// Dispatches on the tag, popping one event into the bundle slot for
    /// this worker's device type (spec §4.3 `GetEventData`).
    fn pop_into(&self, bundle: &mut EventBundle) {
        match self {
            WorkerHandle::Sis3302(w) => bundle.sis_3302.push(w.pop_event()),
            WorkerHandle::Sis3316(w) => bundle.sis_3316.push(w.pop_event()),
            WorkerHandle::Sis3350(w) => bundle.sis_3350.push(w.pop_event()),
            WorkerHandle::Caen6742(w) => bundle.caen_6742.push(w.pop_event()),
            WorkerHandle::Caen1742(w) => bundle.caen_1742.push(w.pop_event()),
            WorkerHandle::Drs4(w) => bundle.drs4.push(w.pop_event()),
            WorkerHandle::Caen5720(w) => bundle.caen_5720.push(w.pop_event()),
            WorkerHandle::Caen5730(w) => bundle.caen_5730.push(w.pop_event()),
        }
    }
}

/// An ordered, tagged sequence of workers (spec §3 "Worker registry").
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Vec<WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self { workers: Vec::new() }
    }

    pub fn push(&mut self, handle: WorkerHandle) {
        self.workers.push(handle);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn start_threads(&mut self) {
        log::info!("launching worker threads");
        for w in &mut self.workers {
            w.start_thread();
        }
    }

    pub fn start_workers(&self) {
        log::info!("starting workers");
        for w in &self.workers {
            w.start_worker();
        }
    }

    pub fn stop_workers(&self) {
        log::info!("stopping workers");
        for w in &self.workers {
            w.stop_worker();
        }
    }

    /// Idempotent: calling this twice in a row is a no-op the second time,
    /// since each `Worker::stop_thread` is itself idempotent (spec §8
    /// "Shutdown idempotence").
    pub fn stop_threads(&mut self) {
        log::info!("stopping worker threads");
        for w in &mut self.workers {
            w.stop_thread();
        }
    }

    pub fn free_list(&mut self) {
        self.workers.clear();
    }

    pub fn flush_event_data(&self) {
        for w in &self.workers {
            w.flush_events();
        }
    }

    pub fn any_workers_have_event(&self) -> bool {
        self.workers.iter().any(|w| w.has_event())
    }

    pub fn all_workers_have_event(&self) -> bool {
        !self.workers.is_empty() && self.workers.iter().all(|w| w.has_event())
    }

    pub fn any_workers_have_multi_event(&self) -> bool {
        self.workers.iter().any(|w| w.num_events() > 1)
    }

    /// Produces exactly one bundle slot per worker, default-initialized
    /// for any worker that had no event (spec §4.4).
    pub fn get_event_data(&self) -> EventBundle {
        let mut bundle = EventBundle::default();
        for w in &self.workers {
            w.pop_into(&mut bundle);
        }
        bundle
    }
}
