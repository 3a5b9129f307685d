//! Online writer (spec §4.5).
//!
//! Grounded on `examples/original_source/include/writer_online.hh` and
//! `src/writer_online.cxx`: a bounded intake queue filled by `PushData`,
//! drained in FIFO order by a background thread that packs one JSON
//! document per bundle and sends it non-blocking with a 200-attempt retry
//! cap, plus an `EndOfBatch` that flushes the queue and hammers a fixed
//! end-of-batch frame. The "two variants of PackMessage" source bug noted
//! in spec §9 is resolved here by following the compilable variant only
//! (correct `Vec<Vec<f64>>` trace encoding, 5720-class using `event_index`
//! in place of `device_clock`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::aggregator::EventBundle;
use crate::config::ConfigNode;
use crate::error::DaqError;
use crate::events::{
    CAEN_1742_LN, CAEN_5720_LN, CAEN_5730_LN, CAEN_6742_LN, DRS4_LN, SIS_3302_LN, SIS_3316_LN,
    SIS_3350_LN,
};
use crate::runtime::{LONG_SLEEP, SHORT_SLEEP};

pub const K_MAX_QUEUE_SIZE: usize = 5;

const EOM_SUFFIX: &str = "__EOM__";
const EOB_FRAME: &[u8; 10] = b"__EOB__\0\0\0";
const EOB_ATTEMPTS: u32 = 50;
const EOB_SPACING: Duration = Duration::from_micros(100);
const SEND_ATTEMPTS: u32 = 200;

/// Seam a real transport plugs into; `zmq::Socket`'s push side implements
/// this directly in production wiring (spec §4.5 "Transport").
pub trait WriterSink: Send {
    /// Non-blocking send attempt; `Ok(true)` means queued, `Ok(false)`
    /// means would-block, `Err` is a hard transport failure.
    fn try_send(&mut self, bytes: &[u8]) -> Result<bool, String>;
}

struct Intake {
    queue: Mutex<VecDeque<EventBundle>>,
    has_data: AtomicBool,
}

/// Bounded producer/consumer pipeline from aggregator bundles to a
/// message-oriented transport (spec §2 row E).
pub struct OnlineWriter {
    intake: Arc<Intake>,
    go_time: Arc<AtomicBool>,
    thread_live: Arc<AtomicBool>,
    number_of_events: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
    dropped_count: Arc<AtomicU64>,
}

impl OnlineWriter {
    /// Reads `writers.online.*` and spawns the background send loop against
    /// `sink` (spec §4.5 `LoadConfig`).
    pub fn new(config: &ConfigNode, sink: Box<dyn WriterSink>) -> Self {
        let max_trace_length = config.get_i64_or("writers.online.max_trace_length", -1);

        let intake = Arc::new(Intake {
            queue: Mutex::new(VecDeque::new()),
            has_data: AtomicBool::new(false),
        });
        let go_time = Arc::new(AtomicBool::new(false));
        let thread_live = Arc::new(AtomicBool::new(true));
        let number_of_events = Arc::new(AtomicU64::new(0));
        let dropped_count = Arc::new(AtomicU64::new(0));

        let handle = Some(spawn_send_loop(
            intake.clone(),
            go_time.clone(),
            thread_live.clone(),
            number_of_events.clone(),
            max_trace_length,
            sink,
        ));

        Self {
            intake,
            go_time,
            thread_live,
            number_of_events,
            handle,
            dropped_count,
        }
    }

    pub fn start_writer(&self) {
        self.number_of_events.store(0, Ordering::Release);
        self.go_time.store(true, Ordering::Release);
    }

    pub fn stop_writer(&self) {
        self.go_time.store(false, Ordering::Release);
    }

    /// Pushes bundles from `batch` until the intake reaches
    /// `K_MAX_QUEUE_SIZE`; the tail is dropped (spec §4.5 "Intake policy",
    /// §8 "Bounded intake"). `dropped_count` is an optional, compatible
    /// extension of the source's silent-drop policy (spec §9).
    ///
    /// `number_of_events` (the `event_number` field stamped into every
    /// outgoing message) is incremented by the full incoming batch size
    /// regardless of how many bundles actually fit in the queue, matching
    /// `examples/original_source/src/writer_online.cxx`'s
    /// `number_of_events_ += data_buffer.size();` — it counts events seen,
    /// not events queued.
    pub fn push_data(&self, batch: Vec<EventBundle>) {
        debug!("writer received a batch of {} bundle(s)", batch.len());
        self.number_of_events.fetch_add(batch.len() as u64, Ordering::Relaxed);
        let mut queue = self.intake.queue.lock();
        let mut dropped = 0u64;
        for bundle in batch {
            if queue.len() >= K_MAX_QUEUE_SIZE {
                dropped += 1;
                continue;
            }
            queue.push_back(bundle);
        }
        if dropped > 0 {
            self.dropped_count.fetch_add(dropped, Ordering::Relaxed);
            warn!("writer intake full, dropped {dropped} bundle(s)");
        }
        self.intake.has_data.store(true, Ordering::Release);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    fn flush_intake(&self) {
        let mut queue = self.intake.queue.lock();
        queue.clear();
        self.intake.has_data.store(false, Ordering::Release);
    }

    /// Flushes the intake, then hammers the end-of-batch frame
    /// `EOB_ATTEMPTS` times so the receiver has multiple chances to see it
    /// past its own high-water mark (spec §4.5 "EndOfBatch").
    pub fn end_of_batch(&self, bad_data: bool, sink: &mut dyn WriterSink) {
        if bad_data {
            warn!("end of batch flagged as bad data");
        }
        self.flush_intake();
        for _ in 0..EOB_ATTEMPTS {
            let _ = sink.try_send(EOB_FRAME);
            thread::sleep(EOB_SPACING);
        }
    }
}

impl Drop for OnlineWriter {
    fn drop(&mut self) {
        self.go_time.store(false, Ordering::Release);
        self.flush_intake();
        self.thread_live.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{}", DaqError::JoinFailed("writer".to_string()));
            }
        }
    }
}

fn spawn_send_loop(
    intake: Arc<Intake>,
    go_time: Arc<AtomicBool>,
    thread_live: Arc<AtomicBool>,
    number_of_events: Arc<AtomicU64>,
    max_trace_length: i64,
    mut sink: Box<dyn WriterSink>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut pending: Option<Vec<u8>> = None;

        while thread_live.load(Ordering::Acquire) {
            while go_time.load(Ordering::Acquire) && intake.has_data.load(Ordering::Acquire) {
                if pending.is_none() {
                    pending = pack_message(&intake, number_of_events.load(Ordering::Relaxed), max_trace_length);
                }

                while let Some(bytes) = pending.as_ref() {
                    if !go_time.load(Ordering::Acquire) {
                        break;
                    }
                    let mut sent = false;
                    for _ in 0..SEND_ATTEMPTS {
                        match sink.try_send(bytes) {
                            Ok(true) => {
                                sent = true;
                                break;
                            }
                            Ok(false) => {}
                            Err(e) => {
                                warn!("writer send failed: {e}");
                                break;
                            }
                        }
                    }
                    if sent {
                        info!("sent message successfully");
                        pending = None;
                    }
                    thread::sleep(SHORT_SLEEP);
                    thread::yield_now();
                    break;
                }

                thread::sleep(SHORT_SLEEP);
                thread::yield_now();
            }

            thread::sleep(LONG_SLEEP);
            thread::yield_now();
        }
    })
}

/// Takes the queue head under the writer mutex, then leaves the mutex
/// before encoding (spec §4.5 "PackMessage takes the queue head under the
/// writer mutex, leaving the mutex before encoding").
fn pack_message(intake: &Intake, event_number: u64, max_trace_length: i64) -> Option<Vec<u8>> {
    let bundle = {
        let mut queue = intake.queue.lock();
        let bundle = queue.pop_front();
        if queue.is_empty() {
            intake.has_data.store(false, Ordering::Release);
        }
        bundle
    }?;

    let mut doc = serde_json::Map::new();
    doc.insert("event_number".to_string(), json!(event_number));

    encode_group(&mut doc, "sis_3350", &bundle.sis_3350, |e| (e.system_clock, &e.device_clock, &e.trace, None), SIS_3350_LN, max_trace_length);
    encode_group(&mut doc, "sis_3302", &bundle.sis_3302, |e| (e.system_clock, &e.device_clock, &e.trace, None), SIS_3302_LN, max_trace_length);
    encode_group(&mut doc, "sis_3316", &bundle.sis_3316, |e| (e.system_clock, &e.device_clock, &e.trace, None), SIS_3316_LN, max_trace_length);
    encode_group(&mut doc, "caen_6742", &bundle.caen_6742, |e| (e.system_clock, &e.device_clock, &e.trace, None), CAEN_6742_LN, max_trace_length);
    encode_group(&mut doc, "caen_1742", &bundle.caen_1742, |e| (e.system_clock, &e.device_clock, &e.trace, Some(&e.trigger)), CAEN_1742_LN, max_trace_length);
    encode_group(&mut doc, "drs4", &bundle.drs4, |e| (e.system_clock, &e.device_clock, &e.trace, None), DRS4_LN, max_trace_length);

    encode_event_index_group(&mut doc, "caen_5720", &bundle.caen_5720, |e| (e.event_index, e.system_clock, &e.trace), CAEN_5720_LN, max_trace_length);
    encode_event_index_group(&mut doc, "caen_5730", &bundle.caen_5730, |e| (e.event_index, e.system_clock, &e.trace), CAEN_5730_LN, max_trace_length);

    let mut buffer = Value::Object(doc).to_string().into_bytes();
    buffer.extend_from_slice(EOM_SUFFIX.as_bytes());
    Some(buffer)
}

fn truncate_len(native: usize, max_trace_length: i64) -> usize {
    if max_trace_length < 0 {
        native
    } else {
        native.min(max_trace_length as usize)
    }
}

#[allow(clippy::type_complexity)]
fn encode_group<'a, T>(
    doc: &mut serde_json::Map<String, Value>,
    tag: &str,
    entries: &'a [T],
    project: impl Fn(&'a T) -> (u64, &'a Vec<u64>, &'a Vec<Vec<u16>>, Option<&'a Vec<Vec<u16>>>),
    native_len: usize,
    max_trace_length: i64,
) {
    let trace_len = truncate_len(native_len, max_trace_length);
    for (i, entry) in entries.iter().enumerate() {
        let (system_clock, device_clock, trace, trigger) = project(entry);
        let mut map = serde_json::Map::new();
        map.insert("system_clock".to_string(), json!(system_clock));
        map.insert("device_clock".to_string(), json!(device_clock));
        map.insert("trace".to_string(), json!(truncate_trace(trace, trace_len)));
        if let Some(trigger) = trigger {
            map.insert("trigger".to_string(), json!(truncate_trace(trigger, trace_len)));
        }
        doc.insert(format!("{tag}_vec_{i}"), Value::Object(map));
    }
}

fn encode_event_index_group<'a, T>(
    doc: &mut serde_json::Map<String, Value>,
    tag: &str,
    entries: &'a [T],
    project: impl Fn(&'a T) -> (u64, u64, &'a Vec<Vec<u16>>),
    native_len: usize,
    max_trace_length: i64,
) {
    let trace_len = truncate_len(native_len, max_trace_length);
    for (i, entry) in entries.iter().enumerate() {
        let (event_index, system_clock, trace) = project(entry);
        let mut map = serde_json::Map::new();
        map.insert("system_clock".to_string(), json!(system_clock));
        map.insert("event_index".to_string(), json!(event_index));
        map.insert("trace".to_string(), json!(truncate_trace(trace, trace_len)));
        doc.insert(format!("{tag}_vec_{i}"), Value::Object(map));
    }
}

fn truncate_trace(trace: &[Vec<u16>], trace_len: usize) -> Vec<&[u16]> {
    trace.iter().map(|ch| &ch[..trace_len.min(ch.len())]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Caen5720Event;
    use std::sync::Mutex as StdMutex;

    struct StalledSink;
    impl WriterSink for StalledSink {
        fn try_send(&mut self, _bytes: &[u8]) -> Result<bool, String> {
            Ok(false)
        }
    }

    struct RecordingSink {
        sent: Arc<StdMutex<Vec<Vec<u8>>>>,
    }
    impl WriterSink for RecordingSink {
        fn try_send(&mut self, bytes: &[u8]) -> Result<bool, String> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(true)
        }
    }

    fn test_config() -> ConfigNode {
        ConfigNode::from_value(serde_json::json!({
            "writers": { "online": { "port": "tcp://*:0", "high_water_mark": 10, "max_trace_length": -1 } }
        }))
    }

    #[test]
    fn push_data_drops_tail_past_capacity() {
        let writer = OnlineWriter::new(&test_config(), Box::new(StalledSink));
        let batch: Vec<EventBundle> = (0..8).map(|_| EventBundle::default()).collect();
        writer.push_data(batch);
        assert_eq!(writer.dropped_count(), 3);
        assert_eq!(writer.intake.queue.lock().len(), K_MAX_QUEUE_SIZE);
    }

    #[test]
    fn packed_message_ends_with_eom_and_parses_as_json() {
        let mut bundle = EventBundle::default();
        bundle.caen_5720.push(Caen5720Event {
            event_index: 7,
            ..Caen5720Event::zeroed()
        });
        let intake = Intake {
            queue: Mutex::new(VecDeque::from([bundle])),
            has_data: AtomicBool::new(true),
        };
        let bytes = pack_message(&intake, 1, -1).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with(EOM_SUFFIX));
        let stripped = &text[..text.len() - EOM_SUFFIX.len()];
        let parsed: Value = serde_json::from_str(stripped).unwrap();
        assert_eq!(parsed["caen_5720_vec_0"]["event_index"], 7);
    }

    #[test]
    fn end_of_batch_sends_eob_frames_after_draining() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let writer = OnlineWriter::new(&test_config(), Box::new(StalledSink));
        writer.push_data(vec![EventBundle::default(); 3]);
        let mut sink = RecordingSink { sent: sent.clone() };
        writer.end_of_batch(false, &mut sink);
        assert_eq!(writer.intake.queue.lock().len(), 0);
        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), EOB_ATTEMPTS as usize);
        assert!(frames.iter().all(|f| f == EOB_FRAME));
    }
}
