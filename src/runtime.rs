//! Shared runtime state (spec §2, row G).
//!
//! A single `DaqContext` is built once by the process entry point and
//! `Arc`-shared into every worker, the writer and the sync client, the same
//! way the teacher threads one `SharedMetrics`/`EventRecorder` pair through
//! every sensor/processor/actuator it spawns.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::BusArbiter;

/// Acquisition-loop poll cadence (spec §4.2, §5): ~10µs while idle-but-armed,
/// ~100µs while disarmed. These are the only two sleep constants the spec
/// names; callers must not invent others.
pub const SHORT_SLEEP: Duration = Duration::from_micros(10);
pub const LONG_SLEEP: Duration = Duration::from_micros(100);

/// Sync-client idle poll cadence distinct from the worker sleep constants
/// (spec §4.6 "light_sleep"/"heavy_sleep"), grounded on
/// `examples/original_source/include/.default_common.hh`'s
/// `light_sleep()`/`heavy_sleep()` (200µs / 10ms).
pub const LIGHT_SLEEP: Duration = Duration::from_micros(200);
pub const HEAVY_SLEEP: Duration = Duration::from_millis(10);

pub struct DaqContext {
    pub zmq_context: zmq::Context,
    pub bus: Arc<BusArbiter>,
    pub config_dir: PathBuf,
}

impl DaqContext {
    pub fn new(config_dir: PathBuf, bus_path: PathBuf) -> Self {
        Self {
            zmq_context: zmq::Context::new(),
            bus: Arc::new(BusArbiter::new(bus_path)),
            config_dir,
        }
    }

    pub fn config_path(&self, file_name: &str) -> PathBuf {
        self.config_dir.join(file_name)
    }
}
