//! Thin process entry point.
//!
//! Top-level orchestration (which configs to load, when to call
//! `StartWorkers`/`StopWorkers` off a `SyncClient` trigger edge) is out of
//! scope for this crate (spec §1) and lives in a deployment-specific
//! binary; this just demonstrates how the pieces here are meant to be
//! wired together against a config directory and a shared bus path.

use std::env;
use std::path::PathBuf;

use testbeam_daq_core::config::ConfigNode;
use testbeam_daq_core::registry::WorkerRegistry;
use testbeam_daq_core::runtime::DaqContext;
use testbeam_daq_core::writer::{OnlineWriter, WriterSink};

struct ZmqPushSink {
    socket: zmq::Socket,
}

impl WriterSink for ZmqPushSink {
    fn try_send(&mut self, bytes: &[u8]) -> Result<bool, String> {
        match self.socket.send(bytes, zmq::DONTWAIT) {
            Ok(()) => Ok(true),
            Err(zmq::Error::EAGAIN) => Ok(false),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn main() {
    env_logger::init();

    let config_dir = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/daq"));
    let bus_path = env::args()
        .nth(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/dev/sis1100_0"));

    let ctx = DaqContext::new(config_dir, bus_path);

    let writer_config = match ConfigNode::from_file(&ctx.config_path("writer.json")) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("could not load writer config, using an empty tree: {e}");
            ConfigNode::from_value(serde_json::json!({}))
        }
    };

    let port = writer_config.get_str_or("writers.online.port", "tcp://127.0.0.1:5556");
    let high_water_mark = writer_config.get_i64_or("writers.online.high_water_mark", 10);
    let sink: Box<dyn WriterSink> = match ctx.zmq_context.socket(zmq::PUSH) {
        Ok(socket) => {
            // Spec §4.5 "Transport": send HWM from config (default 10),
            // linger = 0 so queued-but-unsent messages are dropped on close
            // rather than blocking shutdown. The writer's PUSH socket
            // connects out to the downstream consumer, matching
            // `examples/original_source/src/writer_online.cxx`'s
            // `online_sck_.connect(conf.get<std::string>("writers.online.port"))`
            // — the consumer is the one that binds.
            if let Err(e) = socket.set_sndhwm(high_water_mark as i32) {
                log::error!("failed to set writer socket send HWM to {high_water_mark}: {e}");
            }
            if let Err(e) = socket.set_linger(0) {
                log::error!("failed to set writer socket linger: {e}");
            }
            if let Err(e) = socket.connect(&port) {
                log::error!("failed to connect writer socket to {port}: {e}");
            }
            Box::new(ZmqPushSink { socket })
        }
        Err(e) => {
            log::error!("failed to create writer socket: {e}");
            return;
        }
    };

    let writer = OnlineWriter::new(&writer_config, sink);
    writer.start_writer();

    let registry = WorkerRegistry::new();
    log::info!(
        "daq core wired up with an empty worker registry ({} workers); \
         populate it with WorkerHandle entries built from per-device config \
         before calling start_threads/start_workers",
        registry.len()
    );
}
