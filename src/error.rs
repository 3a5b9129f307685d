//! Error taxonomy for the DAQ core.
//!
//! Per the propagation policy: components log and continue, so most of
//! this enum is only ever surfaced at a construction/config boundary
//! (config load, bus open, socket connect) or logged in place at a
//! shutdown boundary (`JoinFailed`). The acquisition, writer and
//! sync-client loops catch these locally and keep running.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DaqError {
    #[error("config key `{0}` missing")]
    MissingKey(String),

    #[error("config key `{key}` has wrong type, expected {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("failed to parse config file {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read config file {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open bus device {path:?}, driver returned {code}")]
    BusOpen { path: PathBuf, code: i32 },

    #[error("bus transfer failed at address {addr:#x}, driver returned {code}")]
    BusTransfer { addr: u32, code: i32 },

    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),

    #[error("thread join failed for `{0}`")]
    JoinFailed(String),
}

pub type DaqResult<T> = Result<T, DaqError>;
