//! Core of a multi-device DAQ engine: per-device worker fleet, event
//! aggregation, an online writer pipeline, and a trigger-synchronization
//! client (see `DESIGN.md` for how each module maps onto the teacher
//! repository this crate grew out of).

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod registry;
pub mod runtime;
pub mod sync_client;
pub mod worker;
pub mod writer;
