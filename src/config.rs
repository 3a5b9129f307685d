//! Read-only configuration tree.
//!
//! Wraps a parsed JSON document and exposes typed, dotted-path accessors
//! (`"writers.online.port"`). This is deliberately read-only: the core
//! never writes configuration back to disk (spec §1 treats config-file
//! loading as an external collaborator; only the typed-tree *reading*
//! surface belongs to this crate).

use std::fs;
use std::path::Path;

use log::warn;
use serde_json::Value;

use crate::error::{DaqError, DaqResult};

#[derive(Debug, Clone)]
pub struct ConfigNode {
    value: Value,
}

impl ConfigNode {
    pub fn from_file(path: &Path) -> DaqResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| DaqError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let value = serde_json::from_str(&text).map_err(|source| DaqError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { value })
    }

    pub fn from_value(value: Value) -> Self {
        Self { value }
    }

    /// Look up a dotted path, e.g. `"writers.online.high_water_mark"`.
    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut cur = &self.value;
        for segment in path.split('.') {
            cur = cur.get(segment)?;
        }
        Some(cur)
    }

    pub fn get_str(&self, path: &str) -> DaqResult<String> {
        match self.lookup(path) {
            None => Err(DaqError::MissingKey(path.to_string())),
            Some(value) => value.as_str().map(str::to_owned).ok_or_else(|| DaqError::WrongType {
                key: path.to_string(),
                expected: "string",
            }),
        }
    }

    pub fn get_str_or(&self, path: &str, default: &str) -> String {
        self.lookup(path)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool_or(&self, path: &str, default: bool) -> bool {
        self.lookup(path).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_i64_or(&self, path: &str, default: i64) -> i64 {
        self.lookup(path).and_then(Value::as_i64).unwrap_or(default)
    }

    pub fn get_u64_or(&self, path: &str, default: u64) -> u64 {
        self.lookup(path).and_then(Value::as_u64).unwrap_or(default)
    }

    pub fn get_f64_or(&self, path: &str, default: f64) -> f64 {
        self.lookup(path).and_then(Value::as_f64).unwrap_or(default)
    }

    /// Decodes a hex string (e.g. `"0x1a2b"`) into a `u32`, per the
    /// `base_address`/`pretrigger_samples` config convention.
    pub fn get_hex_u32_or(&self, path: &str, default: u32) -> u32 {
        match self.lookup(path).and_then(Value::as_str) {
            Some(s) => {
                let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
                u32::from_str_radix(trimmed, 16).unwrap_or_else(|_| {
                    warn!("config key `{path}` = {s:?} is not valid hex, using default {default:#x}");
                    default
                })
            }
            None => default,
        }
    }

    /// Per-channel DC offset fractions in `[0, 1]`, clamped to `0.5` on
    /// violation and logged (spec §7 "configuration violation").
    pub fn get_channel_offsets(&self, path: &str, num_channels: usize) -> Vec<f64> {
        let raw: Vec<f64> = self
            .lookup(path)
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();

        (0..num_channels)
            .map(|ch| {
                let v = raw.get(ch).copied().unwrap_or(0.5);
                if !(0.0..=1.0).contains(&v) {
                    warn!(
                        "channel {ch} offset {v} out of range [0,1], clamping to 0.5"
                    );
                    0.5
                } else {
                    v
                }
            })
            .collect()
    }

    /// `post_trigger_delay`, clamped to the safe default (50) when negative
    /// or absent (spec §7).
    pub fn get_post_trigger_delay(&self) -> u32 {
        let v = self.get_i64_or("post_trigger_delay", 50);
        if v < 0 {
            warn!("post_trigger_delay {v} invalid, clamping to 50");
            50
        } else {
            v as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nested_paths() {
        let cfg = ConfigNode::from_value(serde_json::json!({
            "writers": { "online": { "port": "tcp://*:5555", "high_water_mark": 25 } }
        }));
        assert_eq!(cfg.get_str("writers.online.port").unwrap(), "tcp://*:5555");
        assert_eq!(cfg.get_u64_or("writers.online.high_water_mark", 10), 25);
        assert_eq!(cfg.get_u64_or("writers.online.missing", 10), 10);
    }

    #[test]
    fn decodes_hex_base_address() {
        let cfg = ConfigNode::from_value(serde_json::json!({ "base_address": "0x09000000" }));
        assert_eq!(cfg.get_hex_u32_or("base_address", 0), 0x0900_0000);
    }

    #[test]
    fn clamps_out_of_range_channel_offsets() {
        let cfg = ConfigNode::from_value(serde_json::json!({ "channel_offset": [0.2, 1.7, -0.3] }));
        let offsets = cfg.get_channel_offsets("channel_offset", 4);
        assert_eq!(offsets, vec![0.2, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn clamps_negative_post_trigger_delay() {
        let cfg = ConfigNode::from_value(serde_json::json!({ "post_trigger_delay": -5 }));
        assert_eq!(cfg.get_post_trigger_delay(), 50);
    }

    #[test]
    fn get_str_distinguishes_missing_from_wrong_type() {
        let cfg = ConfigNode::from_value(serde_json::json!({ "high_water_mark": 10 }));
        assert!(matches!(
            cfg.get_str("nonexistent"),
            Err(DaqError::MissingKey(_))
        ));
        assert!(matches!(
            cfg.get_str("high_water_mark"),
            Err(DaqError::WrongType { .. })
        ));
    }
}
