//! Per-launch statistics

use crate::config::ThreadConfig;
use crate::error::{OffloadError, Result};
use serde::Serialize;
use std::time::Duration;

/// How the units of a launch were submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// One unit shared by every thread
    Template,
    /// One unit per logical thread
    Batch,
}

/// One successful launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsRow {
    pub mode: LaunchMode,
    pub units: usize,
    pub threads: ThreadConfig,
    pub binary_bytes: usize,
    /// Heap end after the read phase
    pub heap_bytes_used: u64,
    #[serde(rename = "write_us", serialize_with = "as_micros")]
    pub write_time: Duration,
    #[serde(rename = "launch_us", serialize_with = "as_micros")]
    pub launch_time: Duration,
    #[serde(rename = "read_us", serialize_with = "as_micros")]
    pub read_time: Duration,
}

impl StatsRow {
    /// Wall time of all three phases
    pub fn total_time(&self) -> Duration {
        self.write_time + self.launch_time + self.read_time
    }
}

fn as_micros<S: serde::Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
}

/// Render stats rows as a JSON array
pub fn to_json(rows: &[StatsRow]) -> Result<String> {
    serde_json::to_string_pretty(rows).map_err(|e| OffloadError::serialization(format!("stats export: {e}")))
}
