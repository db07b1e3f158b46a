//! Metric records and where they go.

mod memory;
mod sink;

use std::collections::BTreeMap;

use serde::Serialize;

pub use memory::{MemoryMonitor, MemorySample, MemoryUsage, ProcessMemoryMonitor};
pub use sink::{JsonlSink, LogSink, MetricsSink, build_sink};

pub const GLOBAL_AVG_LOSS: &str = "loss_metrics/global_avg_loss";
pub const GLOBAL_MAX_LOSS: &str = "loss_metrics/global_max_loss";
pub const WPS: &str = "wps";

/// Namespaced metric keys mapped to values, serialized in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetricsRecord(BTreeMap<String, f64>);

impl MetricsRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
