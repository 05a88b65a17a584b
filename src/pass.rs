//! The pass manager surface the core exposes to pass implementors.
//!
//! The core itself has no pass scheduling; it provides the metric sink
//! that passes report into. Metrics are accumulated atomically and dumped
//! by the driver between passes.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Accumulates named counters across parallel workers.
#[derive(Default)]
pub struct PassManager {
    metrics: Mutex<FxHashMap<String, i64>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_metric(&self, name: &str, delta: i64) {
        let mut metrics = self.metrics.lock();
        *metrics.entry(name.to_owned()).or_insert(0) += delta;
    }

    pub fn set_metric(&self, name: &str, value: i64) {
        self.metrics.lock().insert(name.to_owned(), value);
    }

    pub fn get_metric(&self, name: &str) -> i64 {
        self.metrics.lock().get(name).copied().unwrap_or(0)
    }

    /// Snapshot of all metrics, sorted by name, for the driver's dump.
    pub fn metrics(&self) -> Vec<(String, i64)> {
        let metrics = self.metrics.lock();
        let mut out: Vec<_> = metrics.iter().map(|(k, v)| (k.clone(), *v)).collect();
        out.sort();
        out
    }
}
