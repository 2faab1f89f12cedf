//! Node metrics for Metrics Server
//!
//! Metrics Server scrapes exactly two families from the kubelet resource
//! metrics endpoint: `node_cpu_usage_seconds_total` (an integral of
//! core-seconds) and `node_memory_working_set_bytes`. Load readings from
//! the agent are integrated into core-seconds here.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use supernetes_proto::NodeStatus;

/// Provides the node metrics consumed by Metrics Server
#[derive(Debug, Default)]
pub struct MetricsProvider {
    state: Mutex<MetricsState>,
}

#[derive(Debug, Default)]
struct MetricsState {
    core_seconds: f64,
    working_set: f64,
    load_avg: f32,
    updated: Option<Instant>,
    timestamp_ms: i64,
}

impl MetricsProvider {
    /// Create a metrics provider with zeroed readings
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a fresh node status reading into the metrics
    pub fn update(&self, status: &NodeStatus) {
        let mut state = self.state.lock();

        let now = Instant::now();
        if let Some(updated) = state.updated {
            // Integrate core-seconds over the elapsed interval
            state.core_seconds += state.load_avg as f64 * now.duration_since(updated).as_secs_f64();
        }

        state.working_set = status.ws_bytes as f64;
        state.load_avg = status.cpu_load;
        state.updated = Some(now);
        state.timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
    }

    /// Render the metric families in Prometheus text exposition format
    pub fn render(&self) -> String {
        let state = self.state.lock();

        format!(
            "# HELP node_cpu_usage_seconds_total Cumulative cpu time consumed by the node in core-seconds\n\
             # TYPE node_cpu_usage_seconds_total counter\n\
             node_cpu_usage_seconds_total {} {}\n\
             # HELP node_memory_working_set_bytes Current working set of the node in bytes\n\
             # TYPE node_memory_working_set_bytes gauge\n\
             node_memory_working_set_bytes {} {}\n",
            state.core_seconds, state.timestamp_ms, state.working_set, state.timestamp_ms
        )
    }
}
