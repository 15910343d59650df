//! Prometheus metrics for the agent's export path

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};

// ── Delegating exporter ──────────────────────────────────────────────────────

pub static PENDING_BATCHES: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "telemetry_agent_pending_batches",
        "Batches buffered while waiting for the real exporter",
        &["signal"]
    )
    .unwrap()
});

pub static REPLAYED_BATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "telemetry_agent_replayed_batches_total",
        "Buffered batches replayed into the real exporter",
        &["signal", "status"]
    )
    .unwrap()
});

// ── Disk buffer ──────────────────────────────────────────────────────────────

pub static DISK_APPENDS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "telemetry_agent_disk_appends_total",
        "Batches appended to the disk buffer",
        &["signal", "status"]
    )
    .unwrap()
});

pub static DISK_EVICTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "telemetry_agent_disk_evictions_total",
        "Buffer files deleted before delivery",
        &["signal", "reason"]
    )
    .unwrap()
});

pub static DISK_BYTES: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "telemetry_agent_disk_bytes",
        "Bytes currently held in the disk buffer",
        &["signal"]
    )
    .unwrap()
});

// ── Drain ────────────────────────────────────────────────────────────────────

pub static DRAINED_BATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "telemetry_agent_drained_batches_total",
        "Persisted batches re-submitted to the network exporter",
        &["signal", "status"]
    )
    .unwrap()
});

// ── Crash flush ──────────────────────────────────────────────────────────────

pub static CRASH_FLUSHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "telemetry_agent_crash_flushes_total",
        "Pipeline flushes attempted from the crash hook",
        &["pipeline", "status"]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics_includes_touched_series() {
        REPLAYED_BATCHES.with_label_values(&["trace", "ok"]).inc();
        let text = encode_metrics();
        assert!(text.contains("telemetry_agent_replayed_batches_total"));
        assert!(text.contains("signal=\"trace\""));
    }
}
