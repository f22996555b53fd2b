//! Prometheus metrics registration and export.

use prometheus::{CounterVec, Encoder, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for pointforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total stage executions, labeled by stage and status.
pub static STAGE_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage latency in seconds, labeled by stage.
pub static STAGE_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }
    let registry = Registry::new();

    let stage_runs_total = CounterVec::new(
        Opts::new("pointforge_stage_runs_total", "Total stage executions"),
        &["stage", "status"],
    )?;
    let stage_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "pointforge_stage_latency_seconds",
            "Stage latency in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["stage"],
    )?;

    registry.register(Box::new(stage_runs_total.clone()))?;
    registry.register(Box::new(stage_latency.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = STAGE_RUNS_TOTAL.set(stage_runs_total);
    let _ = STAGE_LATENCY.set(stage_latency);
    Ok(())
}

/// Records one stage execution.
pub fn record_stage(stage: &str, status: &str, seconds: f64) {
    if let Some(counter) = STAGE_RUNS_TOTAL.get() {
        counter.with_label_values(&[stage, status]).inc();
    }
    if let Some(histogram) = STAGE_LATENCY.get() {
        histogram.with_label_values(&[stage]).observe(seconds);
    }
}

/// Exports all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_record() {
        init_metrics().expect("metrics init");
        // Second init is a no-op, not an error.
        init_metrics().expect("metrics re-init");

        record_stage("registration", "ok", 0.2);
        let text = export_metrics();
        assert!(text.contains("pointforge_stage_runs_total"));
        assert!(text.contains("pointforge_stage_latency_seconds"));
    }
}
