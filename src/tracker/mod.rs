//! Experiment metric forwarding.
//!
//! Stage executors forward their metrics to an external tracker after
//! persisting them. Forwarding is strictly best-effort: failures are logged
//! at `warn` and swallowed, and must never affect the pipeline response.

use std::collections::BTreeMap;

use async_trait::async_trait;

/// Fire-and-forget metric sink.
#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    /// Forwards a batch of metrics. Infallible by contract; implementations
    /// swallow their own errors.
    async fn log_metrics(&self, metrics: &BTreeMap<String, f64>);
}

/// Tracker that drops everything. Used when no tracking endpoint is
/// configured.
#[derive(Default)]
pub struct NoopTracker;

impl NoopTracker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExperimentTracker for NoopTracker {
    async fn log_metrics(&self, _metrics: &BTreeMap<String, f64>) {}
}

/// Tracker that POSTs metric batches as JSON to an HTTP endpoint.
pub struct HttpTracker {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ExperimentTracker for HttpTracker {
    async fn log_metrics(&self, metrics: &BTreeMap<String, f64>) {
        let result = self
            .client
            .post(&self.endpoint)
            .json(metrics)
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    status = response.status().as_u16(),
                    endpoint = %self.endpoint,
                    "Experiment tracker rejected metrics"
                );
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    endpoint = %self.endpoint,
                    "Experiment tracker unreachable, dropping metrics"
                );
            }
            _ => {}
        }
    }
}

/// In-memory tracker that records every batch. Test double.
#[derive(Default)]
pub struct RecordingTracker {
    batches: tokio::sync::Mutex<Vec<BTreeMap<String, f64>>>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn batches(&self) -> Vec<BTreeMap<String, f64>> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl ExperimentTracker for RecordingTracker {
    async fn log_metrics(&self, metrics: &BTreeMap<String, f64>) {
        self.batches.lock().await.push(metrics.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_tracker_captures_batches() {
        let tracker = RecordingTracker::new();
        let mut metrics = BTreeMap::new();
        metrics.insert("rmse".to_string(), 0.05);
        tracker.log_metrics(&metrics).await;

        let batches = tracker.batches().await;
        assert_eq!(batches.len(), 1);
        assert!((batches[0]["rmse"] - 0.05).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_http_tracker_swallows_unreachable_endpoint() {
        // Port 1 is never listening; the call must not panic or error.
        let tracker = HttpTracker::new("http://127.0.0.1:1/metrics");
        let mut metrics = BTreeMap::new();
        metrics.insert("miou".to_string(), 0.75);
        tracker.log_metrics(&metrics).await;
    }
}
