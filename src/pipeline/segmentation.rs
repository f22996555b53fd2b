//! Segmentation stage executor.
//!
//! Prefers the latest `aligned` artifact, falls back to the latest
//! `ingested`, and errors when neither exists. Engine selection: the
//! accelerated path runs only when the flag and model path are both set and
//! the runtime is present; otherwise the CPU fallback produces the same
//! output shape. Summaries (class histogram, mean confidence, mean entropy)
//! are persisted as artifacts and `miou` feeds the `segmentation_pass` gate.

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::json;
use uuid::Uuid;

use crate::engines::{
    AcceleratedClassifier, Classification, ClassifierEngine, ClassifyRequest,
};
use crate::engines::segmentation::{ACCEL_POINT_COUNT, CPU_POINT_COUNT};
use crate::error::PipelineError;
use crate::objectstore::{self, RetryPolicy};
use crate::observability;
use crate::storage::{artifact_kinds, SceneStore as _};
use crate::tracker::ExperimentTracker as _;

use super::{StageContext, StageKind, StageOutput};

/// Lower bound on the accelerated batch size.
pub const MIN_BATCH_SIZE: usize = 1000;

const ENTROPY_EPS: f64 = 1e-8;

/// Binary entropy of a probability, clamped away from 0 and 1 so the log
/// terms stay finite.
pub fn binary_entropy(p: f64) -> f64 {
    let p = p.clamp(ENTROPY_EPS, 1.0 - ENTROPY_EPS);
    -(p * p.ln() + (1.0 - p) * (1.0 - p).ln())
}

/// Runs the segmentation stage for one scene.
pub async fn execute(ctx: &StageContext<'_>) -> Result<StageOutput, PipelineError> {
    let started = Instant::now();
    let result = run(ctx).await;
    let elapsed = started.elapsed();

    let status = if result.is_ok() { "ok" } else { "error" };
    observability::record_stage(StageKind::Segmentation.as_str(), status, elapsed.as_secs_f64());

    let mut output = result?;
    let elapsed_ms = (elapsed.as_secs_f64() * 100_000.0).round() / 100.0;
    ctx.store
        .create_metric(ctx.scene_id, "segmentation_ms", elapsed_ms)
        .await?;
    output.metrics.insert("segmentation_ms".to_string(), elapsed_ms);

    ctx.tracker.log_metrics(&output.metrics).await;

    Ok(output)
}

async fn run(ctx: &StageContext<'_>) -> Result<StageOutput, PipelineError> {
    let input = match ctx
        .store
        .latest_artifact(ctx.scene_id, artifact_kinds::ALIGNED)
        .await?
    {
        Some(artifact) => artifact,
        None => ctx
            .store
            .latest_artifact(ctx.scene_id, artifact_kinds::INGESTED)
            .await?
            .ok_or(PipelineError::MissingPrerequisite {
                stage: "segmentation",
                wanted: "input",
            })?,
    };

    let retry = RetryPolicy {
        max_attempts: ctx.config.storage_retry_attempts,
        base_delay: std::time::Duration::from_millis(ctx.config.storage_retry_base_ms),
    };

    let (bucket, key) = objectstore::parse_uri(&input.uri)?;
    let _cloud = objectstore::get_with_retry(ctx.objects, bucket, key, retry).await?;

    let classification = classify(ctx)?;

    let histogram = class_histogram(&classification, ctx.config.seg_num_classes);
    let confidence_mean = mean(classification.labels.iter().map(|l| l.confidence));
    let entropy_mean = mean(
        classification
            .labels
            .iter()
            .map(|l| binary_entropy(l.confidence)),
    );

    tracing::info!(
        scene_id = %ctx.scene_id,
        points = classification.labels.len(),
        miou = classification.miou,
        accelerated = classification.used_accelerated,
        "Segmentation complete"
    );

    let mut output = StageOutput::default();
    let nonce = Uuid::new_v4().simple().to_string();
    let processed = &ctx.config.bucket_processed;

    let summaries = [
        (
            artifact_kinds::SEGMENTATION_CLASSES,
            format!("segmentation/classes_{}_{nonce}.json", ctx.scene_id),
            json!({ "class_counts": histogram }),
        ),
        (
            artifact_kinds::SEGMENTATION_CONFIDENCE,
            format!("segmentation/confidence_{}_{nonce}.json", ctx.scene_id),
            json!({ "confidence_mean": confidence_mean }),
        ),
        (
            artifact_kinds::SEGMENTATION_ENTROPY,
            format!("segmentation/entropy_{}_{nonce}.json", ctx.scene_id),
            json!({ "entropy_mean": entropy_mean }),
        ),
    ];

    for (kind, key, body) in summaries {
        let payload = serde_json::to_vec(&body).map_err(crate::error::StoreError::from)?;
        objectstore::put_with_retry(ctx.objects, processed, &key, &payload, retry).await?;
        let artifact = ctx
            .store
            .create_artifact(ctx.scene_id, kind, &objectstore::object_uri(processed, &key))
            .await?;
        output.artifacts.push(artifact.id);
    }

    output.metrics.insert("miou".to_string(), classification.miou);
    output.metrics.insert(
        "seg_used_accelerated".to_string(),
        super::gate_metric(classification.used_accelerated),
    );
    output.metrics.insert(
        "seg_used_gpu".to_string(),
        super::gate_metric(classification.used_gpu),
    );

    let pass = ctx
        .thresholds()
        .evaluate(StageKind::Segmentation, &output.metrics);
    output
        .metrics
        .insert("segmentation_pass".to_string(), super::gate_metric(pass));

    for (name, value) in &output.metrics {
        ctx.store.create_metric(ctx.scene_id, name, *value).await?;
    }

    Ok(output)
}

/// Applies the engine-selection policy for this run's snapshot.
fn classify(ctx: &StageContext<'_>) -> Result<Classification, PipelineError> {
    let accel_model = ctx
        .config
        .seg_model_path
        .as_ref()
        .filter(|_| ctx.config.seg_use_accelerated && AcceleratedClassifier::runtime_available());

    let request = |point_count| ClassifyRequest {
        point_count,
        class_count: ctx.config.seg_num_classes,
        batch_size: ctx.config.seg_batch_size.max(MIN_BATCH_SIZE),
        seed: ctx.config.seg_seed,
    };

    let classification = match accel_model {
        Some(model_path) => {
            AcceleratedClassifier::new(model_path).classify(&request(ACCEL_POINT_COUNT))?
        }
        None => ctx.classifier_engine.classify(&request(CPU_POINT_COUNT))?,
    };
    Ok(classification)
}

fn class_histogram(classification: &Classification, class_count: usize) -> BTreeMap<String, u64> {
    let mut histogram: BTreeMap<String, u64> =
        (0..class_count).map(|c| (c.to_string(), 0)).collect();
    for label in &classification.labels {
        *histogram.entry(label.class_id.to_string()).or_insert(0) += 1;
    }
    histogram
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0_u64), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::registration;
    use crate::pipeline::testutil::Harness;

    #[tokio::test]
    async fn test_segmentation_on_ingested_input() {
        let harness = Harness::new();
        let scene = harness.scene_with_ingested().await;

        let ctx = harness.ctx(&scene);
        let output = execute(&ctx).await.unwrap();

        assert_eq!(output.artifacts.len(), 3);
        assert!((0.0..=1.0).contains(&output.metrics["miou"]));
        assert!((output.metrics["segmentation_pass"] - 1.0).abs() < f64::EPSILON);
        // No accelerated runtime in the test environment.
        assert!((output.metrics["seg_used_accelerated"]).abs() < f64::EPSILON);
        assert!((output.metrics["seg_used_gpu"]).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_segmentation_prefers_aligned_input() {
        let harness = Harness::new();
        let scene = harness.scene_with_ingested().await;

        // Produce an aligned artifact first.
        let ctx = harness.ctx(&scene);
        registration::execute(&ctx).await.unwrap();

        let output = execute(&ctx).await.unwrap();
        assert_eq!(output.artifacts.len(), 3);
    }

    #[tokio::test]
    async fn test_segmentation_without_artifacts_is_client_error() {
        let harness = Harness::new();
        let scene = harness.empty_scene().await;

        let ctx = harness.ctx(&scene);
        let err = execute(&ctx).await.unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_binary_entropy_half_is_ln_two() {
        assert!((binary_entropy(0.5) - std::f64::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_binary_entropy_extremes_bounded_away_from_zero() {
        for p in [0.0, 1.0] {
            let h = binary_entropy(p);
            assert!(h > 0.0);
            assert!(h < 1e-6);
        }
    }

    #[test]
    fn test_binary_entropy_symmetry() {
        for p in [0.1, 0.25, 0.4] {
            assert!((binary_entropy(p) - binary_entropy(1.0 - p)).abs() < 1e-12);
        }
    }
}
