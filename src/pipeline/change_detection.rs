//! Change-detection stage executor.
//!
//! Baseline is the earliest `ingested` artifact; current is the latest
//! `aligned` when present, else the latest `ingested`. The voxel-diff
//! engine reports per-class added/removed/moved counts; drift and F1 are
//! derived here and `change_f1` feeds the `change_detection_pass` gate.

use std::time::Instant;

use serde_json::json;
use uuid::Uuid;

use crate::engines::{DiffRequest, VoxelDiffEngine as _};
use crate::error::PipelineError;
use crate::objectstore::{self, RetryPolicy};
use crate::observability;
use crate::storage::{artifact_kinds, SceneStore as _};
use crate::tracker::ExperimentTracker as _;

use super::{StageContext, StageKind, StageOutput};

/// Precision assumed when the engine does not measure one.
pub const DEFAULT_PRECISION: f64 = 0.80;
/// Recall assumed when the engine does not measure one.
pub const DEFAULT_RECALL: f64 = 0.75;

/// Harmonic mean of precision and recall; zero when both are zero.
pub fn f1_score(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        return 0.0;
    }
    2.0 * precision * recall / (precision + recall)
}

/// Runs the change-detection stage for one scene.
pub async fn execute(ctx: &StageContext<'_>) -> Result<StageOutput, PipelineError> {
    let started = Instant::now();
    let result = run(ctx).await;
    let elapsed = started.elapsed();

    let status = if result.is_ok() { "ok" } else { "error" };
    observability::record_stage(
        StageKind::ChangeDetection.as_str(),
        status,
        elapsed.as_secs_f64(),
    );

    let mut output = result?;
    let elapsed_ms = (elapsed.as_secs_f64() * 100_000.0).round() / 100.0;
    ctx.store
        .create_metric(ctx.scene_id, "change_detection_ms", elapsed_ms)
        .await?;
    output
        .metrics
        .insert("change_detection_ms".to_string(), elapsed_ms);

    ctx.tracker.log_metrics(&output.metrics).await;

    Ok(output)
}

async fn run(ctx: &StageContext<'_>) -> Result<StageOutput, PipelineError> {
    let baseline = ctx
        .store
        .earliest_artifact(ctx.scene_id, artifact_kinds::INGESTED)
        .await?
        .ok_or(PipelineError::MissingPrerequisite {
            stage: "change_detection",
            wanted: "baseline",
        })?;

    let current = match ctx
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
                stage: "change_detection",
                wanted: "current",
            })?,
    };

    let retry = RetryPolicy {
        max_attempts: ctx.config.storage_retry_attempts,
        base_delay: std::time::Duration::from_millis(ctx.config.storage_retry_base_ms),
    };

    let (bucket, key) = objectstore::parse_uri(&baseline.uri)?;
    let baseline_cloud = objectstore::get_with_retry(ctx.objects, bucket, key, retry).await?;
    let (bucket, key) = objectstore::parse_uri(&current.uri)?;
    let current_cloud = objectstore::get_with_retry(ctx.objects, bucket, key, retry).await?;

    let diff = ctx.change_engine.diff(
        &baseline_cloud,
        &current_cloud,
        &DiffRequest {
            voxel_size_m: ctx.config.change_voxel_size_m,
            learned: ctx.config.change_use_learned,
            pose_drift: ctx.config.change_pose_drift,
        },
    )?;

    let drift = diff.mask.moved as f64 / 1_u64.max(diff.mask.total()) as f64;
    let precision = diff.precision.unwrap_or(DEFAULT_PRECISION);
    let recall = diff.recall.unwrap_or(DEFAULT_RECALL);
    let f1 = f1_score(precision, recall);

    tracing::info!(
        scene_id = %ctx.scene_id,
        added = diff.mask.added,
        removed = diff.mask.removed,
        moved = diff.mask.moved,
        f1,
        "Change detection complete"
    );

    let mut output = StageOutput::default();
    let nonce = Uuid::new_v4().simple().to_string();
    let processed = &ctx.config.bucket_processed;

    let mask_key = format!("change/mask_{}_{nonce}.json", ctx.scene_id);
    let mask_body = json!({
        "mask_stats": diff.mask,
        "voxel_size_m": ctx.config.change_voxel_size_m,
    });
    let payload = serde_json::to_vec(&mask_body).map_err(crate::error::StoreError::from)?;
    objectstore::put_with_retry(ctx.objects, processed, &mask_key, &payload, retry).await?;
    let mask = ctx
        .store
        .create_artifact(
            ctx.scene_id,
            artifact_kinds::CHANGE_MASK,
            &objectstore::object_uri(processed, &mask_key),
        )
        .await?;
    output.artifacts.push(mask.id);

    let delta_key = format!("change/delta_{}_{nonce}.json", ctx.scene_id);
    let delta_body = json!({
        "added": diff.mask.added,
        "removed": diff.mask.removed,
        "moved": diff.mask.moved,
        "drift": drift,
        "per_class": diff.per_class,
    });
    let payload = serde_json::to_vec(&delta_body).map_err(crate::error::StoreError::from)?;
    objectstore::put_with_retry(ctx.objects, processed, &delta_key, &payload, retry).await?;
    let delta = ctx
        .store
        .create_artifact(
            ctx.scene_id,
            artifact_kinds::CHANGE_DELTA,
            &objectstore::object_uri(processed, &delta_key),
        )
        .await?;
    output.artifacts.push(delta.id);

    output.metrics.insert("change_precision".to_string(), precision);
    output.metrics.insert("change_recall".to_string(), recall);
    output.metrics.insert("change_f1".to_string(), f1);
    output.metrics.insert("change_drift".to_string(), drift);

    let pass = ctx
        .thresholds()
        .evaluate(StageKind::ChangeDetection, &output.metrics);
    output
        .metrics
        .insert("change_detection_pass".to_string(), super::gate_metric(pass));

    for (name, value) in &output.metrics {
        ctx.store.create_metric(ctx.scene_id, name, *value).await?;
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::registration;
    use crate::pipeline::testutil::Harness;

    #[test]
    fn test_f1_score_reference_value() {
        assert!((f1_score(0.80, 0.75) - 0.7742).abs() < 1e-4);
        assert!((f1_score(0.0, 0.0)).abs() < f64::EPSILON);
        assert!((f1_score(1.0, 1.0) - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_change_detection_on_ingested_only() {
        let harness = Harness::new();
        let scene = harness.scene_with_ingested().await;

        let ctx = harness.ctx(&scene);
        let output = execute(&ctx).await.unwrap();

        assert_eq!(output.artifacts.len(), 2);
        assert!((output.metrics["change_f1"] - 0.7742).abs() < 1e-4);
        assert!((output.metrics["change_detection_pass"] - 1.0).abs() < f64::EPSILON);
        // Plain mask: drift = 5 / 64.
        assert!((output.metrics["change_drift"] - 5.0 / 64.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_change_detection_uses_aligned_current_when_present() {
        let harness = Harness::new();
        let scene = harness.scene_with_ingested().await;

        let ctx = harness.ctx(&scene);
        registration::execute(&ctx).await.unwrap();
        let output = execute(&ctx).await.unwrap();
        assert_eq!(output.artifacts.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_baseline_is_client_error() {
        let harness = Harness::new();
        let scene = harness.empty_scene().await;

        let ctx = harness.ctx(&scene);
        let err = execute(&ctx).await.unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_learned_mode_scales_with_configured_pose_drift() {
        let mut harness = Harness::new();
        harness.config.change_use_learned = true;
        harness.config.change_pose_drift = 1.0;
        let scene = harness.scene_with_ingested().await;

        let ctx = harness.ctx(&scene);
        let output = execute(&ctx).await.unwrap();

        // Learned base {30, 12, 7} doubled: drift = 14 / 98.
        assert!((output.metrics["change_drift"] - 14.0 / 98.0).abs() < 1e-9);
    }
}
