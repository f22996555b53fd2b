//! Registration stage executor.
//!
//! Selects the latest `ingested` artifact, delegates to the registration
//! engine, persists the aligned cloud and residuals report, and records
//! quality metrics plus the `registration_pass` gate. Engine failures
//! surface as errors; a placeholder RMSE is not a measurement, so there is
//! no silent-degradation path.

use std::time::Instant;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::engines::{RegisterRequest, RegistrationEngine as _};
use crate::error::PipelineError;
use crate::objectstore::{self, RetryPolicy};
use crate::observability;
use crate::storage::{artifact_kinds, SceneStore as _};
use crate::tracker::ExperimentTracker as _;

use super::{StageContext, StageKind, StageOutput};

/// Runs the registration stage for one scene.
pub async fn execute(ctx: &StageContext<'_>) -> Result<StageOutput, PipelineError> {
    let started = Instant::now();
    let result = run(ctx).await;
    let elapsed = started.elapsed();

    let status = if result.is_ok() { "ok" } else { "error" };
    observability::record_stage(StageKind::Registration.as_str(), status, elapsed.as_secs_f64());

    let mut output = result?;
    let elapsed_ms = (elapsed.as_secs_f64() * 100_000.0).round() / 100.0;
    ctx.store
        .create_metric(ctx.scene_id, "registration_ms", elapsed_ms)
        .await?;
    output.metrics.insert("registration_ms".to_string(), elapsed_ms);

    // Best-effort forwarding; never affects the response.
    ctx.tracker.log_metrics(&output.metrics).await;

    Ok(output)
}

async fn run(ctx: &StageContext<'_>) -> Result<StageOutput, PipelineError> {
    let ingested = ctx
        .store
        .latest_artifact(ctx.scene_id, artifact_kinds::INGESTED)
        .await?
        .ok_or(PipelineError::MissingPrerequisite {
            stage: "registration",
            wanted: artifact_kinds::INGESTED,
        })?;

    let retry = RetryPolicy {
        max_attempts: ctx.config.storage_retry_attempts,
        base_delay: std::time::Duration::from_millis(ctx.config.storage_retry_base_ms),
    };

    let (bucket, key) = objectstore::parse_uri(&ingested.uri)?;
    let source_cloud = objectstore::get_with_retry(ctx.objects, bucket, key, retry).await?;

    let engine_out = ctx.registration_engine.register(&RegisterRequest {
        source_cloud: &source_cloud,
        target_cloud: None,
        crs: ctx.scene_crs,
    })?;

    tracing::info!(
        scene_id = %ctx.scene_id,
        rmse = engine_out.rmse,
        inlier_ratio = engine_out.inlier_ratio,
        "Registration complete"
    );

    let mut output = StageOutput::default();
    let nonce = Uuid::new_v4().simple().to_string();
    let processed = &ctx.config.bucket_processed;

    let aligned_key = format!("registration/aligned_{}_{nonce}.laz", ctx.scene_id);
    objectstore::put_with_retry(ctx.objects, processed, &aligned_key, &engine_out.aligned_cloud, retry)
        .await?;
    let aligned = ctx
        .store
        .create_artifact(
            ctx.scene_id,
            artifact_kinds::ALIGNED,
            &objectstore::object_uri(processed, &aligned_key),
        )
        .await?;
    output.artifacts.push(aligned.id);

    let residuals_key = format!("overlays/residuals_{}_{nonce}.json", ctx.scene_id);
    objectstore::put_with_retry(
        ctx.objects,
        processed,
        &residuals_key,
        &engine_out.residuals_report,
        retry,
    )
    .await?;
    let residuals = ctx
        .store
        .create_artifact(
            ctx.scene_id,
            artifact_kinds::RESIDUALS,
            &objectstore::object_uri(processed, &residuals_key),
        )
        .await?;
    output.artifacts.push(residuals.id);

    output
        .metrics
        .insert("rmse".to_string(), engine_out.rmse);
    output
        .metrics
        .insert("inlier_ratio".to_string(), engine_out.inlier_ratio);
    output.metrics.insert(
        "aligned_sha256".to_string(),
        content_hash_metric(&engine_out.aligned_cloud),
    );
    // Approximate reprojection signal: substring match on engine-reported
    // spatial-reference text. Not a correctness check.
    output.metrics.insert(
        "reprojection_ok".to_string(),
        super::gate_metric(engine_out.reported_srs.contains(ctx.scene_crs)),
    );

    let pass = ctx
        .thresholds()
        .evaluate(StageKind::Registration, &output.metrics);
    output
        .metrics
        .insert("registration_pass".to_string(), super::gate_metric(pass));

    for (name, value) in &output.metrics {
        ctx.store.create_metric(ctx.scene_id, name, *value).await?;
    }

    Ok(output)
}

/// Folds a content hash into a small traceability metric: first 8 hash
/// bytes interpreted big-endian, reduced mod 1e6.
fn content_hash_metric(data: &[u8]) -> f64 {
    let digest = Sha256::digest(data);
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 1_000_000) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{RegistrationEngine, RegistrationOutput};
    use crate::error::EngineError;
    use crate::pipeline::testutil::Harness;

    #[tokio::test]
    async fn test_registration_produces_artifacts_and_gate() {
        let harness = Harness::new();
        let scene = harness.scene_with_ingested().await;

        let ctx = harness.ctx(&scene);
        let output = execute(&ctx).await.unwrap();

        assert_eq!(output.artifacts.len(), 2);
        assert!((output.metrics["rmse"] - 0.05).abs() < 1e-9);
        assert!((output.metrics["inlier_ratio"] - 0.9).abs() < 1e-9);
        assert!((output.metrics["registration_pass"] - 1.0).abs() < f64::EPSILON);
        assert!((output.metrics["reprojection_ok"] - 1.0).abs() < f64::EPSILON);
        assert!(output.metrics.contains_key("registration_ms"));

        // Aligned and residuals rows are persisted with distinct kinds.
        let artifacts = harness.store.artifacts_for_scene(scene.id).await.unwrap();
        let kinds: Vec<&str> = artifacts.iter().map(|a| a.kind.as_str()).collect();
        assert!(kinds.contains(&artifact_kinds::ALIGNED));
        assert!(kinds.contains(&artifact_kinds::RESIDUALS));
    }

    #[tokio::test]
    async fn test_missing_ingested_artifact_is_client_error() {
        let harness = Harness::new();
        let scene = harness.empty_scene().await;

        let ctx = harness.ctx(&scene);
        let err = execute(&ctx).await.unwrap_err();
        assert!(err.is_client_error());
        assert!(matches!(err, PipelineError::MissingPrerequisite { .. }));
    }

    #[tokio::test]
    async fn test_repeated_runs_accumulate_artifacts() {
        let harness = Harness::new();
        let scene = harness.scene_with_ingested().await;

        let ctx = harness.ctx(&scene);
        let first = execute(&ctx).await.unwrap();
        let second = execute(&ctx).await.unwrap();
        assert_ne!(first.artifacts, second.artifacts);

        // Four artifact rows plus the ingested input, all queryable.
        let artifacts = harness.store.artifacts_for_scene(scene.id).await.unwrap();
        assert_eq!(artifacts.len(), 5);

        // Latest aligned resolves to the second run's artifact.
        let latest = harness
            .store
            .latest_artifact(scene.id, artifact_kinds::ALIGNED)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.artifacts[0]);
    }

    struct FailingEngine;

    impl RegistrationEngine for FailingEngine {
        fn register(
            &self,
            _request: &RegisterRequest<'_>,
        ) -> Result<RegistrationOutput, EngineError> {
            Err(EngineError::Registration("icp diverged".to_string()))
        }
    }

    #[tokio::test]
    async fn test_engine_failure_surfaces_without_placeholder_output() {
        let harness = Harness::new();
        let scene = harness.scene_with_ingested().await;

        let failing = FailingEngine;
        let mut ctx = harness.ctx(&scene);
        ctx.registration_engine = &failing;

        let err = execute(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Engine(_)));
        assert!(!err.is_client_error());

        // Nothing beyond the ingested input was persisted.
        let artifacts = harness.store.artifacts_for_scene(scene.id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert!(harness.store.metrics_for_scene(scene.id).await.unwrap().is_empty());
    }

    #[test]
    fn test_content_hash_metric_is_stable() {
        let a = content_hash_metric(b"cloud");
        let b = content_hash_metric(b"cloud");
        assert!((a - b).abs() < f64::EPSILON);
        assert!(a >= 0.0 && a < 1_000_000.0);
        assert!((content_hash_metric(b"other") - a).abs() > f64::EPSILON);
    }
}
