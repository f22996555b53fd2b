//! Read and admin surface over stored scenes.
//!
//! Scene detail, per-scene gate summaries against the latest metric per
//! name, run listings with pass/fail filters, presigned artifact access
//! through the URL cache, cascading scene deletion with best-effort blob
//! removal, and the retention sweep.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::gates::Thresholds;
use crate::objectstore::{self, ObjectStore};
use crate::pipeline::ArtifactUrlCache;
use crate::storage::{Artifact, AuditLog, Metric, Scene, SceneStore, SweepCounts};

/// Full view of a scene and its children.
#[derive(Debug, Serialize, Deserialize)]
pub struct SceneDetail {
    pub scene: Scene,
    pub artifacts: Vec<Artifact>,
    pub metrics: Vec<Metric>,
    pub audit: Vec<AuditLog>,
}

/// Loads a scene with artifacts, metrics and audit entries, each ordered
/// oldest first.
pub async fn scene_detail(
    store: &dyn SceneStore,
    scene_id: Uuid,
) -> Result<SceneDetail, PipelineError> {
    let scene = store
        .get_scene(scene_id)
        .await?
        .ok_or(PipelineError::SceneNotFound(scene_id))?;
    Ok(SceneDetail {
        artifacts: store.artifacts_for_scene(scene_id).await?,
        metrics: store.metrics_for_scene(scene_id).await?,
        audit: store.audits_for_scene(scene_id).await?,
        scene,
    })
}

/// Gate evaluation over a scene's latest metrics.
#[derive(Debug, Serialize, Deserialize)]
pub struct GateSummary {
    pub scene_id: Uuid,
    pub thresholds: Thresholds,
    pub rmse: Option<f64>,
    pub miou: Option<f64>,
    pub change_f1: Option<f64>,
    pub registration_pass: bool,
    pub segmentation_pass: bool,
    pub change_detection_pass: bool,
    pub overall_pass: bool,
}

/// Evaluates the gates against the latest value of each metric.
pub async fn gate_summary(
    store: &dyn SceneStore,
    thresholds: &Thresholds,
    scene_id: Uuid,
) -> Result<GateSummary, PipelineError> {
    if store.get_scene(scene_id).await?.is_none() {
        return Err(PipelineError::SceneNotFound(scene_id));
    }
    let latest = store.latest_metrics(scene_id).await?;

    use crate::pipeline::StageKind;
    let registration_pass = thresholds.evaluate(StageKind::Registration, &latest);
    let segmentation_pass = thresholds.evaluate(StageKind::Segmentation, &latest);
    let change_detection_pass = thresholds.evaluate(StageKind::ChangeDetection, &latest);

    Ok(GateSummary {
        scene_id,
        thresholds: thresholds.clone(),
        rmse: latest.get("rmse").copied(),
        miou: latest.get("miou").copied(),
        change_f1: latest.get("change_f1").copied(),
        registration_pass,
        segmentation_pass,
        change_detection_pass,
        overall_pass: registration_pass && segmentation_pass && change_detection_pass,
    })
}

/// One row in the run listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunListItem {
    pub scene_id: Uuid,
    pub created_at: chrono::DateTime<Utc>,
    pub rmse: Option<f64>,
    pub miou: Option<f64>,
    pub change_f1: Option<f64>,
    pub registration_pass: bool,
    pub segmentation_pass: bool,
    pub change_detection_pass: bool,
    pub overall_pass: bool,
}

/// Filters for [`list_runs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFilter {
    pub only_failed: bool,
    pub only_passed: bool,
}

/// Lists scenes most-recent-first with their recorded gate outcomes.
///
/// Gates come from the persisted `*_pass` metrics; a stage that never ran
/// counts as failed in this historical view.
pub async fn list_runs(
    store: &dyn SceneStore,
    limit: i64,
    offset: i64,
    filter: RunFilter,
) -> Result<Vec<RunListItem>, PipelineError> {
    let scenes = store.list_scenes(limit, offset).await?;
    let mut items = Vec::with_capacity(scenes.len());
    for scene in scenes {
        let latest = store.latest_metrics(scene.id).await?;
        let gate = |name: &str| latest.get(name).is_some_and(|v| *v >= 1.0);
        let registration_pass = gate("registration_pass");
        let segmentation_pass = gate("segmentation_pass");
        let change_detection_pass = gate("change_detection_pass");
        let overall_pass = registration_pass && segmentation_pass && change_detection_pass;

        if filter.only_failed && overall_pass {
            continue;
        }
        if filter.only_passed && !overall_pass {
            continue;
        }
        items.push(RunListItem {
            scene_id: scene.id,
            created_at: scene.created_at,
            rmse: latest.get("rmse").copied(),
            miou: latest.get("miou").copied(),
            change_f1: latest.get("change_f1").copied(),
            registration_pass,
            segmentation_pass,
            change_detection_pass,
            overall_pass,
        });
    }
    Ok(items)
}

/// Presigned access to one artifact.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArtifactAccess {
    pub artifact_id: Uuid,
    pub kind: String,
    pub uri: String,
    pub url: String,
    /// Seconds until the cached URL is refreshed; `None` for non-blob URIs.
    pub expires_in_seconds: Option<u64>,
}

/// Resolves an access URL for an artifact, consulting the cache first.
pub async fn artifact_url(
    store: &dyn SceneStore,
    objects: &dyn ObjectStore,
    cache: &ArtifactUrlCache,
    config: &AppConfig,
    artifact_id: Uuid,
) -> Result<ArtifactAccess, PipelineError> {
    let artifact = store
        .get_artifact(artifact_id)
        .await?
        .ok_or(PipelineError::ArtifactNotFound(artifact_id))?;

    let (url, expires_in_seconds) = match objectstore::parse_uri(&artifact.uri) {
        Ok((bucket, key)) => {
            let url = match cache.get(artifact_id) {
                Some(url) => url,
                None => {
                    let url = objects
                        .presign(bucket, key, config.presign_expiry_secs)
                        .await?;
                    cache.put(artifact_id, url.clone(), config.presign_expiry_secs);
                    url
                }
            };
            (url, cache.ttl_remaining(artifact_id))
        }
        // Non-blob URIs pass through untouched.
        Err(_) => (artifact.uri.clone(), None),
    };

    Ok(ArtifactAccess {
        artifact_id,
        kind: artifact.kind,
        uri: artifact.uri,
        url,
        expires_in_seconds,
    })
}

/// Invalidates the cached URL and resolves a fresh one.
pub async fn refresh_artifact_url(
    store: &dyn SceneStore,
    objects: &dyn ObjectStore,
    cache: &ArtifactUrlCache,
    config: &AppConfig,
    artifact_id: Uuid,
) -> Result<ArtifactAccess, PipelineError> {
    cache.invalidate(artifact_id);
    artifact_url(store, objects, cache, config, artifact_id).await
}

/// Deletes a scene, cascading to children and best-effort removing the
/// backing blobs.
pub async fn delete_scene(
    store: &dyn SceneStore,
    objects: &dyn ObjectStore,
    scene_id: Uuid,
) -> Result<SweepCounts, PipelineError> {
    let artifacts = store.artifacts_for_scene(scene_id).await?;
    for artifact in &artifacts {
        if let Ok((bucket, key)) = objectstore::parse_uri(&artifact.uri) {
            if let Err(err) = objects.delete(bucket, key).await {
                tracing::warn!(
                    artifact_id = %artifact.id,
                    error = %err,
                    "Failed to remove backing blob, continuing"
                );
            }
        }
    }
    let counts = store.delete_scene(scene_id).await?;
    tracing::info!(
        scene_id = %scene_id,
        artifacts = counts.artifacts,
        metrics = counts.metrics,
        "Scene deleted"
    );
    Ok(counts)
}

/// Removes artifacts, metrics and audit rows older than the retention
/// window.
pub async fn cleanup_expired(
    store: &dyn SceneStore,
    retention_days: u32,
) -> Result<SweepCounts, PipelineError> {
    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
    let counts = store.sweep_expired(cutoff).await?;
    tracing::info!(
        cutoff = %cutoff,
        artifacts = counts.artifacts,
        metrics = counts.metrics,
        audit_logs = counts.audit_logs,
        "Retention sweep complete"
    );
    Ok(counts)
}
