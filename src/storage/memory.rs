//! In-memory scene store for tests and local demo runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

use super::model::{Artifact, AuditLog, Metric, Scene, SweepCounts};
use super::SceneStore;

#[derive(Default)]
struct Inner {
    scenes: BTreeMap<Uuid, Scene>,
    artifacts: Vec<Artifact>,
    metrics: Vec<Metric>,
    audits: Vec<AuditLog>,
}

/// In-process store backed by `RwLock`-guarded maps.
///
/// Creation timestamps are strictly monotonic per store instance so
/// "latest of kind" is total-ordered even when rows are created within the
/// same clock tick.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    ticks: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strictly increasing timestamp: wall clock plus a microsecond counter.
    fn stamp(&self) -> DateTime<Utc> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        Utc::now() + Duration::microseconds(tick)
    }
}

#[async_trait]
impl SceneStore for MemoryStore {
    async fn create_scene(
        &self,
        source_uri: &str,
        crs: &str,
        sensor_meta: serde_json::Value,
    ) -> Result<Scene, StoreError> {
        let scene = Scene {
            id: Uuid::new_v4(),
            source_uri: source_uri.to_string(),
            crs: crs.to_string(),
            sensor_meta,
            created_at: self.stamp(),
        };
        self.inner
            .write()
            .await
            .scenes
            .insert(scene.id, scene.clone());
        Ok(scene)
    }

    async fn get_scene(&self, id: Uuid) -> Result<Option<Scene>, StoreError> {
        Ok(self.inner.read().await.scenes.get(&id).cloned())
    }

    async fn list_scenes(&self, limit: i64, offset: i64) -> Result<Vec<Scene>, StoreError> {
        let inner = self.inner.read().await;
        let mut scenes: Vec<Scene> = inner.scenes.values().cloned().collect();
        scenes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(scenes
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn delete_scene(&self, id: Uuid) -> Result<SweepCounts, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.scenes.remove(&id).is_none() {
            return Err(StoreError::scene_not_found(id));
        }
        let mut counts = SweepCounts::default();

        let before = inner.artifacts.len();
        inner.artifacts.retain(|a| a.scene_id != id);
        counts.artifacts = (before - inner.artifacts.len()) as u64;

        let before = inner.metrics.len();
        inner.metrics.retain(|m| m.scene_id != id);
        counts.metrics = (before - inner.metrics.len()) as u64;

        let before = inner.audits.len();
        inner.audits.retain(|a| a.scene_id != id);
        counts.audit_logs = (before - inner.audits.len()) as u64;

        Ok(counts)
    }

    async fn create_artifact(
        &self,
        scene_id: Uuid,
        kind: &str,
        uri: &str,
    ) -> Result<Artifact, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.scenes.contains_key(&scene_id) {
            return Err(StoreError::scene_not_found(scene_id));
        }
        let artifact = Artifact {
            id: Uuid::new_v4(),
            scene_id,
            kind: kind.to_string(),
            uri: uri.to_string(),
            created_at: self.stamp(),
        };
        inner.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .artifacts
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn latest_artifact(
        &self,
        scene_id: Uuid,
        kind: &str,
    ) -> Result<Option<Artifact>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .artifacts
            .iter()
            .filter(|a| a.scene_id == scene_id && a.kind == kind)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn earliest_artifact(
        &self,
        scene_id: Uuid,
        kind: &str,
    ) -> Result<Option<Artifact>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .artifacts
            .iter()
            .filter(|a| a.scene_id == scene_id && a.kind == kind)
            .min_by_key(|a| a.created_at)
            .cloned())
    }

    async fn artifacts_for_scene(&self, scene_id: Uuid) -> Result<Vec<Artifact>, StoreError> {
        let mut out: Vec<Artifact> = self
            .inner
            .read()
            .await
            .artifacts
            .iter()
            .filter(|a| a.scene_id == scene_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.created_at);
        Ok(out)
    }

    async fn create_metric(
        &self,
        scene_id: Uuid,
        name: &str,
        value: f64,
    ) -> Result<Metric, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.scenes.contains_key(&scene_id) {
            return Err(StoreError::scene_not_found(scene_id));
        }
        let metric = Metric {
            id: Uuid::new_v4(),
            scene_id,
            name: name.to_string(),
            value,
            created_at: self.stamp(),
        };
        inner.metrics.push(metric.clone());
        Ok(metric)
    }

    async fn metrics_for_scene(&self, scene_id: Uuid) -> Result<Vec<Metric>, StoreError> {
        let mut out: Vec<Metric> = self
            .inner
            .read()
            .await
            .metrics
            .iter()
            .filter(|m| m.scene_id == scene_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    async fn latest_metrics(&self, scene_id: Uuid) -> Result<BTreeMap<String, f64>, StoreError> {
        let series = self.metrics_for_scene(scene_id).await?;
        // Oldest-first iteration; later samples overwrite earlier ones.
        let mut latest = BTreeMap::new();
        for metric in series {
            latest.insert(metric.name, metric.value);
        }
        Ok(latest)
    }

    async fn create_audit(
        &self,
        scene_id: Uuid,
        action: &str,
        details: serde_json::Value,
    ) -> Result<AuditLog, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.scenes.contains_key(&scene_id) {
            return Err(StoreError::scene_not_found(scene_id));
        }
        let audit = AuditLog {
            id: Uuid::new_v4(),
            scene_id,
            action: action.to_string(),
            details,
            created_at: self.stamp(),
        };
        inner.audits.push(audit.clone());
        Ok(audit)
    }

    async fn audits_for_scene(&self, scene_id: Uuid) -> Result<Vec<AuditLog>, StoreError> {
        let mut out: Vec<AuditLog> = self
            .inner
            .read()
            .await
            .audits
            .iter()
            .filter(|a| a.scene_id == scene_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.created_at);
        Ok(out)
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<SweepCounts, StoreError> {
        let mut inner = self.inner.write().await;
        let mut counts = SweepCounts::default();

        let before = inner.artifacts.len();
        inner.artifacts.retain(|a| a.created_at >= cutoff);
        counts.artifacts = (before - inner.artifacts.len()) as u64;

        let before = inner.metrics.len();
        inner.metrics.retain(|m| m.created_at >= cutoff);
        counts.metrics = (before - inner.metrics.len()) as u64;

        let before = inner.audits.len();
        inner.audits.retain(|a| a.created_at >= cutoff);
        counts.audit_logs = (before - inner.audits.len()) as u64;

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::artifact_kinds;

    #[tokio::test]
    async fn test_latest_artifact_resolves_most_recent() {
        let store = MemoryStore::new();
        let scene = store
            .create_scene("/tmp/a.laz", "EPSG:3857", serde_json::json!({}))
            .await
            .unwrap();

        let first = store
            .create_artifact(scene.id, artifact_kinds::ALIGNED, "s3://b/one")
            .await
            .unwrap();
        let second = store
            .create_artifact(scene.id, artifact_kinds::ALIGNED, "s3://b/two")
            .await
            .unwrap();

        let latest = store
            .latest_artifact(scene.id, artifact_kinds::ALIGNED)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.id);

        let earliest = store
            .earliest_artifact(scene.id, artifact_kinds::ALIGNED)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(earliest.id, first.id);

        // Both remain queryable.
        let all = store.artifacts_for_scene(scene.id).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_latest_metrics_takes_newest_sample() {
        let store = MemoryStore::new();
        let scene = store
            .create_scene("/tmp/a.laz", "EPSG:3857", serde_json::json!({}))
            .await
            .unwrap();

        store.create_metric(scene.id, "rmse", 0.2).await.unwrap();
        store.create_metric(scene.id, "rmse", 0.05).await.unwrap();

        let latest = store.latest_metrics(scene.id).await.unwrap();
        assert!((latest["rmse"] - 0.05).abs() < f64::EPSILON);
        // The series keeps both samples.
        assert_eq!(store.metrics_for_scene(scene.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_child_rows_require_existing_scene() {
        let store = MemoryStore::new();
        let err = store
            .create_metric(Uuid::new_v4(), "rmse", 0.1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_scene_cascades() {
        let store = MemoryStore::new();
        let scene = store
            .create_scene("/tmp/a.laz", "EPSG:3857", serde_json::json!({}))
            .await
            .unwrap();
        store
            .create_artifact(scene.id, artifact_kinds::INGESTED, "s3://b/k")
            .await
            .unwrap();
        store.create_metric(scene.id, "rmse", 0.1).await.unwrap();
        store
            .create_audit(scene.id, "ingest", serde_json::json!({}))
            .await
            .unwrap();

        let counts = store.delete_scene(scene.id).await.unwrap();
        assert_eq!(counts.artifacts, 1);
        assert_eq!(counts.metrics, 1);
        assert_eq!(counts.audit_logs, 1);
        assert!(store.get_scene(scene.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_expired_keeps_recent_rows() {
        let store = MemoryStore::new();
        let scene = store
            .create_scene("/tmp/a.laz", "EPSG:3857", serde_json::json!({}))
            .await
            .unwrap();
        store
            .create_artifact(scene.id, artifact_kinds::INGESTED, "s3://b/k")
            .await
            .unwrap();

        // Cutoff in the past removes nothing.
        let counts = store
            .sweep_expired(Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(counts.artifacts, 0);

        // Cutoff in the future removes the artifact but keeps the scene.
        let counts = store
            .sweep_expired(Utc::now() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(counts.artifacts, 1);
        assert!(store.get_scene(scene.id).await.unwrap().is_some());
    }
}
