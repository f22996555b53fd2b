//! Durable storage for scenes, artifacts, metrics and audit entries.
//!
//! The pipeline consumes storage through the [`SceneStore`] trait so the
//! coordinator and stage executors never care which backend is wired in:
//!
//! - [`PostgresStore`]: sqlx-backed production store with cascading deletes.
//! - [`MemoryStore`]: in-process store for tests and local demo runs.
//!
//! Every artifact, metric and audit row references an existing scene, and
//! scene deletion cascades to all children.

pub mod memory;
pub mod model;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use model::{artifact_kinds, Artifact, AuditLog, Metric, Scene, SweepCounts};
pub use postgres::PostgresStore;

/// Persistence contract consumed by the pipeline.
#[async_trait]
pub trait SceneStore: Send + Sync {
    /// Creates a scene and returns the stored row.
    async fn create_scene(
        &self,
        source_uri: &str,
        crs: &str,
        sensor_meta: serde_json::Value,
    ) -> Result<Scene, StoreError>;

    /// Fetches a scene, `None` if absent.
    async fn get_scene(&self, id: Uuid) -> Result<Option<Scene>, StoreError>;

    /// Lists scenes most-recent-first.
    async fn list_scenes(&self, limit: i64, offset: i64) -> Result<Vec<Scene>, StoreError>;

    /// Deletes a scene and cascades to its artifacts, metrics and audit
    /// entries. Returns the counts of removed children.
    async fn delete_scene(&self, id: Uuid) -> Result<SweepCounts, StoreError>;

    /// Records an artifact row for a scene.
    async fn create_artifact(
        &self,
        scene_id: Uuid,
        kind: &str,
        uri: &str,
    ) -> Result<Artifact, StoreError>;

    /// Fetches one artifact by id, `None` if absent.
    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>, StoreError>;

    /// Most recent artifact of `kind` for the scene, `None` if absent.
    async fn latest_artifact(
        &self,
        scene_id: Uuid,
        kind: &str,
    ) -> Result<Option<Artifact>, StoreError>;

    /// Oldest artifact of `kind` for the scene, `None` if absent.
    async fn earliest_artifact(
        &self,
        scene_id: Uuid,
        kind: &str,
    ) -> Result<Option<Artifact>, StoreError>;

    /// All artifacts for a scene, oldest first.
    async fn artifacts_for_scene(&self, scene_id: Uuid) -> Result<Vec<Artifact>, StoreError>;

    /// Appends a metric sample.
    async fn create_metric(
        &self,
        scene_id: Uuid,
        name: &str,
        value: f64,
    ) -> Result<Metric, StoreError>;

    /// Full metric series for a scene, oldest first.
    async fn metrics_for_scene(&self, scene_id: Uuid) -> Result<Vec<Metric>, StoreError>;

    /// Latest value per metric name for a scene.
    async fn latest_metrics(&self, scene_id: Uuid) -> Result<BTreeMap<String, f64>, StoreError>;

    /// Appends an audit entry.
    async fn create_audit(
        &self,
        scene_id: Uuid,
        action: &str,
        details: serde_json::Value,
    ) -> Result<AuditLog, StoreError>;

    /// All audit entries for a scene, oldest first.
    async fn audits_for_scene(&self, scene_id: Uuid) -> Result<Vec<AuditLog>, StoreError>;

    /// Removes artifacts, metrics and audit rows created before `cutoff`.
    /// Scenes themselves are kept.
    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<SweepCounts, StoreError>;
}
