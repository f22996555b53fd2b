//! PostgreSQL scene store backed by sqlx.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;

use super::model::{Artifact, AuditLog, Metric, Scene, SweepCounts};
use super::schema;
use super::SceneStore;

/// PostgreSQL-backed store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects to the database and returns a new store.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the schema statements. Idempotent.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in schema::all_schema_statements() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn scene_from_row(row: &sqlx::postgres::PgRow) -> Scene {
        Scene {
            id: row.get("id"),
            source_uri: row.get("source_uri"),
            crs: row.get("crs"),
            sensor_meta: row
                .get::<Option<serde_json::Value>, _>("sensor_meta")
                .unwrap_or(serde_json::Value::Null),
            created_at: row.get("created_at"),
        }
    }

    fn artifact_from_row(row: &sqlx::postgres::PgRow) -> Artifact {
        Artifact {
            id: row.get("id"),
            scene_id: row.get("scene_id"),
            kind: row.get("kind"),
            uri: row.get("uri"),
            created_at: row.get("created_at"),
        }
    }

    async fn artifact_by_order(
        &self,
        scene_id: Uuid,
        kind: &str,
        descending: bool,
    ) -> Result<Option<Artifact>, StoreError> {
        let query = if descending {
            r#"
            SELECT id, scene_id, kind, uri, created_at
            FROM artifacts
            WHERE scene_id = $1 AND kind = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        } else {
            r#"
            SELECT id, scene_id, kind, uri, created_at
            FROM artifacts
            WHERE scene_id = $1 AND kind = $2
            ORDER BY created_at ASC
            LIMIT 1
            "#
        };
        let row = sqlx::query(query)
            .bind(scene_id)
            .bind(kind)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::artifact_from_row))
    }
}

#[async_trait]
impl SceneStore for PostgresStore {
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
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO scenes (id, source_uri, crs, sensor_meta, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(scene.id)
        .bind(&scene.source_uri)
        .bind(&scene.crs)
        .bind(&scene.sensor_meta)
        .bind(scene.created_at)
        .execute(&self.pool)
        .await?;
        Ok(scene)
    }

    async fn get_scene(&self, id: Uuid) -> Result<Option<Scene>, StoreError> {
        let row = sqlx::query(
            "SELECT id, source_uri, crs, sensor_meta, created_at FROM scenes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::scene_from_row))
    }

    async fn list_scenes(&self, limit: i64, offset: i64) -> Result<Vec<Scene>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_uri, crs, sensor_meta, created_at
            FROM scenes
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::scene_from_row).collect())
    }

    async fn delete_scene(&self, id: Uuid) -> Result<SweepCounts, StoreError> {
        let mut tx = self.pool.begin().await?;

        let counts_row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM artifacts WHERE scene_id = $1) AS artifacts,
                (SELECT COUNT(*) FROM metrics WHERE scene_id = $1) AS metrics,
                (SELECT COUNT(*) FROM audit_logs WHERE scene_id = $1) AS audit_logs
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM scenes WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::scene_not_found(id));
        }
        tx.commit().await?;

        Ok(SweepCounts {
            artifacts: counts_row.get::<i64, _>("artifacts") as u64,
            metrics: counts_row.get::<i64, _>("metrics") as u64,
            audit_logs: counts_row.get::<i64, _>("audit_logs") as u64,
        })
    }

    async fn create_artifact(
        &self,
        scene_id: Uuid,
        kind: &str,
        uri: &str,
    ) -> Result<Artifact, StoreError> {
        let artifact = Artifact {
            id: Uuid::new_v4(),
            scene_id,
            kind: kind.to_string(),
            uri: uri.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO artifacts (id, scene_id, kind, uri, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(artifact.id)
        .bind(artifact.scene_id)
        .bind(&artifact.kind)
        .bind(&artifact.uri)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await?;
        Ok(artifact)
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>, StoreError> {
        let row = sqlx::query(
            "SELECT id, scene_id, kind, uri, created_at FROM artifacts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::artifact_from_row))
    }

    async fn latest_artifact(
        &self,
        scene_id: Uuid,
        kind: &str,
    ) -> Result<Option<Artifact>, StoreError> {
        self.artifact_by_order(scene_id, kind, true).await
    }

    async fn earliest_artifact(
        &self,
        scene_id: Uuid,
        kind: &str,
    ) -> Result<Option<Artifact>, StoreError> {
        self.artifact_by_order(scene_id, kind, false).await
    }

    async fn artifacts_for_scene(&self, scene_id: Uuid) -> Result<Vec<Artifact>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, scene_id, kind, uri, created_at
            FROM artifacts
            WHERE scene_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(scene_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::artifact_from_row).collect())
    }

    async fn create_metric(
        &self,
        scene_id: Uuid,
        name: &str,
        value: f64,
    ) -> Result<Metric, StoreError> {
        let metric = Metric {
            id: Uuid::new_v4(),
            scene_id,
            name: name.to_string(),
            value,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO metrics (id, scene_id, name, value, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(metric.id)
        .bind(metric.scene_id)
        .bind(&metric.name)
        .bind(metric.value)
        .bind(metric.created_at)
        .execute(&self.pool)
        .await?;
        Ok(metric)
    }

    async fn metrics_for_scene(&self, scene_id: Uuid) -> Result<Vec<Metric>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, scene_id, name, value, created_at
            FROM metrics
            WHERE scene_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(scene_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Metric {
                id: row.get("id"),
                scene_id: row.get("scene_id"),
                name: row.get("name"),
                value: row.get("value"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn latest_metrics(&self, scene_id: Uuid) -> Result<BTreeMap<String, f64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (name) name, value
            FROM metrics
            WHERE scene_id = $1
            ORDER BY name, created_at DESC
            "#,
        )
        .bind(scene_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("name"), row.get::<f64, _>("value")))
            .collect())
    }

    async fn create_audit(
        &self,
        scene_id: Uuid,
        action: &str,
        details: serde_json::Value,
    ) -> Result<AuditLog, StoreError> {
        let audit = AuditLog {
            id: Uuid::new_v4(),
            scene_id,
            action: action.to_string(),
            details,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, scene_id, action, details, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(audit.id)
        .bind(audit.scene_id)
        .bind(&audit.action)
        .bind(&audit.details)
        .bind(audit.created_at)
        .execute(&self.pool)
        .await?;
        Ok(audit)
    }

    async fn audits_for_scene(&self, scene_id: Uuid) -> Result<Vec<AuditLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, scene_id, action, details, created_at
            FROM audit_logs
            WHERE scene_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(scene_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| AuditLog {
                id: row.get("id"),
                scene_id: row.get("scene_id"),
                action: row.get("action"),
                details: row
                    .get::<Option<serde_json::Value>, _>("details")
                    .unwrap_or(serde_json::Value::Null),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<SweepCounts, StoreError> {
        let mut tx = self.pool.begin().await?;

        let artifacts = sqlx::query("DELETE FROM artifacts WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let metrics = sqlx::query("DELETE FROM metrics WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let audit_logs = sqlx::query("DELETE FROM audit_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(SweepCounts {
            artifacts,
            metrics,
            audit_logs,
        })
    }
}
