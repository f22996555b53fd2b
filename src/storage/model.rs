//! Persistent row types for scenes and their children.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tracked unit of point-cloud data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: Uuid,
    /// Where the cloud came from (file path or upload URI).
    pub source_uri: String,
    /// Spatial reference code, e.g. `EPSG:3857`.
    pub crs: String,
    /// Free-form sensor metadata.
    pub sensor_meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A named, timestamped output blob from a stage. Immutable once created;
/// "latest of kind" means maximum creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub scene_id: Uuid,
    /// Open set of kind labels, see [`artifact_kinds`].
    pub kind: String,
    pub uri: String,
    pub created_at: DateTime<Utc>,
}

/// A named scalar tied to a scene. Append-only time series: multiple values
/// per name coexist and "current" is the most recent by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: Uuid,
    pub scene_id: Uuid,
    pub name: String,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

/// Append-only provenance entry. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub scene_id: Uuid,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Row counts removed by a cascade delete or retention sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SweepCounts {
    pub artifacts: u64,
    pub metrics: u64,
    pub audit_logs: u64,
}

/// Well-known artifact kind labels. The set is open; stages may record
/// additional kinds (e.g. `export_potree`).
pub mod artifact_kinds {
    /// Normalized cloud recorded at intake.
    pub const INGESTED: &str = "ingested";
    /// Registered cloud.
    pub const ALIGNED: &str = "aligned";
    /// Registration residuals report.
    pub const RESIDUALS: &str = "residuals";
    /// Per-class count summary.
    pub const SEGMENTATION_CLASSES: &str = "segmentation_classes";
    /// Mean-confidence summary.
    pub const SEGMENTATION_CONFIDENCE: &str = "segmentation_confidence";
    /// Mean-entropy summary.
    pub const SEGMENTATION_ENTROPY: &str = "segmentation_entropy";
    /// Change mask statistics.
    pub const CHANGE_MASK: &str = "change_mask";
    /// Change delta table.
    pub const CHANGE_DELTA: &str = "change_delta";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_kind_labels() {
        assert_eq!(artifact_kinds::INGESTED, "ingested");
        assert_eq!(artifact_kinds::ALIGNED, "aligned");
        assert_eq!(artifact_kinds::CHANGE_DELTA, "change_delta");
    }

    #[test]
    fn test_scene_serializes_round_trip() {
        let scene = Scene {
            id: Uuid::new_v4(),
            source_uri: "/tmp/scan.laz".to_string(),
            crs: "EPSG:3857".to_string(),
            sensor_meta: serde_json::json!({"sensor": "vlp-16"}),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&scene).unwrap();
        let back: Scene = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, scene.id);
        assert_eq!(back.crs, "EPSG:3857");
    }
}
