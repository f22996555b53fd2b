//! Pipeline run coordination.
//!
//! A run processes one scene through a requested subset of stages:
//!
//! 1. The coordinator loads the scene and always computes the orchestrator
//!    plan + lineage for the requested set.
//! 2. Per-run config overrides are applied onto an immutable snapshot.
//! 3. Requested stages execute strictly in canonical order
//!    (registration → segmentation → change detection).
//! 4. Each stage selects its inputs from stored artifacts, calls its engine,
//!    persists outputs and metrics, and computes its quality gate.
//! 5. Stage results merge into one accumulator; `overall_pass` is the AND of
//!    the gates of the stages requested in this call.
//!
//! Runs are synchronous on the caller's task: there is no queue, no
//! cross-stage rollback, and no mutual exclusion across concurrent runs on
//! the same scene.

pub mod change_detection;
pub mod coordinator;
pub mod registration;
pub mod segmentation;
pub mod url_cache;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engines::{ClassifierEngine, RegistrationEngine, VoxelDiffEngine};
use crate::gates::Thresholds;
use crate::objectstore::ObjectStore;
use crate::storage::SceneStore;
use crate::tracker::ExperimentTracker;

pub use coordinator::{PipelineRunCoordinator, RunOutcome};
pub use url_cache::ArtifactUrlCache;

/// Pipeline stages, declared in canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Registration,
    Segmentation,
    ChangeDetection,
}

impl StageKind {
    /// All stages in canonical execution order.
    pub const CANONICAL: [StageKind; 3] = [
        StageKind::Registration,
        StageKind::Segmentation,
        StageKind::ChangeDetection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Registration => "registration",
            StageKind::Segmentation => "segmentation",
            StageKind::ChangeDetection => "change_detection",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration" => Ok(StageKind::Registration),
            "segmentation" => Ok(StageKind::Segmentation),
            "change_detection" => Ok(StageKind::ChangeDetection),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Everything a stage executor needs for one run, threaded explicitly so no
/// stage ever reads shared mutable state.
pub struct StageContext<'a> {
    pub scene_id: Uuid,
    pub scene_crs: &'a str,
    pub store: &'a dyn SceneStore,
    pub objects: &'a dyn ObjectStore,
    pub tracker: &'a dyn ExperimentTracker,
    /// Immutable per-run config snapshot (base config + overrides).
    pub config: &'a AppConfig,
    pub registration_engine: &'a dyn RegistrationEngine,
    pub classifier_engine: &'a dyn ClassifierEngine,
    pub change_engine: &'a dyn VoxelDiffEngine,
}

impl StageContext<'_> {
    /// Gate thresholds from the per-run snapshot.
    pub fn thresholds(&self) -> &Thresholds {
        &self.config.thresholds
    }
}

/// Artifacts and metrics produced by one stage execution.
#[derive(Debug, Default)]
pub struct StageOutput {
    pub artifacts: Vec<Uuid>,
    pub metrics: BTreeMap<String, f64>,
}

/// Gate outcomes are stored as 0.0/1.0 metrics, never as booleans, so they
/// live in the same time series as every other measurement.
pub(crate) fn gate_metric(pass: bool) -> f64 {
    if pass {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::engines::{CpuClassifier, LocalChangeEngine, LocalRegistrationEngine};
    use crate::objectstore::{self, MemoryObjectStore, ObjectStore as _};
    use crate::storage::{artifact_kinds, MemoryStore, Scene, SceneStore as _};
    use crate::tracker::RecordingTracker;

    /// Wires the in-memory collaborators behind a stage context.
    pub struct Harness {
        pub store: MemoryStore,
        pub objects: MemoryObjectStore,
        pub tracker: RecordingTracker,
        pub config: AppConfig,
        pub registration: LocalRegistrationEngine,
        pub classifier: CpuClassifier,
        pub change: LocalChangeEngine,
    }

    impl Harness {
        pub fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                objects: MemoryObjectStore::new(),
                tracker: RecordingTracker::new(),
                config: AppConfig::default(),
                registration: LocalRegistrationEngine::new(),
                classifier: CpuClassifier::new(),
                change: LocalChangeEngine::new(),
            }
        }

        pub fn ctx<'a>(&'a self, scene: &'a Scene) -> StageContext<'a> {
            StageContext {
                scene_id: scene.id,
                scene_crs: &scene.crs,
                store: &self.store,
                objects: &self.objects,
                tracker: &self.tracker,
                config: &self.config,
                registration_engine: &self.registration,
                classifier_engine: &self.classifier,
                change_engine: &self.change,
            }
        }

        pub async fn empty_scene(&self) -> Scene {
            self.store
                .create_scene("/tmp/scan.laz", "EPSG:3857", serde_json::json!({}))
                .await
                .unwrap()
        }

        pub async fn scene_with_ingested(&self) -> Scene {
            let scene = self.empty_scene().await;
            let key = format!("ingest/{}.laz", scene.id);
            self.objects
                .put(&self.config.bucket_processed, &key, b"cloud bytes")
                .await
                .unwrap();
            self.store
                .create_artifact(
                    scene.id,
                    artifact_kinds::INGESTED,
                    &objectstore::object_uri(&self.config.bucket_processed, &key),
                )
                .await
                .unwrap();
            scene
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order() {
        assert!(StageKind::Registration < StageKind::Segmentation);
        assert!(StageKind::Segmentation < StageKind::ChangeDetection);

        let mut shuffled = vec![
            StageKind::ChangeDetection,
            StageKind::Registration,
            StageKind::Segmentation,
        ];
        shuffled.sort();
        assert_eq!(shuffled, StageKind::CANONICAL.to_vec());
    }

    #[test]
    fn test_stage_kind_round_trips_through_str() {
        for stage in StageKind::CANONICAL {
            assert_eq!(stage.as_str().parse::<StageKind>().unwrap(), stage);
        }
        assert!("segmentations".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_stage_kind_serde_names() {
        let json = serde_json::to_string(&StageKind::ChangeDetection).unwrap();
        assert_eq!(json, "\"change_detection\"");
    }
}
