//! Pipeline run coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engines::{ClassifierEngine, RegistrationEngine, VoxelDiffEngine};
use crate::error::PipelineError;
use crate::objectstore::ObjectStore;
use crate::orchestrator::{OrchestratorBackend, RunDescriptor};
use crate::storage::SceneStore;
use crate::tracker::ExperimentTracker;

use super::{change_detection, registration, segmentation};
use super::{StageContext, StageKind, StageOutput};

/// Aggregate result of a pipeline run.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunOutcome {
    pub scene_id: Uuid,
    /// Requested stages, echoed in the caller's order.
    pub steps: Vec<StageKind>,
    /// Ids of every artifact produced by this run.
    pub artifacts: Vec<Uuid>,
    /// Merged metrics from every executed stage, plus `overall_pass`.
    pub metrics: BTreeMap<String, f64>,
    /// Advisory plan + lineage from the orchestrator backend.
    pub orchestrator: RunDescriptor,
}

/// Sequences stage executors over a scene and merges their results.
///
/// Collaborators are injected once at startup. Each run threads an
/// immutable config snapshot through the stage executors, so concurrent
/// runs never observe each other's overrides.
pub struct PipelineRunCoordinator {
    store: Arc<dyn SceneStore>,
    objects: Arc<dyn ObjectStore>,
    tracker: Arc<dyn ExperimentTracker>,
    orchestrator: Arc<dyn OrchestratorBackend>,
    registration_engine: Arc<dyn RegistrationEngine>,
    classifier_engine: Arc<dyn ClassifierEngine>,
    change_engine: Arc<dyn VoxelDiffEngine>,
    base_config: AppConfig,
}

impl PipelineRunCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SceneStore>,
        objects: Arc<dyn ObjectStore>,
        tracker: Arc<dyn ExperimentTracker>,
        orchestrator: Arc<dyn OrchestratorBackend>,
        registration_engine: Arc<dyn RegistrationEngine>,
        classifier_engine: Arc<dyn ClassifierEngine>,
        change_engine: Arc<dyn VoxelDiffEngine>,
        base_config: AppConfig,
    ) -> Self {
        Self {
            store,
            objects,
            tracker,
            orchestrator,
            registration_engine,
            classifier_engine,
            change_engine,
            base_config,
        }
    }

    /// The base configuration runs start from before overrides.
    pub fn base_config(&self) -> &AppConfig {
        &self.base_config
    }

    /// Runs the requested stages for a scene.
    ///
    /// Stages execute strictly in canonical order regardless of the order
    /// supplied. A stage failure aborts the remaining stages; outputs
    /// already persisted stay committed (there is no cross-stage rollback).
    pub async fn run(
        &self,
        scene_id: Uuid,
        steps: &[StageKind],
        overrides: Option<&BTreeMap<String, Value>>,
    ) -> Result<RunOutcome, PipelineError> {
        let scene = self
            .store
            .get_scene(scene_id)
            .await?
            .ok_or(PipelineError::SceneNotFound(scene_id))?;

        // Plan + lineage are always computed for the requested set,
        // independent of which stages actually execute.
        let descriptor = self.orchestrator.describe_run(scene_id, steps).await?;

        // All-or-nothing override application onto an immutable snapshot.
        let empty = BTreeMap::new();
        let snapshot = self
            .base_config
            .with_overrides(overrides.unwrap_or(&empty))?;

        let ctx = StageContext {
            scene_id,
            scene_crs: &scene.crs,
            store: self.store.as_ref(),
            objects: self.objects.as_ref(),
            tracker: self.tracker.as_ref(),
            config: &snapshot,
            registration_engine: self.registration_engine.as_ref(),
            classifier_engine: self.classifier_engine.as_ref(),
            change_engine: self.change_engine.as_ref(),
        };

        let mut artifacts = Vec::new();
        let mut metrics = BTreeMap::new();

        for stage in StageKind::CANONICAL {
            if !steps.contains(&stage) {
                continue;
            }
            tracing::debug!(scene_id = %scene_id, stage = %stage, "Executing stage");
            let output = match stage {
                StageKind::Registration => registration::execute(&ctx).await?,
                StageKind::Segmentation => segmentation::execute(&ctx).await?,
                StageKind::ChangeDetection => change_detection::execute(&ctx).await?,
            };
            merge(&mut artifacts, &mut metrics, output);
        }

        // Overall gate considers only the stages requested in this call; a
        // non-requested stage's historical gate does not participate.
        let overall = steps.iter().all(|stage| {
            metrics
                .get(gate_key(*stage))
                .is_some_and(|v| *v >= 1.0)
        });
        let overall_metric = super::gate_metric(overall);
        self.store
            .create_metric(scene_id, "overall_pass", overall_metric)
            .await?;
        metrics.insert("overall_pass".to_string(), overall_metric);

        self.audit_run(scene_id, steps, &metrics).await;

        if let Err(err) = self.orchestrator.complete(descriptor.run_id).await {
            tracing::debug!(run_id = %descriptor.run_id, error = %err, "Advisory run completion skipped");
        }

        Ok(RunOutcome {
            scene_id,
            steps: steps.to_vec(),
            artifacts,
            metrics,
            orchestrator: descriptor,
        })
    }

    /// Persists the run summary audit entry. Best-effort: audit failures
    /// never fail a run that already produced its outputs.
    async fn audit_run(
        &self,
        scene_id: Uuid,
        steps: &[StageKind],
        metrics: &BTreeMap<String, f64>,
    ) {
        let mut key_metrics = serde_json::Map::new();
        for name in [
            "rmse",
            "inlier_ratio",
            "miou",
            "change_f1",
            "registration_pass",
            "segmentation_pass",
            "change_detection_pass",
            "overall_pass",
        ] {
            if let Some(value) = metrics.get(name) {
                key_metrics.insert(name.to_string(), json!(value));
            }
        }
        let details = json!({
            "steps": steps,
            "metrics": key_metrics,
        });
        if let Err(err) = self
            .store
            .create_audit(scene_id, "pipeline_run", details)
            .await
        {
            tracing::warn!(scene_id = %scene_id, error = %err, "Failed to write run audit entry");
        }
    }
}

fn gate_key(stage: StageKind) -> &'static str {
    match stage {
        StageKind::Registration => "registration_pass",
        StageKind::Segmentation => "segmentation_pass",
        StageKind::ChangeDetection => "change_detection_pass",
    }
}

fn merge(artifacts: &mut Vec<Uuid>, metrics: &mut BTreeMap<String, f64>, output: StageOutput) {
    artifacts.extend(output.artifacts);
    metrics.extend(output.metrics);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{CpuClassifier, LocalChangeEngine, LocalRegistrationEngine};
    use crate::objectstore::{self, MemoryObjectStore};
    use crate::orchestrator::LocalOrchestrator;
    use crate::storage::{artifact_kinds, MemoryStore};
    use crate::tracker::NoopTracker;
    use serde_json::json;

    async fn coordinator() -> (PipelineRunCoordinator, Arc<MemoryStore>, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let coordinator = PipelineRunCoordinator::new(
            store.clone(),
            objects.clone(),
            Arc::new(NoopTracker::new()),
            Arc::new(LocalOrchestrator::new(1)),
            Arc::new(LocalRegistrationEngine::new()),
            Arc::new(CpuClassifier::new()),
            Arc::new(LocalChangeEngine::new()),
            AppConfig::default(),
        );
        (coordinator, store, objects)
    }

    async fn seeded_scene(
        store: &MemoryStore,
        objects: &MemoryObjectStore,
        config: &AppConfig,
    ) -> Uuid {
        use crate::objectstore::ObjectStore as _;
        let scene = store
            .create_scene("/tmp/scan.laz", "EPSG:3857", json!({}))
            .await
            .unwrap();
        let key = format!("ingest/{}.laz", scene.id);
        objects
            .put(&config.bucket_processed, &key, b"cloud bytes")
            .await
            .unwrap();
        store
            .create_artifact(
                scene.id,
                artifact_kinds::INGESTED,
                &objectstore::object_uri(&config.bucket_processed, &key),
            )
            .await
            .unwrap();
        scene.id
    }

    #[tokio::test]
    async fn test_unknown_scene_is_client_error() {
        let (coordinator, _, _) = coordinator().await;
        let err = coordinator
            .run(Uuid::new_v4(), &[StageKind::Registration], None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SceneNotFound(_)));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_canonical_order_overrides_request_order() {
        let (coordinator, store, objects) = coordinator().await;
        let scene_id = seeded_scene(&store, &objects, coordinator.base_config()).await;

        // Change detection requested first still executes after
        // registration: its "current" input resolves to the aligned
        // artifact registration just produced.
        let outcome = coordinator
            .run(
                scene_id,
                &[StageKind::ChangeDetection, StageKind::Registration],
                None,
            )
            .await
            .unwrap();

        // Steps echo the caller's order.
        assert_eq!(
            outcome.steps,
            vec![StageKind::ChangeDetection, StageKind::Registration]
        );

        // Registration artifacts (aligned, residuals) precede change
        // artifacts in the merged accumulator.
        let kinds: Vec<String> = {
            let mut kinds = Vec::new();
            for id in &outcome.artifacts {
                kinds.push(store.get_artifact(*id).await.unwrap().unwrap().kind);
            }
            kinds
        };
        assert_eq!(
            kinds,
            vec![
                artifact_kinds::ALIGNED.to_string(),
                artifact_kinds::RESIDUALS.to_string(),
                artifact_kinds::CHANGE_MASK.to_string(),
                artifact_kinds::CHANGE_DELTA.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_overall_pass_covers_only_requested_stages() {
        let (coordinator, store, objects) = coordinator().await;
        let scene_id = seeded_scene(&store, &objects, coordinator.base_config()).await;

        let outcome = coordinator
            .run(scene_id, &[StageKind::Registration], None)
            .await
            .unwrap();

        assert!((outcome.metrics["overall_pass"] - 1.0).abs() < f64::EPSILON);
        // Only registration gates participated.
        assert!(!outcome.metrics.contains_key("segmentation_pass"));
        assert!(!outcome.metrics.contains_key("change_detection_pass"));

        // overall_pass is persisted as a metric row.
        let latest = store.latest_metrics(scene_id).await.unwrap();
        assert!((latest["overall_pass"] - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_overall_pass_fails_when_a_requested_gate_fails() {
        let (coordinator, store, objects) = coordinator().await;
        let scene_id = seeded_scene(&store, &objects, coordinator.base_config()).await;

        // Tighten the RMSE ceiling below the engine's reported 0.05.
        let mut overrides = BTreeMap::new();
        overrides.insert("rmse_max".to_string(), json!(0.01));

        let outcome = coordinator
            .run(
                scene_id,
                &[StageKind::Registration, StageKind::Segmentation],
                Some(&overrides),
            )
            .await
            .unwrap();

        assert!((outcome.metrics["registration_pass"]).abs() < f64::EPSILON);
        assert!((outcome.metrics["segmentation_pass"] - 1.0).abs() < f64::EPSILON);
        assert!((outcome.metrics["overall_pass"]).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_override_scoping_survives_stage_errors() {
        let (coordinator, store, _) = coordinator().await;
        // Scene exists but has no artifacts: segmentation will fail after
        // overrides were applied.
        let scene = store
            .create_scene("/tmp/scan.laz", "EPSG:3857", json!({}))
            .await
            .unwrap();

        let mut overrides = BTreeMap::new();
        overrides.insert("miou_min".to_string(), json!(0.99));

        let err = coordinator
            .run(scene.id, &[StageKind::Segmentation], Some(&overrides))
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        // The base config was never mutated.
        assert!(
            (coordinator.base_config().thresholds.miou_min - 0.70).abs() < f64::EPSILON
        );
    }

    #[tokio::test]
    async fn test_unknown_override_key_rejected_before_execution() {
        let (coordinator, store, objects) = coordinator().await;
        let scene_id = seeded_scene(&store, &objects, coordinator.base_config()).await;

        let mut overrides = BTreeMap::new();
        overrides.insert("definitely_not_a_key".to_string(), json!(1));

        let err = coordinator
            .run(scene_id, &[StageKind::Registration], Some(&overrides))
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        // No stage ran: no metrics were recorded.
        assert!(store.metrics_for_scene(scene_id).await.unwrap().is_empty());
    }

    struct FailingClassifier;

    impl crate::engines::ClassifierEngine for FailingClassifier {
        fn classify(
            &self,
            _request: &crate::engines::ClassifyRequest,
        ) -> Result<crate::engines::Classification, crate::error::EngineError> {
            Err(crate::error::EngineError::Classification(
                "model crashed".to_string(),
            ))
        }
    }

    #[tokio::test]
    async fn test_stage_failure_aborts_rest_but_keeps_committed_outputs() {
        let store = Arc::new(MemoryStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let coordinator = PipelineRunCoordinator::new(
            store.clone(),
            objects.clone(),
            Arc::new(NoopTracker::new()),
            Arc::new(LocalOrchestrator::new(1)),
            Arc::new(LocalRegistrationEngine::new()),
            Arc::new(FailingClassifier),
            Arc::new(LocalChangeEngine::new()),
            AppConfig::default(),
        );
        let scene_id = seeded_scene(&store, &objects, coordinator.base_config()).await;

        let err = coordinator
            .run(
                scene_id,
                &[
                    StageKind::Registration,
                    StageKind::Segmentation,
                    StageKind::ChangeDetection,
                ],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Engine(_)));

        // Registration's outputs stay committed; change detection never ran.
        let artifacts = store.artifacts_for_scene(scene_id).await.unwrap();
        let kinds: Vec<&str> = artifacts.iter().map(|a| a.kind.as_str()).collect();
        assert!(kinds.contains(&artifact_kinds::ALIGNED));
        assert!(kinds.contains(&artifact_kinds::RESIDUALS));
        assert!(!kinds.contains(&artifact_kinds::CHANGE_MASK));

        // No overall gate or audit entry for the aborted run.
        let latest = store.latest_metrics(scene_id).await.unwrap();
        assert!(!latest.contains_key("overall_pass"));
        assert!(store.audits_for_scene(scene_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_writes_audit_entry() {
        let (coordinator, store, objects) = coordinator().await;
        let scene_id = seeded_scene(&store, &objects, coordinator.base_config()).await;

        coordinator
            .run(scene_id, &[StageKind::Registration], None)
            .await
            .unwrap();

        let audits = store.audits_for_scene(scene_id).await.unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, "pipeline_run");
        assert_eq!(audits[0].details["steps"][0], "registration");
        assert_eq!(audits[0].details["metrics"]["overall_pass"], 1.0);
    }

    #[tokio::test]
    async fn test_orchestrator_descriptor_always_present() {
        let (coordinator, store, objects) = coordinator().await;
        let scene_id = seeded_scene(&store, &objects, coordinator.base_config()).await;

        let outcome = coordinator
            .run(scene_id, &[StageKind::Registration], None)
            .await
            .unwrap();

        assert_eq!(outcome.orchestrator.engine, "local");
        assert_eq!(outcome.orchestrator.plan, vec![StageKind::Registration]);
        assert!(outcome.orchestrator.cancellable);
        assert!(outcome.orchestrator.resumable);
        assert_eq!(outcome.orchestrator.lineage.nodes.len(), 1);
    }
}
