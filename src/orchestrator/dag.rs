//! Typed-DAG planner with explicit per-node status.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::pipeline::StageKind;

use super::{sequential_lineage, OrchestratorBackend, RunDescriptor, RunRegistry, RunState};

/// Planner that mirrors a DAG execution plan.
///
/// Lineage payload matches the other variants structurally; each node
/// carries its own status field, and the configured retry budget is
/// reported per run.
pub struct DagOrchestrator {
    registry: RunRegistry,
    retry_budget: u32,
}

impl DagOrchestrator {
    pub fn new(retry_budget: u32) -> Self {
        Self {
            registry: RunRegistry::new(),
            retry_budget,
        }
    }
}

#[async_trait]
impl OrchestratorBackend for DagOrchestrator {
    fn plan(&self, stages: &[StageKind]) -> Vec<StageKind> {
        stages.to_vec()
    }

    async fn describe_run(
        &self,
        scene_id: Uuid,
        stages: &[StageKind],
    ) -> Result<RunDescriptor, OrchestratorError> {
        let plan = self.plan(stages);
        let run_id = self.registry.register();
        Ok(RunDescriptor {
            run_id,
            engine: "dag".to_string(),
            lineage: sequential_lineage(scene_id, &plan, "planned"),
            plan,
            cancellable: true,
            resumable: true,
            retry_budget: self.retry_budget,
        })
    }

    async fn cancel(&self, run_id: Uuid) -> Result<RunState, OrchestratorError> {
        self.registry.cancel(run_id)
    }

    async fn resume(&self, run_id: Uuid) -> Result<RunState, OrchestratorError> {
        self.registry.resume(run_id)
    }

    async fn complete(&self, run_id: Uuid) -> Result<RunState, OrchestratorError> {
        self.registry.complete(run_id)
    }
}
