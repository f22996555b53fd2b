//! Pluggable run planners.
//!
//! An orchestrator backend produces an execution plan and a lineage record
//! for a pipeline run. It is purely advisory: the coordinator executes
//! stages itself, and cancel/resume only update the advisory run registry —
//! no in-flight synchronous stage is interrupted.
//!
//! The backend variant is chosen once at startup from configuration and
//! injected as a trait object; swapping variants does not change the
//! coordinator's behavior, only the richness of the lineage payload.

pub mod cluster;
pub mod dag;
pub mod local;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{AppConfig, OrchestratorKind};
use crate::error::OrchestratorError;
use crate::pipeline::StageKind;

pub use cluster::ClusterOrchestrator;
pub use dag::DagOrchestrator;
pub use local::LocalOrchestrator;

/// Advisory lifecycle of a planned run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Planned,
    Running,
    Resumed,
    Completed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Planned => "planned",
            RunState::Running => "running",
            RunState::Resumed => "resumed",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
        }
    }
}

/// One lineage node per requested stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageNode {
    pub id: String,
    pub kind: String,
    pub status: String,
}

/// Sequential dependency between two stages, in request order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEdge {
    pub from: String,
    pub to: String,
}

/// Plan/status record reported for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lineage {
    pub scene_id: Uuid,
    pub nodes: Vec<LineageNode>,
    pub edges: Vec<LineageEdge>,
}

/// Advisory run description returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub run_id: Uuid,
    pub engine: String,
    pub plan: Vec<StageKind>,
    pub lineage: Lineage,
    pub cancellable: bool,
    pub resumable: bool,
    pub retry_budget: u32,
}

/// Planner capability interface.
#[async_trait]
pub trait OrchestratorBackend: Send + Sync {
    /// Echoes the requested stages. Schedulers may reorder but must never
    /// drop or add stages.
    fn plan(&self, stages: &[StageKind]) -> Vec<StageKind>;

    /// Produces the advisory plan + lineage for a run. Executes nothing.
    async fn describe_run(
        &self,
        scene_id: Uuid,
        stages: &[StageKind],
    ) -> Result<RunDescriptor, OrchestratorError>;

    /// Cancels a run. Idempotent: a terminal run keeps its state.
    async fn cancel(&self, run_id: Uuid) -> Result<RunState, OrchestratorError>;

    /// Resumes a running run.
    async fn resume(&self, run_id: Uuid) -> Result<RunState, OrchestratorError>;

    /// Marks a run completed.
    async fn complete(&self, run_id: Uuid) -> Result<RunState, OrchestratorError>;
}

/// Shared advisory state machine:
/// `Planned → Running → {Completed, Cancelled}`, `Running → Resumed → Completed`.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<Uuid, RunState>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly planned run and transitions it to running.
    pub fn register(&self) -> Uuid {
        let run_id = Uuid::new_v4();
        self.runs
            .lock()
            .expect("run registry poisoned")
            .insert(run_id, RunState::Running);
        run_id
    }

    pub fn status(&self, run_id: Uuid) -> Result<RunState, OrchestratorError> {
        self.runs
            .lock()
            .expect("run registry poisoned")
            .get(&run_id)
            .copied()
            .ok_or(OrchestratorError::UnknownRun(run_id))
    }

    /// Idempotent cancel: terminal runs keep their state.
    pub fn cancel(&self, run_id: Uuid) -> Result<RunState, OrchestratorError> {
        let mut runs = self.runs.lock().expect("run registry poisoned");
        let state = runs
            .get_mut(&run_id)
            .ok_or(OrchestratorError::UnknownRun(run_id))?;
        if !state.is_terminal() {
            *state = RunState::Cancelled;
        }
        Ok(*state)
    }

    pub fn resume(&self, run_id: Uuid) -> Result<RunState, OrchestratorError> {
        let mut runs = self.runs.lock().expect("run registry poisoned");
        let state = runs
            .get_mut(&run_id)
            .ok_or(OrchestratorError::UnknownRun(run_id))?;
        match *state {
            RunState::Running | RunState::Resumed => {
                *state = RunState::Resumed;
                Ok(*state)
            }
            other => Err(OrchestratorError::InvalidTransition {
                from: other.as_str().to_string(),
                to: RunState::Resumed.as_str().to_string(),
            }),
        }
    }

    pub fn complete(&self, run_id: Uuid) -> Result<RunState, OrchestratorError> {
        let mut runs = self.runs.lock().expect("run registry poisoned");
        let state = runs
            .get_mut(&run_id)
            .ok_or(OrchestratorError::UnknownRun(run_id))?;
        match *state {
            RunState::Running | RunState::Resumed => {
                *state = RunState::Completed;
                Ok(*state)
            }
            other => Err(OrchestratorError::InvalidTransition {
                from: other.as_str().to_string(),
                to: RunState::Completed.as_str().to_string(),
            }),
        }
    }
}

/// Builds a flat lineage with one node per stage and sequential edges in
/// request order.
pub(crate) fn sequential_lineage(
    scene_id: Uuid,
    stages: &[StageKind],
    node_status: &str,
) -> Lineage {
    let nodes = stages
        .iter()
        .map(|s| LineageNode {
            id: s.as_str().to_string(),
            kind: s.as_str().to_string(),
            status: node_status.to_string(),
        })
        .collect();
    let edges = stages
        .windows(2)
        .map(|pair| LineageEdge {
            from: pair[0].as_str().to_string(),
            to: pair[1].as_str().to_string(),
        })
        .collect();
    Lineage {
        scene_id,
        nodes,
        edges,
    }
}

/// Constructs the backend variant selected by configuration. Called once at
/// startup; the result is injected wherever planning is needed.
pub async fn backend_from_config(config: &AppConfig) -> std::sync::Arc<dyn OrchestratorBackend> {
    match config.orchestrator {
        OrchestratorKind::Local => std::sync::Arc::new(LocalOrchestrator::new(
            config.orchestrator_max_retries,
        )),
        OrchestratorKind::Cluster => std::sync::Arc::new(
            ClusterOrchestrator::connect(
                config.orchestrator_endpoint.clone(),
                config.orchestrator_max_retries,
            )
            .await,
        ),
        OrchestratorKind::Dag => std::sync::Arc::new(DagOrchestrator::new(
            config.orchestrator_max_retries,
        )),
    }
}
