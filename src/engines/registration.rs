//! Registration engine contract.

use serde_json::json;

use crate::error::EngineError;

/// Input to a registration run.
///
/// When `target_cloud` is absent the source cloud is self-registered
/// (aligned against its own reference frame).
pub struct RegisterRequest<'a> {
    pub source_cloud: &'a [u8],
    pub target_cloud: Option<&'a [u8]>,
    /// Spatial reference code of the scene, forwarded for reporting.
    pub crs: &'a str,
}

/// Output of a registration run.
pub struct RegistrationOutput {
    /// Residual alignment error.
    pub rmse: f64,
    /// Fraction of correspondences within the distance threshold, in [0, 1].
    pub inlier_ratio: f64,
    /// Registered cloud payload.
    pub aligned_cloud: Vec<u8>,
    /// Residuals report payload (JSON).
    pub residuals_report: Vec<u8>,
    /// Free-form spatial-reference text reported by the engine. Callers may
    /// only use this for an approximate reprojection check; it is not a
    /// correctness guarantee.
    pub reported_srs: String,
}

/// Opaque registration engine.
pub trait RegistrationEngine: Send + Sync {
    fn register(&self, request: &RegisterRequest<'_>) -> Result<RegistrationOutput, EngineError>;
}

/// Deterministic in-process registration.
///
/// Applies an identity transform (the aligned cloud is the source cloud) and
/// reports fixed quality figures, standing in for an FGR+ICP pipeline.
#[derive(Default)]
pub struct LocalRegistrationEngine;

impl LocalRegistrationEngine {
    pub fn new() -> Self {
        Self
    }
}

const LOCAL_RMSE: f64 = 0.05;
const LOCAL_INLIER_RATIO: f64 = 0.9;

impl RegistrationEngine for LocalRegistrationEngine {
    fn register(&self, request: &RegisterRequest<'_>) -> Result<RegistrationOutput, EngineError> {
        let pair_count = if request.target_cloud.is_some() { 2 } else { 1 };
        let residuals = json!({
            "rmse": LOCAL_RMSE,
            "inlier_ratio": LOCAL_INLIER_RATIO,
            "cloud_count": pair_count,
            "residuals": [],
        });
        let residuals_report = serde_json::to_vec(&residuals)
            .map_err(|e| EngineError::Registration(e.to_string()))?;

        Ok(RegistrationOutput {
            rmse: LOCAL_RMSE,
            inlier_ratio: LOCAL_INLIER_RATIO,
            aligned_cloud: request.source_cloud.to_vec(),
            residuals_report,
            reported_srs: format!("aligned srs={}", request.crs),
        })
    }
}
