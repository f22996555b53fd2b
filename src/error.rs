//! Error types for pointforge operations.
//!
//! Defines error types for the major subsystems:
//! - Scene/artifact/metric persistence
//! - Object storage (blob put/get/presign)
//! - Stage engines (registration, classification, voxel diff)
//! - Configuration and per-run overrides
//! - Orchestrator run lifecycle
//!
//! `PipelineError` aggregates them at the run coordinator and carries the
//! client-vs-server classification callers need to map failures onto a
//! transport status.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during scene store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Convenience constructor for the common scene-missing case.
    pub fn scene_not_found(id: Uuid) -> Self {
        StoreError::NotFound { entity: "scene", id }
    }
}

/// Errors that can occur during object storage operations.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// Transient failure; eligible for bounded-backoff retry.
    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("Object '{bucket}/{key}' not found")]
    NotFound { bucket: String, key: String },

    #[error("Invalid object URI '{0}'")]
    InvalidUri(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by stage engines.
///
/// Engine failures are never masked with placeholder output: a synthetic
/// RMSE is not a measurement, and a gate computed from one is meaningless.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Registration engine failed: {0}")]
    Registration(String),

    #[error("Classification engine failed: {0}")]
    Classification(String),

    #[error("Voxel-diff engine failed: {0}")]
    VoxelDiff(String),

    #[error("Accelerated runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown override key '{0}'")]
    UnknownOverride(String),

    #[error("Invalid override for {key}: {message}")]
    InvalidOverride { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in the orchestrator run registry.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Run '{0}' not known to this orchestrator")]
    UnknownRun(Uuid),

    #[error("Invalid run transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("Cluster request failed: {0}")]
    ClusterUnavailable(String),
}

/// Errors surfaced by pipeline runs and ingest.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Requested scene does not exist (404-class).
    #[error("Scene '{0}' not found")]
    SceneNotFound(Uuid),

    /// Requested artifact does not exist (404-class).
    #[error("Artifact '{0}' not found")]
    ArtifactNotFound(Uuid),

    /// A requested stage has no usable input artifact (400-class).
    #[error("No {wanted} artifact found for {stage}")]
    MissingPrerequisite {
        stage: &'static str,
        wanted: &'static str,
    },

    /// Spatial reference rejected at intake (400-class).
    #[error("Unsupported spatial reference '{0}'")]
    UnsupportedCrs(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

impl PipelineError {
    /// True when the failure is attributable to the caller's request rather
    /// than the system (maps to the 4xx family on an HTTP surface).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::SceneNotFound(_)
                | PipelineError::ArtifactNotFound(_)
                | PipelineError::MissingPrerequisite { .. }
                | PipelineError::UnsupportedCrs(_)
                | PipelineError::Store(StoreError::NotFound { .. })
                | PipelineError::Config(ConfigError::UnknownOverride(_))
                | PipelineError::Config(ConfigError::InvalidOverride { .. })
        )
    }
}
