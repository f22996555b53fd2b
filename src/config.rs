//! Application configuration.
//!
//! Configuration is loaded once at startup from environment variables and
//! validated. Per-run overrides never mutate shared state: `with_overrides`
//! clones the base configuration, applies every override or fails
//! all-or-nothing, and the resulting snapshot is threaded explicitly through
//! each stage call. The base config is therefore untouched on every exit
//! path, including mid-run errors.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::error::ConfigError;
use crate::gates::Thresholds;

/// Which orchestrator backend to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorKind {
    /// Synchronous in-process planner.
    Local,
    /// Delegates planning to a cluster runtime, falling back to local
    /// semantics when the runtime is unreachable.
    Cluster,
    /// Typed-DAG planner with explicit per-node status.
    Dag,
}

impl std::str::FromStr for OrchestratorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(OrchestratorKind::Local),
            "cluster" => Ok(OrchestratorKind::Cluster),
            "dag" => Ok(OrchestratorKind::Dag),
            other => Err(ConfigError::InvalidValue {
                key: "orchestrator".to_string(),
                message: format!("unknown backend '{other}'"),
            }),
        }
    }
}

/// Configuration for the pipeline service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Storage settings
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Root directory for the filesystem object store.
    pub object_root: PathBuf,
    /// Bucket for raw uploads.
    pub bucket_raw: String,
    /// Bucket for stage outputs.
    pub bucket_processed: String,

    // Presigned URL settings
    /// Signature lifetime for presigned artifact URLs, in seconds.
    pub presign_expiry_secs: u64,
    /// Secret used to sign presigned URLs.
    pub presign_secret: String,
    /// Maximum number of entries the URL cache may hold.
    pub url_cache_capacity: usize,

    // Gate settings
    /// Path to the thresholds YAML file.
    pub thresholds_path: PathBuf,
    /// Quality-gate thresholds, loaded from `thresholds_path` with per-key
    /// fallback to defaults.
    pub thresholds: Thresholds,

    // Segmentation engine settings
    /// Number of semantic classes the classifier predicts.
    pub seg_num_classes: usize,
    /// Whether to prefer the accelerated classification path.
    pub seg_use_accelerated: bool,
    /// Model weights path for the accelerated path.
    pub seg_model_path: Option<PathBuf>,
    /// Inference batch size for the accelerated path (floor 1000 applied at
    /// selection time).
    pub seg_batch_size: usize,
    /// Seed for the deterministic classifier implementations.
    pub seg_seed: u64,

    // Change-detection engine settings
    /// Voxel edge length for the diff grid, in meters.
    pub change_voxel_size_m: f64,
    /// Whether to use the learned change detector.
    pub change_use_learned: bool,
    /// Default pose drift fed to the learned detector when the caller
    /// supplies none.
    pub change_pose_drift: f64,

    // Orchestrator settings
    /// Backend variant constructed at startup.
    pub orchestrator: OrchestratorKind,
    /// Cluster runtime endpoint (cluster backend only).
    pub orchestrator_endpoint: Option<String>,
    /// Advisory retry budget reported in run descriptors.
    pub orchestrator_max_retries: u32,

    // Tracking settings
    /// Experiment tracker endpoint; `None` disables tracking.
    pub tracking_url: Option<String>,

    // Retention settings
    /// Age past which artifacts/metrics/audit rows are swept.
    pub retention_days: u32,

    // Object store retry settings
    /// Maximum attempts for transient object-store failures.
    pub storage_retry_attempts: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub storage_retry_base_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/pointforge".to_string(),
            object_root: PathBuf::from("./objects"),
            bucket_raw: "pointforge-raw".to_string(),
            bucket_processed: "pointforge-processed".to_string(),

            presign_expiry_secs: 3600,
            presign_secret: "dev-secret".to_string(),
            url_cache_capacity: 1024,

            thresholds_path: PathBuf::from("configs/thresholds.yaml"),
            thresholds: Thresholds::default(),

            seg_num_classes: 5,
            seg_use_accelerated: false,
            seg_model_path: None,
            seg_batch_size: 5000,
            seg_seed: 123,

            change_voxel_size_m: 0.05,
            change_use_learned: false,
            change_pose_drift: 0.0,

            orchestrator: OrchestratorKind::Local,
            orchestrator_endpoint: None,
            orchestrator_max_retries: 1,

            tracking_url: None,

            retention_days: 30,

            storage_retry_attempts: 3,
            storage_retry_base_ms: 100,
        }
    }
}

impl AppConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// All variables use the `POINTFORGE_` prefix; `POINTFORGE_DATABASE_URL`
    /// is required, everything else falls back to defaults. Thresholds are
    /// loaded from `POINTFORGE_THRESHOLDS_PATH` (missing or malformed keys
    /// fall back per-key).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = std::env::var("POINTFORGE_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("POINTFORGE_DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("POINTFORGE_OBJECT_ROOT") {
            config.object_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("POINTFORGE_BUCKET_RAW") {
            config.bucket_raw = val;
        }
        if let Ok(val) = std::env::var("POINTFORGE_BUCKET_PROCESSED") {
            config.bucket_processed = val;
        }
        if let Ok(val) = std::env::var("POINTFORGE_PRESIGN_EXPIRY_SECS") {
            config.presign_expiry_secs = parse_env_value(&val, "POINTFORGE_PRESIGN_EXPIRY_SECS")?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_PRESIGN_SECRET") {
            config.presign_secret = val;
        }
        if let Ok(val) = std::env::var("POINTFORGE_URL_CACHE_CAPACITY") {
            config.url_cache_capacity = parse_env_value(&val, "POINTFORGE_URL_CACHE_CAPACITY")?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_THRESHOLDS_PATH") {
            config.thresholds_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("POINTFORGE_SEG_NUM_CLASSES") {
            config.seg_num_classes = parse_env_value(&val, "POINTFORGE_SEG_NUM_CLASSES")?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_SEG_USE_ACCELERATED") {
            config.seg_use_accelerated = parse_env_bool(&val, "POINTFORGE_SEG_USE_ACCELERATED")?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_SEG_MODEL_PATH") {
            config.seg_model_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("POINTFORGE_SEG_BATCH_SIZE") {
            config.seg_batch_size = parse_env_value(&val, "POINTFORGE_SEG_BATCH_SIZE")?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_SEG_SEED") {
            config.seg_seed = parse_env_value(&val, "POINTFORGE_SEG_SEED")?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_CHANGE_VOXEL_SIZE_M") {
            config.change_voxel_size_m = parse_env_value(&val, "POINTFORGE_CHANGE_VOXEL_SIZE_M")?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_CHANGE_USE_LEARNED") {
            config.change_use_learned = parse_env_bool(&val, "POINTFORGE_CHANGE_USE_LEARNED")?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_CHANGE_POSE_DRIFT") {
            config.change_pose_drift = parse_env_value(&val, "POINTFORGE_CHANGE_POSE_DRIFT")?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_ORCHESTRATOR") {
            config.orchestrator = val.parse()?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_ORCHESTRATOR_ENDPOINT") {
            config.orchestrator_endpoint = Some(val);
        }
        if let Ok(val) = std::env::var("POINTFORGE_ORCHESTRATOR_MAX_RETRIES") {
            config.orchestrator_max_retries =
                parse_env_value(&val, "POINTFORGE_ORCHESTRATOR_MAX_RETRIES")?;
        }
        if let Ok(val) = std::env::var("POINTFORGE_TRACKING_URL") {
            config.tracking_url = Some(val);
        }
        if let Ok(val) = std::env::var("POINTFORGE_RETENTION_DAYS") {
            config.retention_days = parse_env_value(&val, "POINTFORGE_RETENTION_DAYS")?;
        }

        config.thresholds = Thresholds::load(&config.thresholds_path);

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.presign_expiry_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "presign_expiry_secs must be greater than 0".to_string(),
            ));
        }
        if self.url_cache_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "url_cache_capacity must be greater than 0".to_string(),
            ));
        }
        if self.seg_num_classes < 2 {
            return Err(ConfigError::ValidationFailed(
                "seg_num_classes must be at least 2".to_string(),
            ));
        }
        if self.change_voxel_size_m <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "change_voxel_size_m must be positive".to_string(),
            ));
        }
        if self.storage_retry_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "storage_retry_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Produces an immutable per-run snapshot with `overrides` applied.
    ///
    /// Application is all-or-nothing: an unknown key or unparsable value
    /// rejects the whole set and the base configuration is returned to the
    /// caller untouched (it was never mutated to begin with).
    pub fn with_overrides(
        &self,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<AppConfig, ConfigError> {
        let mut snapshot = self.clone();
        for (key, value) in overrides {
            match key.as_str() {
                "rmse_max" => snapshot.thresholds.rmse_max = value_as_f64(key, value)?,
                "miou_min" => snapshot.thresholds.miou_min = value_as_f64(key, value)?,
                "change_f1_min" => snapshot.thresholds.change_f1_min = value_as_f64(key, value)?,
                "seg_num_classes" => snapshot.seg_num_classes = value_as_usize(key, value)?,
                "seg_use_accelerated" => snapshot.seg_use_accelerated = value_as_bool(key, value)?,
                "seg_model_path" => {
                    snapshot.seg_model_path = Some(PathBuf::from(value_as_string(key, value)?))
                }
                "seg_batch_size" => snapshot.seg_batch_size = value_as_usize(key, value)?,
                "seg_seed" => snapshot.seg_seed = value_as_f64(key, value)? as u64,
                "change_voxel_size_m" => {
                    snapshot.change_voxel_size_m = value_as_f64(key, value)?
                }
                "change_use_learned" => snapshot.change_use_learned = value_as_bool(key, value)?,
                "change_pose_drift" => snapshot.change_pose_drift = value_as_f64(key, value)?,
                "orchestrator_max_retries" => {
                    snapshot.orchestrator_max_retries = value_as_usize(key, value)? as u32
                }
                "presign_expiry_secs" => {
                    snapshot.presign_expiry_secs = value_as_usize(key, value)? as u64
                }
                "retention_days" => snapshot.retention_days = value_as_usize(key, value)? as u32,
                other => return Err(ConfigError::UnknownOverride(other.to_string())),
            }
        }
        snapshot.validate()?;
        Ok(snapshot)
    }
}

fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{e}"),
    })
}

fn parse_env_bool(val: &str, key: &str) -> Result<bool, ConfigError> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{other}'"),
        }),
    }
}

fn value_as_f64(key: &str, value: &Value) -> Result<f64, ConfigError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid(key, "not a finite number")),
        Value::String(s) => s.parse().map_err(|_| invalid(key, "not a number")),
        _ => Err(invalid(key, "expected number")),
    }
}

fn value_as_usize(key: &str, value: &Value) -> Result<usize, ConfigError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| invalid(key, "not a non-negative integer")),
        Value::String(s) => s.parse().map_err(|_| invalid(key, "not an integer")),
        _ => Err(invalid(key, "expected integer")),
    }
}

fn value_as_bool(key: &str, value: &Value) -> Result<bool, ConfigError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => parse_env_bool(s, key).map_err(|_| invalid(key, "not a boolean")),
        _ => Err(invalid(key, "expected boolean")),
    }
}

fn value_as_string(key: &str, value: &Value) -> Result<String, ConfigError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        _ => Err(invalid(key, "expected string")),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidOverride {
        key: key.to_string(),
        message: message.to_string(),
    }
}
