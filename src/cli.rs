//! Command-line interface.
//!
//! Builds the configured collaborators once (store, object store, tracker,
//! orchestrator backend) and wires them into the coordinator, then
//! dispatches one command per invocation.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engines::{CpuClassifier, LocalChangeEngine, LocalRegistrationEngine};
use crate::ingest::{self, IngestRequest};
use crate::inspect::{self, RunFilter};
use crate::objectstore::FsObjectStore;
use crate::orchestrator;
use crate::pipeline::{ArtifactUrlCache, PipelineRunCoordinator, StageKind};
use crate::storage::PostgresStore;
use crate::tracker::{ExperimentTracker, HttpTracker, NoopTracker};

/// Point-cloud scene pipeline with quality gates.
#[derive(Debug, Parser)]
#[command(name = "pointforge", version, about)]
pub struct Cli {
    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest a point cloud as a new scene.
    Ingest {
        /// Source file or upload URI.
        source_uri: String,
        /// Spatial reference code, e.g. EPSG:3857.
        #[arg(long)]
        crs: String,
        /// Sensor metadata as a JSON object.
        #[arg(long, default_value = "{}")]
        sensor_meta: String,
    },
    /// Run pipeline stages for a scene.
    Run {
        scene_id: Uuid,
        /// Stages to run, in any order; execution is canonical.
        #[arg(long = "step", required = true)]
        steps: Vec<String>,
        /// Per-run config overrides as key=value pairs.
        #[arg(long = "override")]
        overrides: Vec<String>,
    },
    /// Show a scene with its artifacts, metrics and audit trail.
    Scene { scene_id: Uuid },
    /// Delete a scene, cascading to children and backing blobs.
    DeleteScene { scene_id: Uuid },
    /// Evaluate quality gates against a scene's latest metrics.
    Gates { scene_id: Uuid },
    /// List scenes with recorded gate outcomes.
    Runs {
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long)]
        only_failed: bool,
        #[arg(long)]
        only_passed: bool,
    },
    /// Resolve a presigned access URL for an artifact.
    Artifact {
        artifact_id: Uuid,
        /// Invalidate the cached URL and sign a fresh one.
        #[arg(long)]
        refresh: bool,
    },
    /// Sweep artifacts, metrics and audit rows past the retention window.
    Cleanup,
    /// Dump Prometheus metrics in text format.
    Metrics,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    crate::observability::init_metrics().context("metrics initialization failed")?;

    let config = AppConfig::from_env().context("configuration failed")?;

    let store = Arc::new(
        PostgresStore::connect(&config.database_url)
            .await
            .context("database connection failed")?,
    );
    store.run_migrations().await.context("migrations failed")?;

    let objects = Arc::new(FsObjectStore::new(
        config.object_root.clone(),
        config.presign_secret.clone(),
    ));

    let tracker: Arc<dyn ExperimentTracker> = match &config.tracking_url {
        Some(url) => Arc::new(HttpTracker::new(url.clone())),
        None => Arc::new(NoopTracker::new()),
    };

    let backend = orchestrator::backend_from_config(&config).await;

    match cli.command {
        Command::Ingest {
            source_uri,
            crs,
            sensor_meta,
        } => {
            let sensor_meta: serde_json::Value =
                serde_json::from_str(&sensor_meta).context("sensor_meta is not valid JSON")?;
            let outcome = ingest::ingest(
                store.as_ref(),
                objects.as_ref(),
                &config,
                &IngestRequest {
                    source_uri,
                    crs,
                    sensor_meta,
                },
            )
            .await?;
            print_json(&outcome)
        }
        Command::Run {
            scene_id,
            steps,
            overrides,
        } => {
            let steps = parse_steps(&steps)?;
            let overrides = parse_overrides(&overrides)?;
            let coordinator = PipelineRunCoordinator::new(
                store,
                objects,
                tracker,
                backend,
                Arc::new(LocalRegistrationEngine::new()),
                Arc::new(CpuClassifier::new()),
                Arc::new(LocalChangeEngine::new()),
                config,
            );
            let outcome = coordinator
                .run(scene_id, &steps, overrides.as_ref())
                .await?;
            print_json(&outcome)
        }
        Command::Scene { scene_id } => {
            let detail = inspect::scene_detail(store.as_ref(), scene_id).await?;
            print_json(&detail)
        }
        Command::DeleteScene { scene_id } => {
            let counts =
                inspect::delete_scene(store.as_ref(), objects.as_ref(), scene_id).await?;
            print_json(&counts)
        }
        Command::Gates { scene_id } => {
            let summary =
                inspect::gate_summary(store.as_ref(), &config.thresholds, scene_id).await?;
            print_json(&summary)
        }
        Command::Runs {
            limit,
            offset,
            only_failed,
            only_passed,
        } => {
            let items = inspect::list_runs(
                store.as_ref(),
                limit,
                offset,
                RunFilter {
                    only_failed,
                    only_passed,
                },
            )
            .await?;
            print_json(&items)
        }
        Command::Artifact {
            artifact_id,
            refresh,
        } => {
            let cache = ArtifactUrlCache::new(config.url_cache_capacity);
            let access = if refresh {
                inspect::refresh_artifact_url(
                    store.as_ref(),
                    objects.as_ref(),
                    &cache,
                    &config,
                    artifact_id,
                )
                .await?
            } else {
                inspect::artifact_url(
                    store.as_ref(),
                    objects.as_ref(),
                    &cache,
                    &config,
                    artifact_id,
                )
                .await?
            };
            print_json(&access)
        }
        Command::Cleanup => {
            let counts = inspect::cleanup_expired(store.as_ref(), config.retention_days).await?;
            print_json(&counts)
        }
        Command::Metrics => {
            print!("{}", crate::observability::export_metrics());
            Ok(())
        }
    }
}

fn parse_steps(raw: &[String]) -> anyhow::Result<Vec<StageKind>> {
    raw.iter()
        .map(|s| {
            s.parse::<StageKind>()
                .map_err(|e| anyhow::anyhow!("invalid --step: {e}"))
        })
        .collect()
}

/// Parses `key=value` overrides; values keep their JSON type when they
/// parse as JSON, otherwise they are passed through as strings.
fn parse_overrides(
    raw: &[String],
) -> anyhow::Result<Option<BTreeMap<String, serde_json::Value>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut overrides = BTreeMap::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("override '{pair}' is not key=value"))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        overrides.insert(key.to_string(), value);
    }
    Ok(Some(overrides))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
