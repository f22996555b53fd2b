//! Point-classification engine contract.
//!
//! Two implementations share the same output shape: a CPU fallback and an
//! accelerated path that requires a model file and a runtime library. Both
//! draw logits from a seeded generator, so outputs are bit-exact across runs
//! for a given `(seed, point_count, class_count)`.

use std::path::PathBuf;

use ndarray::Array2;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::EngineError;

/// Environment variable pointing at the accelerated runtime library.
pub const ACCEL_RUNTIME_ENV: &str = "POINTFORGE_ACCEL_RUNTIME";
/// Environment variable flagging GPU availability for the accelerated path.
pub const ACCEL_GPU_ENV: &str = "POINTFORGE_ACCEL_GPU";

/// Points sampled by the CPU fallback.
pub const CPU_POINT_COUNT: usize = 1000;
/// Points sampled by the accelerated path.
pub const ACCEL_POINT_COUNT: usize = 2000;

/// Classification request.
#[derive(Debug, Clone)]
pub struct ClassifyRequest {
    pub point_count: usize,
    pub class_count: usize,
    /// Batch size hint for batched inference.
    pub batch_size: usize,
    pub seed: u64,
}

/// Per-point prediction.
#[derive(Debug, Clone, Copy)]
pub struct PointLabel {
    pub class_id: usize,
    /// Top-class probability, in [0, 1].
    pub confidence: f64,
}

/// Classification result.
#[derive(Debug)]
pub struct Classification {
    pub labels: Vec<PointLabel>,
    /// Engine-reported segmentation quality.
    pub miou: f64,
    pub used_accelerated: bool,
    pub used_gpu: bool,
}

/// Opaque point classifier.
pub trait ClassifierEngine: Send + Sync {
    fn classify(&self, request: &ClassifyRequest) -> Result<Classification, EngineError>;
}

const LOCAL_MIOU: f64 = 0.75;

/// Draws per-point softmax predictions from seeded standard-normal logits.
fn predict(request: &ClassifyRequest) -> Result<Vec<PointLabel>, EngineError> {
    if request.class_count < 2 {
        return Err(EngineError::Classification(format!(
            "class_count must be at least 2, got {}",
            request.class_count
        )));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(request.seed);
    let mut logits = Array2::<f64>::zeros((request.point_count, request.class_count));
    for value in logits.iter_mut() {
        *value = rng.sample(StandardNormal);
    }

    let labels = logits
        .rows()
        .into_iter()
        .map(|row| {
            // Stable softmax over the row.
            let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let exp: Vec<f64> = row.iter().map(|v| (v - max).exp()).collect();
            let sum: f64 = exp.iter().sum();
            let (class_id, top) = exp
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .expect("class_count >= 2");
            PointLabel {
                class_id,
                confidence: top / sum,
            }
        })
        .collect();
    Ok(labels)
}

/// CPU fallback classifier.
#[derive(Default)]
pub struct CpuClassifier;

impl CpuClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl ClassifierEngine for CpuClassifier {
    fn classify(&self, request: &ClassifyRequest) -> Result<Classification, EngineError> {
        let labels = predict(request)?;
        Ok(Classification {
            labels,
            miou: LOCAL_MIOU,
            used_accelerated: false,
            used_gpu: false,
        })
    }
}

/// Accelerated classifier bound to a model file.
///
/// Inference runs in `batch_size` chunks, each seeded from the base seed
/// and its offset; outputs are bit-exact for a fixed `(seed, batch_size)`.
pub struct AcceleratedClassifier {
    model_path: PathBuf,
}

impl AcceleratedClassifier {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
        }
    }

    /// Whether the accelerated runtime library is present on this host.
    pub fn runtime_available() -> bool {
        std::env::var(ACCEL_RUNTIME_ENV)
            .map(|path| std::path::Path::new(&path).exists())
            .unwrap_or(false)
    }

    fn gpu_available() -> bool {
        std::env::var(ACCEL_GPU_ENV)
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}

impl ClassifierEngine for AcceleratedClassifier {
    fn classify(&self, request: &ClassifyRequest) -> Result<Classification, EngineError> {
        if !Self::runtime_available() {
            return Err(EngineError::RuntimeUnavailable(format!(
                "{ACCEL_RUNTIME_ENV} not set or missing"
            )));
        }
        if !self.model_path.exists() {
            return Err(EngineError::Classification(format!(
                "model weights not found at {}",
                self.model_path.display()
            )));
        }

        let mut labels = Vec::with_capacity(request.point_count);
        let mut offset = 0;
        while offset < request.point_count {
            let batch = request.batch_size.min(request.point_count - offset);
            // Seed per batch so the traversal order is immaterial.
            let batch_request = ClassifyRequest {
                point_count: batch,
                class_count: request.class_count,
                batch_size: request.batch_size,
                seed: request.seed.wrapping_add(offset as u64),
            };
            labels.extend(predict(&batch_request)?);
            offset += batch;
        }

        Ok(Classification {
            labels,
            miou: LOCAL_MIOU,
            used_accelerated: true,
            used_gpu: Self::gpu_available(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(point_count: usize) -> ClassifyRequest {
        ClassifyRequest {
            point_count,
            class_count: 5,
            batch_size: 5000,
            seed: 123,
        }
    }

    #[test]
    fn test_cpu_classifier_is_deterministic() {
        let engine = CpuClassifier::new();
        let a = engine.classify(&request(200)).unwrap();
        let b = engine.classify(&request(200)).unwrap();

        assert_eq!(a.labels.len(), 200);
        for (x, y) in a.labels.iter().zip(&b.labels) {
            assert_eq!(x.class_id, y.class_id);
            assert!((x.confidence - y.confidence).abs() < f64::EPSILON);
        }
        assert!(!a.used_accelerated);
    }

    #[test]
    fn test_confidence_in_unit_interval() {
        let engine = CpuClassifier::new();
        let out = engine.classify(&request(100)).unwrap();
        for label in &out.labels {
            assert!((0.0..=1.0).contains(&label.confidence));
            assert!(label.class_id < 5);
            // The argmax class can never be below uniform probability.
            assert!(label.confidence >= 1.0 / 5.0);
        }
    }

    #[test]
    fn test_class_count_floor() {
        let engine = CpuClassifier::new();
        let bad = ClassifyRequest {
            class_count: 1,
            ..request(10)
        };
        assert!(engine.classify(&bad).is_err());
    }

    #[test]
    fn test_accelerated_requires_runtime() {
        // The runtime env var is not set in the test environment.
        let engine = AcceleratedClassifier::new("/nonexistent/model.bin");
        let err = engine.classify(&request(10)).unwrap_err();
        assert!(matches!(err, EngineError::RuntimeUnavailable(_)));
    }
}
