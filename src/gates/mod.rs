//! Quality-gate thresholds and pass/fail evaluation.
//!
//! Gates compare stage metrics against configurable thresholds. Evaluation
//! is pure: identical `(thresholds, metrics)` always yields the same
//! boolean, with no side effects. Gate outcomes are persisted as
//! 0.0/1.0-valued metrics so they live in the same time series as
//! everything else.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pipeline::StageKind;

/// Default ceiling on registration RMSE.
pub const DEFAULT_RMSE_MAX: f64 = 0.10;
/// Default floor on segmentation mIoU.
pub const DEFAULT_MIOU_MIN: f64 = 0.70;
/// Default floor on change-detection F1.
pub const DEFAULT_CHANGE_F1_MIN: f64 = 0.70;

/// Fixed floor on the registration inlier ratio. Not configurable.
pub const INLIER_RATIO_FLOOR: f64 = 0.70;

/// Configurable gate thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub rmse_max: f64,
    pub miou_min: f64,
    pub change_f1_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            rmse_max: DEFAULT_RMSE_MAX,
            miou_min: DEFAULT_MIOU_MIN,
            change_f1_min: DEFAULT_CHANGE_F1_MIN,
        }
    }
}

impl Thresholds {
    /// Loads thresholds from a YAML file.
    ///
    /// Never fails the caller: a missing file, malformed YAML, or a
    /// non-numeric value falls back per-key to the defaults.
    pub fn load(path: &Path) -> Thresholds {
        let mut out = Thresholds::default();
        let Ok(text) = std::fs::read_to_string(path) else {
            return out;
        };
        let Ok(doc) = serde_yaml::from_str::<BTreeMap<String, serde_yaml::Value>>(&text) else {
            tracing::warn!(path = %path.display(), "Malformed thresholds file, using defaults");
            return out;
        };
        for (key, value) in doc {
            let Some(v) = value.as_f64() else { continue };
            match key.as_str() {
                "rmse_max" => out.rmse_max = v,
                "miou_min" => out.miou_min = v,
                "change_f1_min" => out.change_f1_min = v,
                _ => {}
            }
        }
        out
    }

    /// Evaluates the pass/fail gate for one stage against its metrics.
    ///
    /// A missing metric fails the gate: absence of a measurement is never
    /// treated as passing.
    pub fn evaluate(&self, stage: StageKind, metrics: &BTreeMap<String, f64>) -> bool {
        match stage {
            StageKind::Registration => {
                let rmse = metrics.get("rmse");
                let inlier = metrics.get("inlier_ratio");
                match (rmse, inlier) {
                    (Some(rmse), Some(inlier)) => {
                        *rmse <= self.rmse_max && *inlier >= INLIER_RATIO_FLOOR
                    }
                    _ => false,
                }
            }
            StageKind::Segmentation => metrics
                .get("miou")
                .is_some_and(|miou| *miou >= self.miou_min),
            StageKind::ChangeDetection => metrics
                .get("change_f1")
                .is_some_and(|f1| *f1 >= self.change_f1_min),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_registration_gate() {
        let thr = Thresholds::default();
        assert!(thr.evaluate(
            StageKind::Registration,
            &metrics(&[("rmse", 0.05), ("inlier_ratio", 0.9)])
        ));
        // RMSE over the ceiling fails.
        assert!(!thr.evaluate(
            StageKind::Registration,
            &metrics(&[("rmse", 0.11), ("inlier_ratio", 0.9)])
        ));
        // Inlier floor is fixed at 0.70 regardless of thresholds.
        assert!(!thr.evaluate(
            StageKind::Registration,
            &metrics(&[("rmse", 0.05), ("inlier_ratio", 0.69)])
        ));
        // Missing inlier ratio fails.
        assert!(!thr.evaluate(StageKind::Registration, &metrics(&[("rmse", 0.05)])));
    }

    #[test]
    fn test_segmentation_and_change_gates() {
        let thr = Thresholds::default();
        assert!(thr.evaluate(StageKind::Segmentation, &metrics(&[("miou", 0.75)])));
        assert!(!thr.evaluate(StageKind::Segmentation, &metrics(&[("miou", 0.6)])));
        assert!(thr.evaluate(StageKind::ChangeDetection, &metrics(&[("change_f1", 0.7)])));
        assert!(!thr.evaluate(StageKind::ChangeDetection, &metrics(&[])));
    }

    #[test]
    fn test_evaluate_is_pure() {
        let thr = Thresholds::default();
        let m = metrics(&[("rmse", 0.1), ("inlier_ratio", 0.7)]);
        let first = thr.evaluate(StageKind::Registration, &m);
        for _ in 0..100 {
            assert_eq!(thr.evaluate(StageKind::Registration, &m), first);
        }
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let thr = Thresholds::load(Path::new("/nonexistent/thresholds.yaml"));
        assert_eq!(thr, Thresholds::default());
    }

    #[test]
    fn test_load_partial_file_falls_back_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thresholds.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "rmse_max: 0.2").unwrap();
        writeln!(f, "miou_min: not-a-number").unwrap();

        let thr = Thresholds::load(&path);
        assert!((thr.rmse_max - 0.2).abs() < f64::EPSILON);
        assert!((thr.miou_min - DEFAULT_MIOU_MIN).abs() < f64::EPSILON);
        assert!((thr.change_f1_min - DEFAULT_CHANGE_F1_MIN).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thresholds.yaml");
        std::fs::write(&path, "[[[ not yaml").unwrap();
        assert_eq!(Thresholds::load(&path), Thresholds::default());
    }
}
