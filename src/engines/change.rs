//! Voxel-diff change-detection engine contract.

use std::collections::BTreeMap;

use crate::error::EngineError;

/// Added/removed/moved point counts for one class (or the whole mask).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChangeCounts {
    pub added: u64,
    pub removed: u64,
    pub moved: u64,
}

impl ChangeCounts {
    pub fn total(&self) -> u64 {
        self.added + self.removed + self.moved
    }

    fn scaled(&self, factor: f64) -> ChangeCounts {
        ChangeCounts {
            added: (self.added as f64 * factor) as u64,
            removed: (self.removed as f64 * factor) as u64,
            moved: (self.moved as f64 * factor) as u64,
        }
    }
}

/// Diff request.
#[derive(Debug, Clone)]
pub struct DiffRequest {
    /// Voxel edge length in meters.
    pub voxel_size_m: f64,
    /// Use the learned detector instead of the plain voxel diff.
    pub learned: bool,
    /// Pose drift fed to the learned detector.
    pub pose_drift: f64,
}

/// Diff result.
pub struct ChangeDiff {
    /// Whole-mask counts.
    pub mask: ChangeCounts,
    /// Per-class breakdown of the mask.
    pub per_class: BTreeMap<String, ChangeCounts>,
    /// Engine-reported detection precision, when measured.
    pub precision: Option<f64>,
    /// Engine-reported detection recall, when measured.
    pub recall: Option<f64>,
}

/// Opaque voxel-diff engine.
pub trait VoxelDiffEngine: Send + Sync {
    fn diff(
        &self,
        baseline: &[u8],
        current: &[u8],
        request: &DiffRequest,
    ) -> Result<ChangeDiff, EngineError>;
}

const PLAIN_MASK: ChangeCounts = ChangeCounts {
    added: 42,
    removed: 17,
    moved: 5,
};

const LEARNED_BASE: ChangeCounts = ChangeCounts {
    added: 30,
    removed: 12,
    moved: 7,
};

const CLASS_LABELS: [&str; 3] = ["ground", "structure", "vegetation"];

const LOCAL_PRECISION: f64 = 0.80;
const LOCAL_RECALL: f64 = 0.75;

/// Deterministic in-process voxel diff.
///
/// The learned mode scales a fixed base distribution by `1 + pose_drift`
/// (drift clamped at zero); the plain mode reports a fixed mask.
#[derive(Default)]
pub struct LocalChangeEngine;

impl LocalChangeEngine {
    pub fn new() -> Self {
        Self
    }
}

impl VoxelDiffEngine for LocalChangeEngine {
    fn diff(
        &self,
        _baseline: &[u8],
        _current: &[u8],
        request: &DiffRequest,
    ) -> Result<ChangeDiff, EngineError> {
        if request.voxel_size_m <= 0.0 {
            return Err(EngineError::VoxelDiff(format!(
                "voxel size must be positive, got {}",
                request.voxel_size_m
            )));
        }

        let mask = if request.learned {
            let factor = 1.0 + request.pose_drift.max(0.0);
            LEARNED_BASE.scaled(factor)
        } else {
            PLAIN_MASK
        };

        Ok(ChangeDiff {
            per_class: split_per_class(mask),
            mask,
            precision: Some(LOCAL_PRECISION),
            recall: Some(LOCAL_RECALL),
        })
    }
}

/// Distributes mask counts over the class labels; integer division with the
/// remainder assigned to the first class.
fn split_per_class(mask: ChangeCounts) -> BTreeMap<String, ChangeCounts> {
    let n = CLASS_LABELS.len() as u64;
    let mut out = BTreeMap::new();
    for (i, label) in CLASS_LABELS.iter().enumerate() {
        let extra = |total: u64| if i == 0 { total % n } else { 0 };
        out.insert(
            label.to_string(),
            ChangeCounts {
                added: mask.added / n + extra(mask.added),
                removed: mask.removed / n + extra(mask.removed),
                moved: mask.moved / n + extra(mask.moved),
            },
        );
    }
    out
}
