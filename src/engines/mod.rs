//! Stage engine contracts.
//!
//! The numeric algorithms behind registration, point classification and
//! voxel-diff change detection are opaque to the pipeline: each is consumed
//! through a trait with a defined input/output shape, and the local
//! implementations here are deterministic under a fixed seed so exact
//! outputs are reproducible in tests when no real model backs them.

pub mod change;
pub mod registration;
pub mod segmentation;

pub use change::{ChangeCounts, ChangeDiff, DiffRequest, LocalChangeEngine, VoxelDiffEngine};
pub use registration::{LocalRegistrationEngine, RegisterRequest, RegistrationEngine, RegistrationOutput};
pub use segmentation::{
    AcceleratedClassifier, Classification, ClassifierEngine, ClassifyRequest, CpuClassifier,
    PointLabel,
};
