//! The `topoflow_core` crate finds, classifies and tracks the critical points
//! of 2D vector fields sampled on rectangular grids.
//!
//! Key components:
//! - **Field**: `VectorField` (validated grid data, masks, wall mirroring).
//! - **Index**: Poincaré–Bendixson cell scan and window index.
//! - **Bilinear**: closed-form zero of the bilinear interpolant inside a cell.
//! - **Classify**: local Jacobian, eigen-decomposition, point type and saddle directions.
//! - **Points**: per-frame point records and the time-ordered collection.
//! - **Simplify**: merging of close points whose indices combine or cancel.
//! - **Trajectory**: greedy epsilon-bounded linking of points across frames, and smoothing.
//! - **Detection**: the per-frame pipeline and parallel batch over a sequence.
pub mod bilinear;
pub mod classify;
pub mod detection;
pub mod error;
pub mod field;
pub mod index;
pub mod points;
pub mod simplify;
pub mod trajectory;

pub use detection::{
    detect_frame, detect_sequence, DetectionMethod, DetectionSettings, FrameFailure,
    SequenceDetection,
};
pub use error::{Result, TopologyError};
pub use field::{MirrorAxis, MirrorPlane, VectorField};
pub use points::{Confidence, CpKind, CriticalPoint, CriticalPointCollection, FramePoints};
pub use simplify::{simplify_frame, SimplifyMode};
pub use trajectory::{
    link_points, PointFrame, Smoothing, Trajectory, TrajectorySample, TrajectorySet,
};
