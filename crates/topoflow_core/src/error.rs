//! Errors raised by critical point detection and tracking.
//!
//! Only fatal conditions are represented here: malformed input grids,
//! invalid configuration, and misuse of a point collection. Degenerate
//! geometry inside a cell (zero velocity corners, singular root formulas,
//! masked stencils) is recovered locally and never surfaces as an error.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TopologyError {
    /// An axis has fewer than two samples.
    #[error("axis {axis} needs at least 2 samples, got {len}")]
    AxisTooShort { axis: char, len: usize },

    /// An axis is not strictly increasing or holds a non-finite value.
    #[error("axis {axis} must be finite and strictly increasing (index {index})")]
    NonMonotonicAxis { axis: char, index: usize },

    /// A component or mask array does not match the axis lengths.
    #[error("{name} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// A sub-window does not describe at least one valid cell.
    #[error("invalid window: {0}")]
    InvalidWindow(String),

    /// A parameter is outside its accepted range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A critical point type tag is not one of the known tags.
    #[error("unknown critical point type: {0}")]
    UnknownKind(String),

    /// A frame with this time is already stored in the collection.
    #[error("a frame already exists at time {0}")]
    DuplicateTime(f64),

    /// No frame with this time (or index) is stored in the collection.
    #[error("no frame at {0}")]
    MissingFrame(String),

    /// Trajectories were requested before being computed, or are stale.
    #[error("trajectories must be computed before {0}")]
    TrajectoriesNotComputed(&'static str),
}
