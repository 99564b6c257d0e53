//! Per-frame critical point detection and batch processing of sequences.

use crate::bilinear::{solve_cell, CellRoot};
use crate::classify::{classify, local_jacobian, saddle_orientations};
use crate::error::{Result, TopologyError};
use crate::field::{MirrorPlane, VectorField};
use crate::index::{scan_cells, FlaggedCell};
use crate::points::{Confidence, CpKind, CriticalPoint, CriticalPointCollection, FramePoints};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::{debug, info, instrument, warn};

/// How a flagged cell is turned into a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Cell center, scan only.
    Cell,
    /// Zero of the bilinear interpolant.
    Bilinear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Width in samples of the Jacobian neighbourhood, centred on the cell
    /// holding the point. Must be even and at least 2.
    pub window_size: usize,
    pub method: DetectionMethod,
    /// Planes applied in order before scanning.
    pub mirroring: Vec<MirrorPlane>,
    pub parallel: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            window_size: 4,
            method: DetectionMethod::Bilinear,
            mirroring: Vec::new(),
            parallel: true,
        }
    }
}

impl DetectionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.window_size < 2 || self.window_size % 2 != 0 {
            return Err(TopologyError::InvalidConfig(format!(
                "window_size must be an even number of at least 2, got {}",
                self.window_size
            )));
        }
        Ok(())
    }
}

/// Detects and classifies the critical points of one field.
#[instrument(level = "debug", skip(field, settings), fields(shape = ?field.shape()))]
pub fn detect_frame(field: &VectorField, time: f64, settings: &DetectionSettings) -> Result<FramePoints> {
    settings.validate()?;
    let mut working = Cow::Borrowed(field);
    for plane in &settings.mirroring {
        working = Cow::Owned(working.mirror(plane)?);
    }
    let ((x_min, x_max), (y_min, y_max)) = field.extent();

    let scan = scan_cells(&working, settings.parallel);
    let mut frame = FramePoints::new(time);
    let mut outside = 0usize;
    for cell in &scan.flagged {
        let Some(point) = locate_and_classify(&working, cell, settings) else {
            continue;
        };
        if point.x < x_min || point.x > x_max || point.y < y_min || point.y > y_max {
            outside += 1;
            continue;
        }
        frame.push(point);
    }
    debug!(
        time,
        points = frame.len(),
        masked_cells = scan.masked.len(),
        outside,
        "frame detected"
    );
    Ok(frame)
}

fn locate_and_classify(
    field: &VectorField,
    cell: &FlaggedCell,
    settings: &DetectionSettings,
) -> Option<CriticalPoint> {
    let (i, j) = (cell.row, cell.col);
    let (x, y, confidence) = match settings.method {
        DetectionMethod::Cell => {
            let (x, y) = field.cell_center(i, j);
            (x, y, Confidence::CellCenter)
        }
        DetectionMethod::Bilinear => {
            let (dx, dy) = field.cell_extent(i, j);
            let root = solve_cell(&field.cell_corners(i, j), dx, dy);
            let confidence = match root {
                CellRoot::Unique { .. } => Confidence::Exact,
                CellRoot::Averaged { .. } => Confidence::Averaged,
                CellRoot::Fallback { .. } => Confidence::Fallback,
            };
            let (x0, y0) = field.cell_origin(i, j);
            let (rx, ry) = root.position();
            (x0 + rx, y0 + ry, confidence)
        }
    };

    // The flagged cell itself is never masked, so its own stencil is the
    // last resort when the wider neighbourhood is not usable.
    let jacobian = local_jacobian(field, x, y, settings.window_size)
        .or_else(|| local_jacobian(field, x, y, 2));
    let kind = match jacobian {
        Some(jacobian) => classify(&jacobian, cell.index),
        None if cell.index == -1 => CpKind::Saddle,
        None => {
            warn!(row = i, col = j, "no usable gradient, point skipped");
            return None;
        }
    };
    let orientations = (kind == CpKind::Saddle).then(|| saddle_orientations(field, x, y));

    Some(CriticalPoint {
        x,
        y,
        time: 0.0,
        kind,
        orientations,
        confidence,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameFailure {
    pub time: f64,
    pub error: TopologyError,
}

#[derive(Debug, Clone, Default)]
pub struct SequenceDetection {
    pub collection: CriticalPointCollection,
    pub failures: Vec<FrameFailure>,
}

/// Detects every frame of a sequence.
///
/// A failing frame is reported in `failures` and does not stop the others.
/// When the same time appears more than once, the first frame wins and the
/// later ones are reported as [`TopologyError::DuplicateTime`].
#[instrument(level = "info", skip_all, fields(frames = frames.len()))]
pub fn detect_sequence(frames: &[(f64, VectorField)], settings: &DetectionSettings) -> SequenceDetection {
    let detect = |(time, field): &(f64, VectorField)| (*time, detect_frame(field, *time, settings));
    let results: Vec<(f64, Result<FramePoints>)> = if settings.parallel {
        frames.par_iter().map(detect).collect()
    } else {
        frames.iter().map(detect).collect()
    };

    let mut detection = SequenceDetection::default();
    for (time, result) in results {
        match result.and_then(|frame| detection.collection.add_frame(frame)) {
            Ok(()) => {}
            Err(error) => {
                warn!(time, %error, "frame failed");
                detection.failures.push(FrameFailure { time, error });
            }
        }
    }
    info!(
        detected = detection.collection.len(),
        failed = detection.failures.len(),
        points = detection.collection.point_count(),
        "sequence detected"
    );
    detection
}

#[cfg(test)]
mod tests {
    use super::{detect_frame, detect_sequence, DetectionMethod, DetectionSettings};
    use crate::error::TopologyError;
    use crate::field::{MirrorAxis, MirrorPlane, VectorField};
    use crate::index::scan_cells;
    use crate::points::{Confidence, CpKind};

    fn axis(start: f64, step: f64, n: usize) -> Vec<f64> {
        (0..n).map(|k| start + step * k as f64).collect()
    }

    fn vortex_at(cx: f64, cy: f64) -> VectorField {
        let grid = axis(-2.0, 0.4, 11);
        VectorField::from_fn(grid.clone(), grid, move |x, y| {
            (-(y - cy) - 0.1 * (x - cx), (x - cx) - 0.1 * (y - cy))
        })
        .expect("field should build")
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = DetectionSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.window_size, 4);
        assert_eq!(settings.method, DetectionMethod::Bilinear);
        let narrow = DetectionSettings {
            window_size: 1,
            ..DetectionSettings::default()
        };
        assert!(narrow.validate().is_err());
        let odd = DetectionSettings {
            window_size: 5,
            ..DetectionSettings::default()
        };
        let err = odd.validate().expect_err("odd window");
        assert!(err.to_string().contains("even"), "{err}");
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = DetectionSettings {
            window_size: 6,
            method: DetectionMethod::Cell,
            mirroring: vec![MirrorPlane::new(MirrorAxis::Y, 0.0, 3)],
            parallel: false,
        };
        let json = serde_json::to_string(&settings).expect("serialize");
        let back: DetectionSettings = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, settings);

        let partial: DetectionSettings =
            serde_json::from_str(r#"{"method": "cell"}"#).expect("partial config");
        assert_eq!(partial.window_size, 4);
        assert_eq!(partial.method, DetectionMethod::Cell);
    }

    #[test]
    fn stable_focus_is_located_and_classified() {
        let frame = detect_frame(&vortex_at(0.1, -0.3), 1.5, &DetectionSettings::default())
            .expect("detection");
        assert_eq!(frame.len(), 1);
        let point = frame.points()[0];
        assert_eq!(point.kind, CpKind::Focus);
        assert_eq!(point.time, 1.5);
        assert_eq!(point.confidence, Confidence::Exact);
        assert!(point.orientations.is_none());
        assert!((point.x - 0.1).abs() < 1e-9 && (point.y + 0.3).abs() < 1e-9);
    }

    #[test]
    fn cell_method_reports_cell_center() {
        let settings = DetectionSettings {
            method: DetectionMethod::Cell,
            parallel: false,
            ..DetectionSettings::default()
        };
        let frame = detect_frame(&vortex_at(0.1, -0.3), 0.0, &settings).expect("detection");
        let point = frame.points()[0];
        assert_eq!(point.confidence, Confidence::CellCenter);
        assert!((point.x - 0.2).abs() < 1e-9 && (point.y + 0.2).abs() < 1e-9);
    }

    #[test]
    fn wall_saddle_needs_mirroring() {
        // Saddle sitting on the lower wall y = 0.
        let field = VectorField::from_fn(axis(-1.1, 0.2, 12), axis(0.0, 0.2, 8), |x, y| (x, -y))
            .expect("field should build");
        let plain = detect_frame(&field, 0.0, &DetectionSettings::default()).expect("detection");
        assert!(plain.is_empty());

        let settings = DetectionSettings {
            mirroring: vec![MirrorPlane::new(MirrorAxis::Y, 0.0, 2)],
            ..DetectionSettings::default()
        };
        let mirrored = detect_frame(&field, 0.0, &settings).expect("detection");
        assert_eq!(mirrored.len(), 1);
        let point = mirrored.points()[0];
        assert_eq!(point.kind, CpKind::Saddle);
        assert!(point.x.abs() < 1e-9 && point.y.abs() < 1e-9, "{point:?}");
    }

    #[test]
    fn points_in_mirrored_extension_are_dropped() {
        // Reflecting across y = 0 creates a zero near y = -0.075 that only
        // exists in the reflected rows.
        let field = VectorField::from_fn(axis(-1.1, 0.2, 12), axis(0.0, 0.2, 8), |x, y| {
            (x, -(y + 0.3))
        })
        .expect("field should build");
        let plane = MirrorPlane::new(MirrorAxis::Y, 0.0, 3);
        let extended = field.mirror(&plane).expect("mirroring");
        assert_eq!(scan_cells(&extended, false).flagged.len(), 1);

        let settings = DetectionSettings {
            mirroring: vec![plane],
            ..DetectionSettings::default()
        };
        let frame = detect_frame(&field, 0.0, &settings).expect("detection");
        assert!(frame.is_empty());
    }

    #[test]
    fn sequence_reports_failures_per_frame() {
        let frames = vec![
            (0.0, vortex_at(0.05, 0.1)),
            (1.0, vortex_at(0.15, 0.1)),
            (0.0, vortex_at(0.25, 0.1)),
        ];
        let detection = detect_sequence(&frames, &DetectionSettings::default());
        assert_eq!(detection.collection.times(), vec![0.0, 1.0]);
        assert_eq!(detection.failures.len(), 1);
        assert_eq!(detection.failures[0].error, TopologyError::DuplicateTime(0.0));

        let bad = DetectionSettings {
            window_size: 0,
            ..DetectionSettings::default()
        };
        let detection = detect_sequence(&frames[..2], &bad);
        assert!(detection.collection.is_empty());
        assert_eq!(detection.failures.len(), 2);
    }
}
