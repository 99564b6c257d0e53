//! Poincaré–Bendixson index scanning.
//!
//! The index of a closed loop is the number of turns the velocity direction
//! makes while the loop is walked counter-clockwise. Cells with a non-zero
//! index enclose a critical point; windows sum the indices of their cells.

use crate::bilinear::CellCorners;
use crate::error::{Result, TopologyError};
use crate::field::VectorField;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, instrument};

/// A cell whose index shows it encloses a critical point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedCell {
    pub row: usize,
    pub col: usize,
    pub index: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellScan {
    /// Cells with a non-zero index, row-major order.
    pub flagged: Vec<FlaggedCell>,
    /// Cells skipped because a corner is masked, row-major order.
    pub masked: Vec<(usize, usize)>,
}

/// Angular step wrapped into `[-π, π]`.
pub fn wrap_angle(delta: f64) -> f64 {
    if delta > PI {
        delta - 2.0 * PI
    } else if delta < -PI {
        delta + 2.0 * PI
    } else {
        delta
    }
}

/// Winding number of a closed polygon of vectors (the last vector connects
/// back to the first).
pub fn loop_index(vectors: &[[f64; 2]]) -> i32 {
    if vectors.len() < 2 {
        return 0;
    }
    let angles: Vec<f64> = vectors.iter().map(|v| v[1].atan2(v[0])).collect();
    let total: f64 = angles
        .iter()
        .zip(angles.iter().cycle().skip(1))
        .map(|(from, to)| wrap_angle(to - from))
        .sum();
    (total / (2.0 * PI)).round() as i32
}

/// Index of the 2x2 cell with lower-left sample `(i, j)`.
pub fn cell_index(field: &VectorField, i: usize, j: usize) -> i32 {
    loop_index(&field.cell_corners(i, j).loop_order())
}

/// True if both components change sign over the corners, the necessary
/// condition for a zero inside the cell.
pub fn sign_change_possible(corners: &CellCorners) -> bool {
    let loop_vectors = corners.loop_order();
    let positive_x = loop_vectors.iter().filter(|v| v[0] > 0.0).count();
    let positive_y = loop_vectors.iter().filter(|v| v[1] > 0.0).count();
    (1..4).contains(&positive_x) && (1..4).contains(&positive_y)
}

/// Scans every cell of the field for enclosed critical points.
#[instrument(level = "debug", skip(field), fields(shape = ?field.shape()))]
pub fn scan_cells(field: &VectorField, parallel: bool) -> CellScan {
    let (ny, _) = field.shape();
    let rows: Vec<CellScan> = if parallel {
        (0..ny - 1)
            .into_par_iter()
            .map(|i| scan_row(field, i))
            .collect()
    } else {
        (0..ny - 1).map(|i| scan_row(field, i)).collect()
    };

    let mut scan = CellScan::default();
    for row in rows {
        scan.flagged.extend(row.flagged);
        scan.masked.extend(row.masked);
    }
    debug!(
        flagged = scan.flagged.len(),
        masked = scan.masked.len(),
        "cell scan complete"
    );
    scan
}

fn scan_row(field: &VectorField, i: usize) -> CellScan {
    let (_, nx) = field.shape();
    let mut scan = CellScan::default();
    for j in 0..nx - 1 {
        if field.is_cell_masked(i, j) {
            scan.masked.push((i, j));
            continue;
        }
        let corners = field.cell_corners(i, j);
        if !sign_change_possible(&corners) {
            continue;
        }
        let index = loop_index(&corners.loop_order());
        if index != 0 {
            scan.flagged.push(FlaggedCell {
                row: i,
                col: j,
                index,
            });
        }
    }
    scan
}

/// Index of the rectangle spanned by samples `(i0, j0)` and `(i1, j1)`,
/// walking every sample on its boundary.
pub fn window_index(field: &VectorField, i0: usize, j0: usize, i1: usize, j1: usize) -> Result<i32> {
    let (ny, nx) = field.shape();
    if i1 <= i0 || j1 <= j0 {
        return Err(TopologyError::InvalidWindow(format!(
            "({i0}, {j0})..({i1}, {j1}) does not contain a cell"
        )));
    }
    if i1 >= ny || j1 >= nx {
        return Err(TopologyError::InvalidWindow(format!(
            "({i1}, {j1}) is outside the {ny}x{nx} grid"
        )));
    }

    let mut boundary = Vec::with_capacity(2 * (i1 - i0 + j1 - j0));
    boundary.extend((j0..j1).map(|j| (i0, j)));
    boundary.extend((i0..i1).map(|i| (i, j1)));
    boundary.extend((j0 + 1..=j1).rev().map(|j| (i1, j)));
    boundary.extend((i0 + 1..=i1).rev().map(|i| (i, j0)));

    if let Some(&(i, j)) = boundary.iter().find(|&&(i, j)| field.is_masked(i, j)) {
        return Err(TopologyError::InvalidWindow(format!(
            "boundary sample ({i}, {j}) is masked"
        )));
    }
    let vectors: Vec<[f64; 2]> = boundary
        .into_iter()
        .map(|(i, j)| field.velocity(i, j))
        .collect();
    Ok(loop_index(&vectors))
}

#[cfg(test)]
mod tests {
    use super::{cell_index, loop_index, scan_cells, window_index, wrap_angle, FlaggedCell};
    use crate::field::VectorField;
    use nalgebra::DMatrix;
    use std::f64::consts::PI;

    fn axis(start: f64, step: f64, n: usize) -> Vec<f64> {
        (0..n).map(|k| start + step * k as f64).collect()
    }

    #[test]
    fn wrap_angle_stays_in_half_turn() {
        assert!((wrap_angle(1.5 * PI) + 0.5 * PI).abs() < 1e-12);
        assert!((wrap_angle(-1.5 * PI) - 0.5 * PI).abs() < 1e-12);
        assert_eq!(wrap_angle(0.25), 0.25);
    }

    #[test]
    fn loop_index_of_rotating_loop_is_one() {
        let square = [[1.0, 0.0], [0.0, 1.0], [-1.0, 0.0], [0.0, -1.0]];
        assert_eq!(loop_index(&square), 1);
        let reversed = [[1.0, 0.0], [0.0, -1.0], [-1.0, 0.0], [0.0, 1.0]];
        assert_eq!(loop_index(&reversed), -1);
    }

    #[test]
    fn uniform_field_has_no_flagged_cells() {
        let field = VectorField::from_fn(axis(0.0, 1.0, 6), axis(0.0, 1.0, 5), |x, y| {
            (1.0 + 0.1 * x, 0.5 - 0.05 * y)
        })
        .expect("field should build");
        let scan = scan_cells(&field, false);
        assert!(scan.flagged.is_empty());
        assert!(scan.masked.is_empty());
        assert_eq!(window_index(&field, 0, 0, 4, 5).expect("window"), 0);
    }

    #[test]
    fn saddle_flags_one_cell_with_negative_index() {
        let grid = axis(-2.25, 0.5, 10);
        let field = VectorField::from_fn(grid.clone(), grid, |x, y| (x, -y))
            .expect("field should build");
        let scan = scan_cells(&field, true);
        assert_eq!(
            scan.flagged,
            vec![FlaggedCell {
                row: 4,
                col: 4,
                index: -1
            }]
        );
    }

    #[test]
    fn vortex_has_positive_index() {
        let grid = axis(-2.25, 0.5, 10);
        let field =
            VectorField::from_fn(grid.clone(), grid, |x, y| (-y, x)).expect("field should build");
        assert_eq!(cell_index(&field, 4, 4), 1);
        assert_eq!(window_index(&field, 0, 0, 9, 9).expect("window"), 1);
    }

    #[test]
    fn window_index_equals_sum_of_cell_indices() {
        let grid_x = axis(-2.05, 0.3, 15);
        let grid_y = axis(-1.15, 0.3, 8);
        let field = VectorField::from_fn(grid_x, grid_y, |x, y| (x * x - 1.0, y))
            .expect("field should build");
        let scan = scan_cells(&field, false);
        assert_eq!(scan.flagged.len(), 2);

        let windows = [(0, 0, 7, 14), (0, 7, 7, 14), (0, 0, 7, 7), (2, 3, 6, 12)];
        for (i0, j0, i1, j1) in windows {
            let expected: i32 = scan
                .flagged
                .iter()
                .filter(|c| c.row >= i0 && c.row < i1 && c.col >= j0 && c.col < j1)
                .map(|c| c.index)
                .sum();
            let actual = window_index(&field, i0, j0, i1, j1).expect("window should be valid");
            assert_eq!(actual, expected, "window ({i0}, {j0})..({i1}, {j1})");
        }
        assert_eq!(window_index(&field, 0, 0, 7, 14).expect("window"), 0);
    }

    #[test]
    fn masked_cells_are_reported_not_flagged() {
        let grid = axis(-2.25, 0.5, 10);
        let saddle = VectorField::from_fn(grid.clone(), grid.clone(), |x, y| (x, -y))
            .expect("field should build");
        let mut mask = DMatrix::from_element(10, 10, false);
        mask[(5, 5)] = true;
        let field = VectorField::new(
            grid.clone(),
            grid,
            saddle.vx().clone(),
            saddle.vy().clone(),
            Some(mask),
        )
        .expect("field should build");
        let scan = scan_cells(&field, false);
        assert!(scan.flagged.is_empty());
        assert_eq!(scan.masked, vec![(4, 4), (4, 5), (5, 4), (5, 5)]);
        assert!(window_index(&field, 0, 0, 9, 9).is_ok());
        assert!(window_index(&field, 5, 5, 9, 9).is_err());
    }

    #[test]
    fn window_index_rejects_empty_window() {
        let field = VectorField::from_fn(axis(0.0, 1.0, 3), axis(0.0, 1.0, 3), |_, _| (1.0, 0.0))
            .expect("field should build");
        assert!(window_index(&field, 1, 1, 1, 2).is_err());
        assert!(window_index(&field, 0, 0, 3, 2).is_err());
    }
}
