use crate::bilinear::CellCorners;
use crate::error::{Result, TopologyError};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A 2D velocity field sampled on a rectangular grid.
///
/// Matrices are indexed `(i, j)` with `i` along `axis_y` (rows) and `j`
/// along `axis_x` (columns). Masked samples are excluded from scanning and
/// from Jacobian stencils.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorField {
    axis_x: Vec<f64>,
    axis_y: Vec<f64>,
    vx: DMatrix<f64>,
    vy: DMatrix<f64>,
    mask: DMatrix<bool>,
}

impl VectorField {
    pub fn new(
        axis_x: Vec<f64>,
        axis_y: Vec<f64>,
        vx: DMatrix<f64>,
        vy: DMatrix<f64>,
        mask: Option<DMatrix<bool>>,
    ) -> Result<Self> {
        validate_axis('x', &axis_x)?;
        validate_axis('y', &axis_y)?;
        let expected = (axis_y.len(), axis_x.len());
        check_shape("vx", expected, vx.shape())?;
        check_shape("vy", expected, vy.shape())?;
        let mut mask = match mask {
            Some(mask) => {
                check_shape("mask", expected, mask.shape())?;
                mask
            }
            None => DMatrix::from_element(expected.0, expected.1, false),
        };
        for i in 0..expected.0 {
            for j in 0..expected.1 {
                if !vx[(i, j)].is_finite() || !vy[(i, j)].is_finite() {
                    mask[(i, j)] = true;
                }
            }
        }
        Ok(Self {
            axis_x,
            axis_y,
            vx,
            vy,
            mask,
        })
    }

    /// Samples an analytic field `f(x, y) -> (vx, vy)` on the given axes.
    pub fn from_fn<F>(axis_x: Vec<f64>, axis_y: Vec<f64>, f: F) -> Result<Self>
    where
        F: Fn(f64, f64) -> (f64, f64),
    {
        let (ny, nx) = (axis_y.len(), axis_x.len());
        let mut vx = DMatrix::zeros(ny, nx);
        let mut vy = DMatrix::zeros(ny, nx);
        for (i, &y) in axis_y.iter().enumerate() {
            for (j, &x) in axis_x.iter().enumerate() {
                let (u, v) = f(x, y);
                vx[(i, j)] = u;
                vy[(i, j)] = v;
            }
        }
        Self::new(axis_x, axis_y, vx, vy, None)
    }

    pub fn axis_x(&self) -> &[f64] {
        &self.axis_x
    }

    pub fn axis_y(&self) -> &[f64] {
        &self.axis_y
    }

    pub fn vx(&self) -> &DMatrix<f64> {
        &self.vx
    }

    pub fn vy(&self) -> &DMatrix<f64> {
        &self.vy
    }

    pub fn mask(&self) -> &DMatrix<bool> {
        &self.mask
    }

    /// `(rows, columns)`, i.e. `(axis_y.len(), axis_x.len())`.
    pub fn shape(&self) -> (usize, usize) {
        (self.axis_y.len(), self.axis_x.len())
    }

    pub fn velocity(&self, i: usize, j: usize) -> [f64; 2] {
        [self.vx[(i, j)], self.vy[(i, j)]]
    }

    pub fn is_masked(&self, i: usize, j: usize) -> bool {
        self.mask[(i, j)]
    }

    pub fn has_mask(&self) -> bool {
        self.mask.iter().any(|&m| m)
    }

    /// True if any corner of cell `(i, j)` is masked.
    pub fn is_cell_masked(&self, i: usize, j: usize) -> bool {
        self.mask[(i, j)]
            || self.mask[(i, j + 1)]
            || self.mask[(i + 1, j)]
            || self.mask[(i + 1, j + 1)]
    }

    /// Position of the lower-left corner of cell `(i, j)`.
    pub fn cell_origin(&self, i: usize, j: usize) -> (f64, f64) {
        (self.axis_x[j], self.axis_y[i])
    }

    /// Width and height of cell `(i, j)`.
    pub fn cell_extent(&self, i: usize, j: usize) -> (f64, f64) {
        (
            self.axis_x[j + 1] - self.axis_x[j],
            self.axis_y[i + 1] - self.axis_y[i],
        )
    }

    pub fn cell_center(&self, i: usize, j: usize) -> (f64, f64) {
        let (x0, y0) = self.cell_origin(i, j);
        let (dx, dy) = self.cell_extent(i, j);
        (x0 + 0.5 * dx, y0 + 0.5 * dy)
    }

    pub fn cell_corners(&self, i: usize, j: usize) -> CellCorners {
        CellCorners {
            lower_left: self.velocity(i, j),
            lower_right: self.velocity(i, j + 1),
            upper_left: self.velocity(i + 1, j),
            upper_right: self.velocity(i + 1, j + 1),
        }
    }

    /// Cell `(i, j)` containing the position, or `None` outside the grid.
    /// Points on a shared edge belong to the cell above/right of it, except
    /// on the last axis sample.
    pub fn locate_cell(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let j = locate_on_axis(&self.axis_x, x)?;
        let i = locate_on_axis(&self.axis_y, y)?;
        Some((i, j))
    }

    /// `((x_min, x_max), (y_min, y_max))`.
    pub fn extent(&self) -> ((f64, f64), (f64, f64)) {
        (
            (self.axis_x[0], self.axis_x[self.axis_x.len() - 1]),
            (self.axis_y[0], self.axis_y[self.axis_y.len() - 1]),
        )
    }

    /// Extends the field beyond one border by reflecting samples across a
    /// symmetry plane, so critical points sitting on a wall can be enclosed
    /// by cells.
    ///
    /// The plane must lie on or outside the field border. Reflected samples
    /// flip the velocity component normal to the plane; both components are
    /// multiplied by `plane.coef`.
    pub fn mirror(&self, plane: &MirrorPlane) -> Result<VectorField> {
        if plane.rows == 0 {
            return Err(TopologyError::InvalidConfig(
                "mirroring needs at least one row".to_string(),
            ));
        }
        if !plane.position.is_finite() || !plane.coef.is_finite() {
            return Err(TopologyError::InvalidConfig(
                "mirror plane position and coefficient must be finite".to_string(),
            ));
        }

        let axis = match plane.axis {
            MirrorAxis::X => &self.axis_x,
            MirrorAxis::Y => &self.axis_y,
        };
        let (new_axis, sources) = mirrored_axis(axis, plane.position, plane.rows)?;
        let (coef_x, coef_y) = match plane.axis {
            MirrorAxis::X => (-plane.coef, plane.coef),
            MirrorAxis::Y => (plane.coef, -plane.coef),
        };

        let (ny, nx) = match plane.axis {
            MirrorAxis::X => (self.axis_y.len(), new_axis.len()),
            MirrorAxis::Y => (new_axis.len(), self.axis_x.len()),
        };
        let source = |i: usize, j: usize| -> (usize, usize, bool) {
            match plane.axis {
                MirrorAxis::X => {
                    let (src, mirrored) = sources[j];
                    (i, src, mirrored)
                }
                MirrorAxis::Y => {
                    let (src, mirrored) = sources[i];
                    (src, j, mirrored)
                }
            }
        };

        let vx = DMatrix::from_fn(ny, nx, |i, j| {
            let (si, sj, mirrored) = source(i, j);
            let value = self.vx[(si, sj)];
            if mirrored {
                value * coef_x
            } else {
                value
            }
        });
        let vy = DMatrix::from_fn(ny, nx, |i, j| {
            let (si, sj, mirrored) = source(i, j);
            let value = self.vy[(si, sj)];
            if mirrored {
                value * coef_y
            } else {
                value
            }
        });
        let mask = DMatrix::from_fn(ny, nx, |i, j| {
            let (si, sj, _) = source(i, j);
            self.mask[(si, sj)]
        });

        let (axis_x, axis_y) = match plane.axis {
            MirrorAxis::X => (new_axis, self.axis_y.clone()),
            MirrorAxis::Y => (self.axis_x.clone(), new_axis),
        };
        debug!(
            axis = ?plane.axis,
            position = plane.position,
            added = sources.iter().filter(|(_, m)| *m).count(),
            "mirrored field"
        );
        VectorField::new(axis_x, axis_y, vx, vy, Some(mask))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorAxis {
    /// Plane of constant x (a vertical wall).
    X,
    /// Plane of constant y (a horizontal wall).
    Y,
}

/// A symmetry plane used to extend a field across a wall.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MirrorPlane {
    pub axis: MirrorAxis,
    pub position: f64,
    /// Number of grid lines reflected across the plane.
    pub rows: usize,
    #[serde(default = "default_mirror_coef")]
    pub coef: f64,
}

impl MirrorPlane {
    pub fn new(axis: MirrorAxis, position: f64, rows: usize) -> Self {
        Self {
            axis,
            position,
            rows,
            coef: default_mirror_coef(),
        }
    }
}

fn default_mirror_coef() -> f64 {
    1.0
}

/// Builds the extended axis and, for every new sample, the original sample
/// it reads from and whether it is a reflection.
fn mirrored_axis(
    axis: &[f64],
    position: f64,
    rows: usize,
) -> Result<(Vec<f64>, Vec<(usize, bool)>)> {
    let n = axis.len();
    let first = axis[0];
    let last = axis[n - 1];
    let tol = 1e-12 * (1.0 + first.abs().max(last.abs()));
    let original: Vec<(usize, bool)> = (0..n).map(|k| (k, false)).collect();

    if position <= first + tol {
        // Sample 0 maps onto itself when the plane sits on it.
        let skip = usize::from((position - first).abs() <= tol);
        let count = rows.min(n - skip);
        let mut new_axis = Vec::with_capacity(n + count);
        let mut sources = Vec::with_capacity(n + count);
        for k in (skip..skip + count).rev() {
            new_axis.push(2.0 * position - axis[k]);
            sources.push((k, true));
        }
        new_axis.extend_from_slice(axis);
        sources.extend(original);
        Ok((new_axis, sources))
    } else if position >= last - tol {
        let skip = usize::from((position - last).abs() <= tol);
        let count = rows.min(n - skip);
        let mut new_axis = axis.to_vec();
        let mut sources = original;
        for offset in skip..skip + count {
            let k = n - 1 - offset;
            new_axis.push(2.0 * position - axis[k]);
            sources.push((k, true));
        }
        Ok((new_axis, sources))
    } else {
        Err(TopologyError::InvalidConfig(format!(
            "mirror plane at {position} lies inside the field [{first}, {last}]"
        )))
    }
}

fn validate_axis(name: char, axis: &[f64]) -> Result<()> {
    if axis.len() < 2 {
        return Err(TopologyError::AxisTooShort {
            axis: name,
            len: axis.len(),
        });
    }
    if let Some(index) = axis.iter().position(|v| !v.is_finite()) {
        return Err(TopologyError::NonMonotonicAxis { axis: name, index });
    }
    if let Some(index) = axis.windows(2).position(|w| w[1] <= w[0]) {
        return Err(TopologyError::NonMonotonicAxis {
            axis: name,
            index: index + 1,
        });
    }
    Ok(())
}

fn check_shape(name: &'static str, expected: (usize, usize), actual: (usize, usize)) -> Result<()> {
    if expected != actual {
        return Err(TopologyError::ShapeMismatch {
            name,
            expected,
            actual,
        });
    }
    Ok(())
}

fn locate_on_axis(axis: &[f64], value: f64) -> Option<usize> {
    let n = axis.len();
    if !(value >= axis[0] && value <= axis[n - 1]) {
        return None;
    }
    let upper = axis.partition_point(|&a| a <= value);
    Some(upper.saturating_sub(1).min(n - 2))
}
