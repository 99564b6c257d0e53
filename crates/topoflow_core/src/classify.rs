use crate::field::VectorField;
use crate::points::CpKind;
use nalgebra::linalg::SVD;
use nalgebra::{DMatrix, Matrix2};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Stencil width used for saddle separatrix directions.
pub const ORIENTATION_STENCIL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EigenPair {
    pub value: Complex<f64>,
    pub vector: [Complex<f64>; 2],
}

/// Jacobian `[[∂Vx/∂x, ∂Vx/∂y], [∂Vy/∂x, ∂Vy/∂y]]` at `(x, y)`.
///
/// Gradients are central differences over a `window_size`-wide sample
/// neighbourhood of the cell containing the point (one-sided on the
/// neighbourhood edges, clipped at the field border), bilinearly
/// interpolated to the point. An odd `window_size` is rounded down to the
/// next even width. `None` if the point is outside the grid or the
/// neighbourhood holds masked samples.
pub fn local_jacobian(
    field: &VectorField,
    x: f64,
    y: f64,
    window_size: usize,
) -> Option<Matrix2<f64>> {
    let (i, j) = field.locate_cell(x, y)?;
    let (rows, cols) = neighbourhood(field, i, j, window_size);
    jacobian_on(field, rows, cols, i, j, x, y)
}

/// Sample ranges `(row_lo..=row_hi, col_lo..=col_hi)` around cell `(i, j)`.
fn neighbourhood(
    field: &VectorField,
    i: usize,
    j: usize,
    window_size: usize,
) -> ((usize, usize), (usize, usize)) {
    let (ny, nx) = field.shape();
    let half = (window_size / 2).max(1);
    let rows = ((i + 1).saturating_sub(half), (i + half).min(ny - 1));
    let cols = ((j + 1).saturating_sub(half), (j + half).min(nx - 1));
    (rows, cols)
}

fn jacobian_on(
    field: &VectorField,
    rows: (usize, usize),
    cols: (usize, usize),
    i: usize,
    j: usize,
    x: f64,
    y: f64,
) -> Option<Matrix2<f64>> {
    for r in rows.0..=rows.1 {
        for c in cols.0..=cols.1 {
            if field.is_masked(r, c) {
                return None;
            }
        }
    }

    let axis_x = field.axis_x();
    let axis_y = field.axis_y();
    // Gradient of both components at sample (r, c), differencing only
    // within the neighbourhood.
    let gradient = |r: usize, c: usize| -> [f64; 4] {
        let (c_lo, c_hi) = (c.saturating_sub(1).max(cols.0), (c + 1).min(cols.1));
        let (r_lo, r_hi) = (r.saturating_sub(1).max(rows.0), (r + 1).min(rows.1));
        let hx = axis_x[c_hi] - axis_x[c_lo];
        let hy = axis_y[r_hi] - axis_y[r_lo];
        let [ux_hi, vx_hi] = field.velocity(r, c_hi);
        let [ux_lo, vx_lo] = field.velocity(r, c_lo);
        let [uy_hi, vy_hi] = field.velocity(r_hi, c);
        let [uy_lo, vy_lo] = field.velocity(r_lo, c);
        [
            (ux_hi - ux_lo) / hx,
            (uy_hi - uy_lo) / hy,
            (vx_hi - vx_lo) / hx,
            (vy_hi - vy_lo) / hy,
        ]
    };

    let (x0, y0) = field.cell_origin(i, j);
    let (dx, dy) = field.cell_extent(i, j);
    let s = ((x - x0) / dx).clamp(0.0, 1.0);
    let t = ((y - y0) / dy).clamp(0.0, 1.0);
    let weights = [
        ((i, j), (1.0 - s) * (1.0 - t)),
        ((i, j + 1), s * (1.0 - t)),
        ((i + 1, j), (1.0 - s) * t),
        ((i + 1, j + 1), s * t),
    ];
    let mut entries = [0.0; 4];
    for ((r, c), w) in weights {
        let g = gradient(r, c);
        for k in 0..4 {
            entries[k] += w * g[k];
        }
    }
    let jacobian = Matrix2::new(entries[0], entries[1], entries[2], entries[3]);
    jacobian.iter().all(|v| v.is_finite()).then_some(jacobian)
}

/// Eigenpairs ordered by ascending real part, then imaginary part.
pub fn eigen_decomposition(jacobian: &Matrix2<f64>) -> [EigenPair; 2] {
    let matrix = DMatrix::from_iterator(2, 2, jacobian.iter().copied());
    let eigenvalues = matrix.complex_eigenvalues();
    let mut values = [eigenvalues[0], eigenvalues[1]];
    values.sort_by(|a, b| a.re.total_cmp(&b.re).then(a.im.total_cmp(&b.im)));

    let complex_matrix = matrix.map(|v| Complex::new(v, 0.0));
    values.map(|lambda| {
        let mut shifted = complex_matrix.clone();
        for k in 0..2 {
            shifted[(k, k)] -= lambda;
        }
        let svd = SVD::new(shifted, false, true);
        let vector = match svd.v_t {
            Some(v_t) => {
                let row = v_t.row(svd.singular_values.imin());
                normalize([row[0].conj(), row[1].conj()])
            }
            None => [Complex::new(0.0, 0.0); 2],
        };
        EigenPair {
            value: lambda,
            vector,
        }
    })
}

fn normalize(vector: [Complex<f64>; 2]) -> [Complex<f64>; 2] {
    let norm = vector.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if norm > 0.0 {
        vector.map(|c| c / norm)
    } else {
        vector
    }
}

fn is_complex_pair(pairs: &[EigenPair; 2]) -> bool {
    let scale = pairs[0].value.norm().max(pairs[1].value.norm());
    pairs[0].value.im.abs() > 1e-12 * scale.max(f64::MIN_POSITIVE)
}

/// Topological type of a critical point from its Jacobian and cell index.
pub fn classify(jacobian: &Matrix2<f64>, cell_index: i32) -> CpKind {
    if cell_index == -1 {
        return CpKind::Saddle;
    }
    let pairs = eigen_decomposition(jacobian);
    if is_complex_pair(&pairs) {
        return if jacobian[(1, 0)] < 0.0 {
            CpKind::FocusContrarotating
        } else {
            CpKind::Focus
        };
    }
    let (low, high) = (pairs[0].value.re, pairs[1].value.re);
    if low * high < 0.0 {
        CpKind::Saddle
    } else if low >= 0.0 && high >= 0.0 {
        CpKind::NodeOut
    } else {
        CpKind::NodeIn
    }
}

/// Unit directions of the incoming and outgoing separatrices of a saddle.
///
/// Needs the full 4x4 stencil around the point; near a border, with masked
/// samples or with non-real eigenvalues both directions are zero.
pub fn saddle_orientations(field: &VectorField, x: f64, y: f64) -> [[f64; 2]; 2] {
    let zero = [[0.0; 2]; 2];
    let Some((i, j)) = field.locate_cell(x, y) else {
        return zero;
    };
    let (ny, nx) = field.shape();
    let half = ORIENTATION_STENCIL / 2;
    if i + 1 < half || j + 1 < half || i + half >= ny || j + half >= nx {
        return zero;
    }
    let (rows, cols) = neighbourhood(field, i, j, ORIENTATION_STENCIL);
    let Some(jacobian) = jacobian_on(field, rows, cols, i, j, x, y) else {
        return zero;
    };
    let pairs = eigen_decomposition(&jacobian);
    if is_complex_pair(&pairs) {
        return zero;
    }
    [real_direction(&pairs[0].vector), real_direction(&pairs[1].vector)]
}

/// Removes the arbitrary complex phase of a real eigenvector and fixes its
/// sign so the largest component is positive.
fn real_direction(vector: &[Complex<f64>; 2]) -> [f64; 2] {
    let pivot = if vector[0].norm() >= vector[1].norm() {
        vector[0]
    } else {
        vector[1]
    };
    if pivot.norm() == 0.0 {
        return [0.0; 2];
    }
    let phase = pivot.conj() / pivot.norm();
    let real = [(vector[0] * phase).re, (vector[1] * phase).re];
    let norm = real[0].hypot(real[1]);
    if norm == 0.0 {
        return [0.0; 2];
    }
    [real[0] / norm, real[1] / norm]
}
