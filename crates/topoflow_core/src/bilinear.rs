//! Sub-cell location of a zero of the bilinearly interpolated field.
//!
//! Each velocity component over a cell is modelled as
//! `f(s, t) = d + a·s + b·t + c·s·t` in normalized cell coordinates
//! `s = x/dx`, `t = y/dy` in `[0, 1]`, fitted exactly to the four corners.
//! Eliminating `t` between the two components leaves one quadratic in `s`:
//!
//! ```text
//! A s² + B s + C = 0
//! A = a₂c₁ − a₁c₂
//! B = d₂c₁ + a₂b₁ − a₁b₂ − d₁c₂
//! C = d₂b₁ − d₁b₂
//! ```
//!
//! and `t` is recovered from whichever component has the better-conditioned
//! denominator `b + c·s`.

/// Velocity vectors at the four corners of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellCorners {
    pub lower_left: [f64; 2],
    pub lower_right: [f64; 2],
    pub upper_left: [f64; 2],
    pub upper_right: [f64; 2],
}

impl CellCorners {
    /// Corners in winding order: lower-left, lower-right, upper-right, upper-left.
    pub fn loop_order(&self) -> [[f64; 2]; 4] {
        [
            self.lower_left,
            self.lower_right,
            self.upper_right,
            self.upper_left,
        ]
    }

    fn component(&self, k: usize) -> [f64; 4] {
        [
            self.lower_left[k],
            self.lower_right[k],
            self.upper_left[k],
            self.upper_right[k],
        ]
    }
}

/// `d + a·s + b·t + c·s·t` over the unit cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BilinearForm {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl BilinearForm {
    /// Exact fit to corner values ordered lower-left, lower-right,
    /// upper-left, upper-right.
    pub fn fit(values: [f64; 4]) -> Self {
        let [ll, lr, ul, ur] = values;
        Self {
            a: lr - ll,
            b: ul - ll,
            c: ur - ul - lr + ll,
            d: ll,
        }
    }

    pub fn evaluate(&self, s: f64, t: f64) -> f64 {
        self.d + self.a * s + self.b * t + self.c * s * t
    }

    fn scale(&self) -> f64 {
        self.a.abs() + self.b.abs() + self.c.abs() + self.d.abs()
    }
}

/// Outcome of the per-cell root solve, positions relative to the cell origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellRoot {
    /// Exactly one admissible zero.
    Unique { x: f64, y: f64 },
    /// Several distinct admissible zeros, averaged.
    Averaged { x: f64, y: f64, candidates: usize },
    /// No admissible zero; the cell center is used instead.
    Fallback { x: f64, y: f64 },
}

impl CellRoot {
    pub fn position(&self) -> (f64, f64) {
        match *self {
            CellRoot::Unique { x, y }
            | CellRoot::Averaged { x, y, .. }
            | CellRoot::Fallback { x, y } => (x, y),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, CellRoot::Fallback { .. })
    }
}

const BOUNDS_SLACK: f64 = 1e-9;
const DUPLICATE_TOL: f64 = 1e-9;
const DEGENERATE_TOL: f64 = 1e-12;

/// Solves for the zero of the bilinear interpolant inside a `dx` × `dy` cell.
pub fn solve_cell(corners: &CellCorners, dx: f64, dy: f64) -> CellRoot {
    let center = CellRoot::Fallback {
        x: 0.5 * dx,
        y: 0.5 * dy,
    };

    let zero_corners: Vec<(f64, f64)> = [
        (corners.lower_left, 0.0, 0.0),
        (corners.lower_right, 1.0, 0.0),
        (corners.upper_left, 0.0, 1.0),
        (corners.upper_right, 1.0, 1.0),
    ]
    .iter()
    .filter(|(v, _, _)| v[0] == 0.0 && v[1] == 0.0)
    .map(|&(_, s, t)| (s, t))
    .collect();
    match zero_corners.len() {
        0 => {}
        1 => {
            let (s, t) = zero_corners[0];
            return CellRoot::Unique {
                x: s * dx,
                y: t * dy,
            };
        }
        _ => return center,
    }

    let u = BilinearForm::fit(corners.component(0));
    let v = BilinearForm::fit(corners.component(1));
    let candidates = unit_cell_roots(&u, &v);

    match candidates.len() {
        0 => center,
        1 => {
            let (s, t) = candidates[0];
            CellRoot::Unique {
                x: s * dx,
                y: t * dy,
            }
        }
        n => {
            let (sum_s, sum_t) = candidates
                .iter()
                .fold((0.0, 0.0), |(a, b), (s, t)| (a + s, b + t));
            CellRoot::Averaged {
                x: sum_s / n as f64 * dx,
                y: sum_t / n as f64 * dy,
                candidates: n,
            }
        }
    }
}

/// Real, distinct roots of the pair of forms inside `[0, 1]²`.
fn unit_cell_roots(u: &BilinearForm, v: &BilinearForm) -> Vec<(f64, f64)> {
    let quad_a = v.a * u.c - u.a * v.c;
    let quad_b = v.d * u.c + v.a * u.b - u.a * v.b - u.d * v.c;
    let quad_c = v.d * u.b - u.d * v.b;
    let scale = u.scale() * v.scale();
    if scale == 0.0 || !scale.is_finite() {
        return Vec::new();
    }

    let mut s_values = Vec::with_capacity(2);
    if quad_a.abs() <= DEGENERATE_TOL * scale {
        if quad_b.abs() > DEGENERATE_TOL * scale {
            s_values.push(-quad_c / quad_b);
        }
    } else {
        let mut disc = quad_b * quad_b - 4.0 * quad_a * quad_c;
        let disc_scale = quad_b * quad_b + (4.0 * quad_a * quad_c).abs();
        if disc < 0.0 {
            if disc >= -DEGENERATE_TOL * disc_scale {
                disc = 0.0;
            } else {
                return Vec::new();
            }
        }
        let root = disc.sqrt();
        let q = -0.5 * (quad_b + root.copysign(quad_b));
        if q == 0.0 {
            s_values.push(0.0);
        } else {
            s_values.push(q / quad_a);
            s_values.push(quad_c / q);
        }
    }

    let mut roots: Vec<(f64, f64)> = Vec::with_capacity(2);
    for s in s_values {
        if !s.is_finite() || !in_unit_range(s) {
            continue;
        }
        let Some(t) = solve_for_t(u, v, s) else {
            continue;
        };
        if !in_unit_range(t) {
            continue;
        }
        let candidate = (s.clamp(0.0, 1.0), t.clamp(0.0, 1.0));
        let duplicate = roots.iter().any(|&(rs, rt)| {
            (rs - candidate.0).abs() <= DUPLICATE_TOL && (rt - candidate.1).abs() <= DUPLICATE_TOL
        });
        if !duplicate {
            roots.push(candidate);
        }
    }
    roots
}

fn solve_for_t(u: &BilinearForm, v: &BilinearForm, s: f64) -> Option<f64> {
    let den_u = u.b + u.c * s;
    let den_v = v.b + v.c * s;
    let (num, den) = if den_u.abs() >= den_v.abs() {
        (u.d + u.a * s, den_u)
    } else {
        (v.d + v.a * s, den_v)
    };
    if den.abs() <= DEGENERATE_TOL * (u.scale() + v.scale()) {
        return None;
    }
    let t = -num / den;
    t.is_finite().then_some(t)
}

fn in_unit_range(value: f64) -> bool {
    (-BOUNDS_SLACK..=1.0 + BOUNDS_SLACK).contains(&value)
}
