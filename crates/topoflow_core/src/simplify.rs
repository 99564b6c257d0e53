//! Topological simplification of the critical points of one frame.
//!
//! Points closer than `dist_min` are treated as one structure seen at a
//! coarser scale. The closest pair is merged repeatedly: the merged point
//! sits at the weight-averaged position of its members and carries the sum
//! of their indices. Clusters whose index sums to zero are equivalent to a
//! uniform flow and disappear.

use crate::error::{Result, TopologyError};
use crate::points::{Confidence, CpKind, CriticalPoint, FramePoints};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimplifyMode {
    /// Merge the closest pair into its center of mass, repeatedly.
    #[default]
    Replacement,
    /// Only remove close pairs whose indices cancel; others are left alone.
    OnlyDelete,
}

struct Cluster {
    x: f64,
    y: f64,
    weight: usize,
    index: i32,
    first: CriticalPoint,
    kinds: Vec<CpKind>,
}

impl Cluster {
    fn new(point: &CriticalPoint) -> Self {
        Self {
            x: point.x,
            y: point.y,
            weight: 1,
            index: point.kind.index(),
            first: *point,
            kinds: vec![point.kind],
        }
    }

    fn absorb(&mut self, other: Cluster) {
        let total = (self.weight + other.weight) as f64;
        self.x = (self.x * self.weight as f64 + other.x * other.weight as f64) / total;
        self.y = (self.y * self.weight as f64 + other.y * other.weight as f64) / total;
        self.weight += other.weight;
        self.index += other.index;
        self.kinds.extend(other.kinds);
    }

    fn distance2(&self, other: &Cluster) -> f64 {
        (self.x - other.x).powi(2) + (self.y - other.y).powi(2)
    }

    /// Type of the cluster, `None` if its index is not ±1.
    fn resolve(self, time: f64) -> Option<CriticalPoint> {
        if self.weight == 1 {
            return Some(self.first);
        }
        let kind = match self.index {
            -1 => CpKind::Saddle,
            1 => majority_kind(&self.kinds),
            index => {
                warn!(time, index, members = self.weight, "merged index too high, point dropped");
                return None;
            }
        };
        Some(CriticalPoint {
            x: self.x,
            y: self.y,
            time,
            kind,
            orientations: None,
            confidence: Confidence::Merged,
        })
    }
}

/// Most frequent non-saddle type; ties go to the first in `CpKind::ALL`.
fn majority_kind(kinds: &[CpKind]) -> CpKind {
    let mut best = (CpKind::Focus, 0usize);
    for kind in CpKind::ALL.into_iter().filter(|k| *k != CpKind::Saddle) {
        let count = kinds.iter().filter(|k| **k == kind).count();
        if count > best.1 {
            best = (kind, count);
        }
    }
    best.0
}

/// Simplified copy of `frame` where no two points are closer than
/// `dist_min` (in `Replacement` mode).
pub fn simplify_frame(frame: &FramePoints, dist_min: f64, mode: SimplifyMode) -> Result<FramePoints> {
    if dist_min.is_nan() || dist_min < 0.0 {
        return Err(TopologyError::InvalidConfig(format!(
            "dist_min must be non-negative, got {dist_min}"
        )));
    }
    let limit = dist_min * dist_min;
    let mut clusters: Vec<Option<Cluster>> = frame.points().iter().map(|p| Some(Cluster::new(p))).collect();
    let mut kept_apart: HashSet<(usize, usize)> = HashSet::new();

    loop {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..clusters.len() {
            let Some(a) = &clusters[i] else { continue };
            for j in i + 1..clusters.len() {
                let Some(b) = &clusters[j] else { continue };
                if kept_apart.contains(&(i, j)) {
                    continue;
                }
                let d2 = a.distance2(b);
                if best.map_or(true, |(_, _, bd)| d2 < bd) {
                    best = Some((i, j, d2));
                }
            }
        }
        let Some((i, j, d2)) = best else { break };
        if !(d2 <= limit) {
            break;
        }
        match mode {
            SimplifyMode::Replacement => {
                if let Some(other) = clusters[j].take() {
                    if let Some(target) = clusters[i].as_mut() {
                        target.absorb(other);
                    }
                }
            }
            SimplifyMode::OnlyDelete => {
                let cancels = matches!(
                    (&clusters[i], &clusters[j]),
                    (Some(a), Some(b)) if a.index + b.index == 0
                );
                if cancels {
                    clusters[i] = None;
                    clusters[j] = None;
                } else {
                    kept_apart.insert((i, j));
                }
            }
        }
    }

    let mut simplified = FramePoints::new(frame.time());
    for cluster in clusters.into_iter().flatten() {
        if cluster.index == 0 {
            continue;
        }
        if let Some(point) = cluster.resolve(frame.time()) {
            simplified.push(point);
        }
    }
    debug!(
        time = frame.time(),
        before = frame.len(),
        after = simplified.len(),
        ?mode,
        "frame simplified"
    );
    Ok(simplified)
}
