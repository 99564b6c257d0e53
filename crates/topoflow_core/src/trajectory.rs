//! Greedy linking of per-frame critical points into trajectories.
//!
//! At each frame transition the squared distances between the last point of
//! every open trajectory and every new point are computed, and the globally
//! smallest remaining distance is matched repeatedly until it exceeds
//! `epsilon²`. Open trajectories left without a point are closed; points
//! left without a trajectory open new ones.
//!
//! Ties are broken by scan order: new points in detection order (outer),
//! open trajectories in opening order (inner), first strict minimum wins.
//! This makes linking fully deterministic for a given input.

use crate::error::{Result, TopologyError};
use crate::points::CpKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub x: f64,
    pub y: f64,
    pub time: f64,
    /// Index of the frame in the linked sequence.
    pub frame: usize,
    /// Index of the point within its frame's input list.
    pub slot: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub kind: CpKind,
    pub samples: Vec<TrajectorySample>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn start_time(&self) -> Option<f64> {
        self.samples.first().map(|s| s.time)
    }

    pub fn end_time(&self) -> Option<f64> {
        self.samples.last().map(|s| s.time)
    }

    pub fn positions(&self) -> impl Iterator<Item = [f64; 2]> + '_ {
        self.samples.iter().map(|s| [s.x, s.y])
    }

    pub fn times(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.time)
    }
}

/// Moving-average kernel applied along a trajectory, samples beyond either
/// end repeat the end sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Smoothing {
    /// Box filter over `size` consecutive samples.
    Uniform { size: usize },
    /// Gaussian filter of standard deviation `sigma` samples, truncated at
    /// four sigma.
    Gaussian { sigma: f64 },
}

impl Default for Smoothing {
    fn default() -> Self {
        Smoothing::Uniform { size: 3 }
    }
}

impl Smoothing {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Smoothing::Uniform { size } if size == 0 => Err(TopologyError::InvalidConfig(
                "uniform smoothing size must be at least 1".to_string(),
            )),
            Smoothing::Gaussian { sigma } if !(sigma > 0.0 && sigma.is_finite()) => {
                Err(TopologyError::InvalidConfig(format!(
                    "gaussian smoothing sigma must be positive, got {sigma}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Offsets and normalized weights of the kernel.
    fn kernel(&self) -> Vec<(isize, f64)> {
        match *self {
            Smoothing::Uniform { size } => {
                let start = -((size / 2) as isize);
                let weight = 1.0 / size as f64;
                (0..size as isize).map(|k| (start + k, weight)).collect()
            }
            Smoothing::Gaussian { sigma } => {
                let radius = (4.0 * sigma + 0.5) as isize;
                let raw: Vec<(isize, f64)> = (-radius..=radius)
                    .map(|k| (k, (-0.5 * (k as f64 / sigma).powi(2)).exp()))
                    .collect();
                let total: f64 = raw.iter().map(|(_, w)| w).sum();
                raw.into_iter().map(|(k, w)| (k, w / total)).collect()
            }
        }
    }
}

fn filter_clamped(values: &[f64], kernel: &[(isize, f64)]) -> Vec<f64> {
    let last = values.len() as isize - 1;
    (0..values.len() as isize)
        .map(|i| {
            kernel
                .iter()
                .map(|&(offset, weight)| weight * values[(i + offset).clamp(0, last) as usize])
                .sum()
        })
        .collect()
}

impl Trajectory {
    /// Copy with smoothed positions; times, frames and slots are unchanged.
    pub fn smoothed(&self, smoothing: &Smoothing) -> Result<Trajectory> {
        smoothing.validate()?;
        if self.samples.is_empty() {
            return Ok(self.clone());
        }
        let kernel = smoothing.kernel();
        let xs: Vec<f64> = self.samples.iter().map(|s| s.x).collect();
        let ys: Vec<f64> = self.samples.iter().map(|s| s.y).collect();
        let xs = filter_clamped(&xs, &kernel);
        let ys = filter_clamped(&ys, &kernel);
        let samples = self
            .samples
            .iter()
            .zip(xs.into_iter().zip(ys))
            .map(|(sample, (x, y))| TrajectorySample { x, y, ..*sample })
            .collect();
        Ok(Trajectory {
            kind: self.kind,
            samples,
        })
    }
}

/// Positions detected at one time, in detection order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointFrame {
    pub time: f64,
    pub positions: Vec<[f64; 2]>,
}

pub(crate) fn validate_epsilon(epsilon: f64) -> Result<()> {
    if epsilon.is_nan() || epsilon <= 0.0 {
        return Err(TopologyError::InvalidConfig(format!(
            "epsilon must be positive, got {epsilon}"
        )));
    }
    Ok(())
}

struct Line {
    order: usize,
    samples: Vec<TrajectorySample>,
}

impl Line {
    fn last(&self) -> &TrajectorySample {
        // Lines are created with one sample and only grow.
        &self.samples[self.samples.len() - 1]
    }
}

/// Links the points of one critical point type across frames.
///
/// `frames` must be sorted by strictly increasing time. Trajectories are
/// returned longest first, then by start time, then by opening order.
#[instrument(level = "debug", skip(frames), fields(frames = frames.len()))]
pub fn link_points(kind: CpKind, frames: &[PointFrame], epsilon: f64) -> Result<Vec<Trajectory>> {
    validate_epsilon(epsilon)?;
    if let Some(k) = frames
        .windows(2)
        .position(|w| !(w[1].time > w[0].time))
    {
        return Err(TopologyError::InvalidConfig(format!(
            "frame times must be strictly increasing (frame {})",
            k + 1
        )));
    }
    let Some(first) = frames.first() else {
        return Ok(Vec::new());
    };

    let epsilon2 = epsilon * epsilon;
    let mut next_order = 0usize;
    let mut open: Vec<Line> = Vec::new();
    let mut closed: Vec<Line> = Vec::new();
    let mut spawn = |frame: usize, time: f64, slot: usize, position: [f64; 2]| {
        let line = Line {
            order: next_order,
            samples: vec![TrajectorySample {
                x: position[0],
                y: position[1],
                time,
                frame,
                slot,
            }],
        };
        next_order += 1;
        line
    };

    for (slot, &position) in first.positions.iter().enumerate() {
        open.push(spawn(0, first.time, slot, position));
    }

    for (frame_idx, frame) in frames.iter().enumerate().skip(1) {
        let points = &frame.positions;
        let n_lines = open.len();
        let lines = &open;
        let distances: Vec<f64> = points
            .iter()
            .flat_map(|p| {
                lines.iter().map(move |line| {
                    let last = line.last();
                    (p[0] - last.x).powi(2) + (p[1] - last.y).powi(2)
                })
            })
            .collect();

        let mut point_used = vec![false; points.len()];
        let mut line_used = vec![false; n_lines];
        let mut matched = 0usize;
        loop {
            let mut best: Option<(usize, usize, f64)> = None;
            for p in (0..points.len()).filter(|p| !point_used[*p]) {
                for l in (0..n_lines).filter(|l| !line_used[*l]) {
                    let d2 = distances[p * n_lines + l];
                    if best.map_or(true, |(_, _, b)| d2 < b) {
                        best = Some((p, l, d2));
                    }
                }
            }
            let Some((p, l, d2)) = best else {
                break;
            };
            if !(d2 <= epsilon2) {
                break;
            }
            open[l].samples.push(TrajectorySample {
                x: points[p][0],
                y: points[p][1],
                time: frame.time,
                frame: frame_idx,
                slot: p,
            });
            point_used[p] = true;
            line_used[l] = true;
            matched += 1;
        }

        let mut still_open = Vec::with_capacity(n_lines + points.len());
        for (line, used) in open.drain(..).zip(line_used) {
            if used {
                still_open.push(line);
            } else {
                closed.push(line);
            }
        }
        for (slot, &position) in points.iter().enumerate() {
            if !point_used[slot] {
                still_open.push(spawn(frame_idx, frame.time, slot, position));
            }
        }
        trace!(
            time = frame.time,
            matched,
            closed = n_lines - matched,
            spawned = points.len() - matched,
            "linked frame"
        );
        open = still_open;
    }
    closed.append(&mut open);

    closed.sort_by(|a, b| {
        b.samples
            .len()
            .cmp(&a.samples.len())
            .then(a.samples[0].time.total_cmp(&b.samples[0].time))
            .then(a.order.cmp(&b.order))
    });
    debug!(?kind, trajectories = closed.len(), "linking complete");
    Ok(closed
        .into_iter()
        .map(|line| Trajectory {
            kind,
            samples: line.samples,
        })
        .collect())
}

/// Trajectories of every critical point type, tagged with the parameters
/// and source collection version they were computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySet {
    epsilon: f64,
    source_version: u64,
    by_kind: BTreeMap<CpKind, Vec<Trajectory>>,
}

impl TrajectorySet {
    pub(crate) fn new(
        epsilon: f64,
        source_version: u64,
        by_kind: BTreeMap<CpKind, Vec<Trajectory>>,
    ) -> Self {
        Self {
            epsilon,
            source_version,
            by_kind,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn source_version(&self) -> u64 {
        self.source_version
    }

    pub fn of_kind(&self, kind: CpKind) -> &[Trajectory] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trajectory> {
        self.by_kind.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy with every trajectory smoothed, same epsilon and source version.
    pub fn smoothed(&self, smoothing: &Smoothing) -> Result<TrajectorySet> {
        let by_kind = self
            .by_kind
            .iter()
            .map(|(kind, trajs)| {
                let smoothed = trajs
                    .iter()
                    .map(|t| t.smoothed(smoothing))
                    .collect::<Result<Vec<_>>>()?;
                Ok((*kind, smoothed))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(TrajectorySet::new(self.epsilon, self.source_version, by_kind))
    }

    /// Copy keeping only trajectories with at least `min_len` samples.
    pub fn filter_min_len(&self, min_len: usize) -> TrajectorySet {
        let by_kind = self
            .by_kind
            .iter()
            .map(|(kind, trajs)| {
                let kept = trajs.iter().filter(|t| t.len() >= min_len).cloned().collect();
                (*kind, kept)
            })
            .collect();
        TrajectorySet::new(self.epsilon, self.source_version, by_kind)
    }
}

#[cfg(test)]
mod tests {
    use super::{link_points, PointFrame, Smoothing, Trajectory, TrajectorySample, TrajectorySet};
    use crate::points::CpKind;
    use std::collections::BTreeMap;

    fn frames(data: &[(f64, &[[f64; 2]])]) -> Vec<PointFrame> {
        data.iter()
            .map(|(time, positions)| PointFrame {
                time: *time,
                positions: positions.to_vec(),
            })
            .collect()
    }

    fn drifting(n: usize, step: f64) -> Vec<PointFrame> {
        (0..n)
            .map(|k| PointFrame {
                time: k as f64,
                positions: vec![[1.0 + step * k as f64, 2.0]],
            })
            .collect()
    }

    fn lengths(trajs: &[Trajectory]) -> Vec<usize> {
        trajs.iter().map(Trajectory::len).collect()
    }

    #[test]
    fn rejects_non_positive_epsilon() {
        let input = drifting(3, 0.1);
        assert!(link_points(CpKind::Focus, &input, 0.0).is_err());
        assert!(link_points(CpKind::Focus, &input, -1.0).is_err());
        assert!(link_points(CpKind::Focus, &input, f64::NAN).is_err());
    }

    #[test]
    fn rejects_unsorted_frames() {
        let input = frames(&[(1.0, &[[0.0, 0.0]]), (0.5, &[[0.0, 0.0]])]);
        let err = link_points(CpKind::Saddle, &input, 1.0).expect_err("unsorted frames");
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn empty_input_has_no_trajectories() {
        assert!(link_points(CpKind::NodeIn, &[], 1.0)
            .expect("empty input is valid")
            .is_empty());
        let input = frames(&[(0.0, &[]), (1.0, &[])]);
        assert!(link_points(CpKind::NodeIn, &input, 1.0)
            .expect("empty frames are valid")
            .is_empty());
    }

    #[test]
    fn epsilon_controls_fragmentation() {
        let input = drifting(6, 0.5);
        let linked = link_points(CpKind::Focus, &input, 0.6).expect("linking");
        assert_eq!(lengths(&linked), vec![6]);
        let fragmented = link_points(CpKind::Focus, &input, 0.4).expect("linking");
        assert_eq!(lengths(&fragmented), vec![1; 6]);
        let times: Vec<f64> = fragmented.iter().map(|t| t.start_time().unwrap()).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn infinite_epsilon_links_everything() {
        let input = frames(&[(0.0, &[[0.0, 0.0]]), (1.0, &[[100.0, -50.0]])]);
        let linked = link_points(CpKind::Saddle, &input, f64::INFINITY).expect("linking");
        assert_eq!(lengths(&linked), vec![2]);
    }

    #[test]
    fn isolated_point_spawns_singleton() {
        let input = frames(&[
            (0.0, &[[0.0, 0.0]]),
            (1.0, &[[0.1, 0.0]]),
            (2.0, &[[0.2, 0.0]]),
            (3.0, &[[0.3, 0.0], [5.0, 5.0]]),
            (4.0, &[[0.4, 0.0]]),
        ]);
        let linked = link_points(CpKind::NodeOut, &input, 0.5).expect("linking");
        assert_eq!(lengths(&linked), vec![5, 1]);
        let singleton = &linked[1];
        assert_eq!(singleton.start_time(), Some(3.0));
        assert_eq!(singleton.samples[0].frame, 3);
        assert_eq!(singleton.samples[0].slot, 1);
    }

    #[test]
    fn vanished_point_closes_and_never_reappears() {
        let mut data: Vec<(f64, Vec<[f64; 2]>)> = (0..5)
            .map(|k| (k as f64, vec![[0.1 * k as f64, 0.0], [3.0, 0.1 * k as f64]]))
            .collect();
        for k in 5..8 {
            data.push((k as f64, vec![[3.0, 0.1 * k as f64]]));
        }
        let input: Vec<_> = data
            .into_iter()
            .map(|(time, positions)| super::PointFrame { time, positions })
            .collect();
        let linked = link_points(CpKind::Focus, &input, 0.5).expect("linking");
        assert_eq!(lengths(&linked), vec![8, 5]);
        let vanished = &linked[1];
        assert_eq!(vanished.end_time(), Some(4.0));
        assert!((vanished.samples[4].x - 0.4).abs() < 1e-12);
    }

    #[test]
    fn greedy_takes_global_minimum_first() {
        // Line A ends at 0.0, line B at 1.0. The point at 0.9 is closest to B,
        // the point at 0.45 is then only within reach of A.
        let input = frames(&[
            (0.0, &[[0.0, 0.0], [1.0, 0.0]]),
            (1.0, &[[0.45, 0.0], [0.9, 0.0]]),
        ]);
        let linked = link_points(CpKind::Saddle, &input, 0.5).expect("linking");
        assert_eq!(lengths(&linked), vec![2, 2]);
        let ends: Vec<[f64; 2]> = linked.iter().map(|t| t.positions().last().unwrap()).collect();
        assert_eq!(ends, vec![[0.45, 0.0], [0.9, 0.0]]);
    }

    #[test]
    fn ties_resolve_by_detection_then_opening_order() {
        let input = frames(&[
            (0.0, &[[-1.0, 0.0], [1.0, 0.0]]),
            (1.0, &[[0.0, 0.0]]),
        ]);
        let linked = link_points(CpKind::Focus, &input, 2.0).expect("linking");
        assert_eq!(lengths(&linked), vec![2, 1]);
        assert_eq!(linked[0].samples[0].x, -1.0);
        assert_eq!(linked[1].samples[0].x, 1.0);
    }

    #[test]
    fn filter_min_len_drops_short_trajectories() {
        let input = frames(&[
            (0.0, &[[0.0, 0.0], [2.0, 0.0]]),
            (1.0, &[[0.1, 0.0], [2.0, 0.1], [7.0, 7.0]]),
            (2.0, &[[0.2, 0.0], [-5.0, 0.0]]),
        ]);
        let foci = link_points(CpKind::Focus, &input, 0.5).expect("linking");
        assert_eq!(lengths(&foci), vec![3, 2, 1, 1]);
        let mut by_kind = BTreeMap::new();
        by_kind.insert(CpKind::Focus, foci.clone());
        by_kind.insert(CpKind::Saddle, Vec::new());
        let set = TrajectorySet::new(0.5, 7, by_kind);

        let filtered = set.filter_min_len(2);
        assert_eq!(filtered.of_kind(CpKind::Focus), &foci[..2]);
        assert!(filtered.of_kind(CpKind::Saddle).is_empty());
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.epsilon(), 0.5);
        assert_eq!(filtered.source_version(), 7);
        assert_eq!(set.filter_min_len(1), set);
        assert!(set.filter_min_len(4).is_empty());
    }

    fn along_x(xs: &[f64]) -> Trajectory {
        Trajectory {
            kind: CpKind::Saddle,
            samples: xs
                .iter()
                .enumerate()
                .map(|(k, &x)| TrajectorySample {
                    x,
                    y: 1.0,
                    time: k as f64,
                    frame: k,
                    slot: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn uniform_smoothing_repeats_end_samples() {
        let smoothed = along_x(&[0.0, 1.0, 2.0, 3.0, 10.0])
            .smoothed(&Smoothing::default())
            .expect("smoothing");
        let xs: Vec<f64> = smoothed.positions().map(|p| p[0]).collect();
        let expected = [1.0 / 3.0, 1.0, 2.0, 5.0, 23.0 / 3.0];
        for (x, e) in xs.iter().zip(expected) {
            assert!((x - e).abs() < 1e-12, "{xs:?}");
        }
        assert!(smoothed.positions().all(|p| (p[1] - 1.0).abs() < 1e-12));
        assert_eq!(smoothed.times().collect::<Vec<_>>(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn gaussian_smoothing_preserves_linear_interior() {
        let xs: Vec<f64> = (0..11).map(|k| 0.5 * k as f64).collect();
        let smoothed = along_x(&xs)
            .smoothed(&Smoothing::Gaussian { sigma: 1.0 })
            .expect("smoothing");
        assert!((smoothed.samples[5].x - 2.5).abs() < 1e-12);
        assert!(smoothed.samples[0].x > 0.0);
        assert_eq!(smoothed.samples[3].frame, 3);
    }

    #[test]
    fn smoothing_rejects_empty_kernels() {
        let trajectory = along_x(&[0.0, 1.0]);
        assert!(trajectory.smoothed(&Smoothing::Uniform { size: 0 }).is_err());
        assert!(trajectory.smoothed(&Smoothing::Gaussian { sigma: 0.0 }).is_err());
        assert!(trajectory.smoothed(&Smoothing::Gaussian { sigma: f64::NAN }).is_err());
    }

    #[test]
    fn smoothed_set_keeps_its_tags() {
        let foci = link_points(CpKind::Focus, &drifting(4, 0.1), 0.5).expect("linking");
        let mut by_kind = BTreeMap::new();
        by_kind.insert(CpKind::Focus, foci);
        let set = TrajectorySet::new(0.5, 3, by_kind);
        let smoothed = set
            .smoothed(&Smoothing::Uniform { size: 1 })
            .expect("smoothing");
        assert_eq!(smoothed, set);
        assert!(set.smoothed(&Smoothing::Uniform { size: 0 }).is_err());
    }

    #[test]
    fn linking_is_reproducible() {
        let input = frames(&[
            (0.0, &[[0.0, 0.0], [1.0, 1.0], [2.0, 0.0]]),
            (0.5, &[[1.0, 0.0], [0.1, 0.1], [2.1, 0.0]]),
            (1.0, &[[1.0, 0.5], [0.2, 0.2]]),
        ]);
        let first = link_points(CpKind::Saddle, &input, 1.0).expect("linking");
        let second = link_points(CpKind::Saddle, &input, 1.0).expect("linking");
        assert_eq!(first, second);
    }
}
