//! Critical point records and their time-ordered collection.

use crate::error::{Result, TopologyError};
use crate::simplify::{simplify_frame, SimplifyMode};
use crate::trajectory::{link_points, validate_epsilon, PointFrame, TrajectorySet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Topological type of a critical point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CpKind {
    /// Focus rotating counter-clockwise (`∂Vy/∂x ≥ 0`).
    #[serde(rename = "foc")]
    Focus,
    /// Focus rotating clockwise (`∂Vy/∂x < 0`).
    #[serde(rename = "foc_c")]
    FocusContrarotating,
    /// Stable node.
    #[serde(rename = "node_i")]
    NodeIn,
    /// Unstable node.
    #[serde(rename = "node_o")]
    NodeOut,
    #[serde(rename = "sadd")]
    Saddle,
}

impl CpKind {
    pub const ALL: [CpKind; 5] = [
        CpKind::Focus,
        CpKind::FocusContrarotating,
        CpKind::NodeIn,
        CpKind::NodeOut,
        CpKind::Saddle,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            CpKind::Focus => "foc",
            CpKind::FocusContrarotating => "foc_c",
            CpKind::NodeIn => "node_i",
            CpKind::NodeOut => "node_o",
            CpKind::Saddle => "sadd",
        }
    }

    /// Poincaré–Bendixson index of an isolated point of this type.
    pub fn index(self) -> i32 {
        match self {
            CpKind::Saddle => -1,
            _ => 1,
        }
    }
}

impl fmt::Display for CpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for CpKind {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self> {
        CpKind::ALL
            .into_iter()
            .find(|kind| kind.tag() == s)
            .ok_or_else(|| TopologyError::UnknownKind(s.to_string()))
    }
}

/// How a critical point position was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Single zero of the bilinear interpolant.
    Exact,
    /// Mean of several zeros found in the same cell.
    Averaged,
    /// Center of the flagged cell, no root solve requested.
    CellCenter,
    /// Center of the flagged cell because the root solve was degenerate.
    Fallback,
    /// Weighted center of several points merged by simplification.
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CriticalPoint {
    pub x: f64,
    pub y: f64,
    pub time: f64,
    pub kind: CpKind,
    /// Incoming then outgoing separatrix directions, saddles only.
    pub orientations: Option<[[f64; 2]; 2]>,
    pub confidence: Confidence,
}

/// Critical points detected on one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePoints {
    time: f64,
    points: Vec<CriticalPoint>,
}

impl FramePoints {
    pub fn new(time: f64) -> Self {
        Self {
            time,
            points: Vec::new(),
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn points(&self) -> &[CriticalPoint] {
        &self.points
    }

    /// Appends a point, stamping it with the frame time.
    pub fn push(&mut self, mut point: CriticalPoint) {
        point.time = self.time;
        self.points.push(point);
    }

    pub fn by_kind(&self, kind: CpKind) -> impl Iterator<Item = &CriticalPoint> {
        self.points.iter().filter(move |p| p.kind == kind)
    }

    pub fn count(&self, kind: CpKind) -> usize {
        self.by_kind(kind).count()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn retain(&mut self, mut keep: impl FnMut(&CriticalPoint) -> bool) {
        self.points.retain(|p| keep(p));
    }
}

#[derive(Debug, Clone)]
struct CachedTrajectories {
    version: u64,
    set: TrajectorySet,
}

/// Frames of critical points kept sorted by strictly increasing time.
///
/// Trajectories are a derived artifact: they are cached together with the
/// collection version and epsilon used to build them, and every mutation of
/// the frames bumps the version and drops the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "SerializedFrames")]
pub struct CriticalPointCollection {
    frames: Vec<FramePoints>,
    #[serde(skip)]
    version: u64,
    #[serde(skip)]
    cache: Option<CachedTrajectories>,
}

/// Wire form of a collection; deserialization goes through `add_frame`.
#[derive(Deserialize)]
struct SerializedFrames {
    frames: Vec<FramePoints>,
}

impl TryFrom<SerializedFrames> for CriticalPointCollection {
    type Error = TopologyError;

    fn try_from(value: SerializedFrames) -> Result<Self> {
        Self::from_frames(value.frames)
    }
}

impl PartialEq for CriticalPointCollection {
    fn eq(&self, other: &Self) -> bool {
        self.frames == other.frames
    }
}

impl CriticalPointCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_frames(frames: impl IntoIterator<Item = FramePoints>) -> Result<Self> {
        let mut collection = Self::new();
        for frame in frames {
            collection.add_frame(frame)?;
        }
        Ok(collection)
    }

    pub fn frames(&self) -> &[FramePoints] {
        &self.frames
    }

    pub fn times(&self) -> Vec<f64> {
        self.frames.iter().map(FramePoints::time).collect()
    }

    pub fn frame_at_time(&self, time: f64) -> Option<&FramePoints> {
        self.frames.iter().find(|f| f.time == time)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn point_count(&self) -> usize {
        self.frames.iter().map(FramePoints::len).sum()
    }

    pub fn points_of_kind(&self, kind: CpKind) -> impl Iterator<Item = &CriticalPoint> {
        self.frames.iter().flat_map(move |f| f.by_kind(kind))
    }

    /// Incremented by every mutation of the frames.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn invalidate(&mut self) {
        self.version += 1;
        self.cache = None;
    }

    /// Inserts a frame at its place in time. Every point is stamped with
    /// the frame time.
    pub fn add_frame(&mut self, mut frame: FramePoints) -> Result<()> {
        if !frame.time.is_finite() {
            return Err(TopologyError::InvalidConfig(format!(
                "frame time must be finite, got {}",
                frame.time
            )));
        }
        if self.frame_at_time(frame.time).is_some() {
            return Err(TopologyError::DuplicateTime(frame.time));
        }
        let time = frame.time;
        for point in &mut frame.points {
            point.time = time;
        }
        let at = self.frames.partition_point(|f| f.time < time);
        self.frames.insert(at, frame);
        self.invalidate();
        Ok(())
    }

    pub fn remove_frame(&mut self, time: f64) -> Result<FramePoints> {
        let index = self
            .frames
            .iter()
            .position(|f| f.time == time)
            .ok_or_else(|| TopologyError::MissingFrame(format!("time {time}")))?;
        self.remove_frame_at(index)
    }

    pub fn remove_frame_at(&mut self, index: usize) -> Result<FramePoints> {
        if index >= self.frames.len() {
            return Err(TopologyError::MissingFrame(format!("index {index}")));
        }
        let frame = self.frames.remove(index);
        self.invalidate();
        Ok(frame)
    }

    /// Adds every frame of `other`; fails without modifying `self` if any
    /// time is already present.
    pub fn merge(&mut self, other: CriticalPointCollection) -> Result<()> {
        if let Some(frame) = other
            .frames
            .iter()
            .find(|f| self.frame_at_time(f.time).is_some())
        {
            return Err(TopologyError::DuplicateTime(frame.time));
        }
        for frame in other.frames {
            self.add_frame(frame)?;
        }
        Ok(())
    }

    /// Keeps only frames within `time` and points within `x`/`y`
    /// (inclusive ranges, `None` means unbounded).
    pub fn crop(
        &mut self,
        x: Option<(f64, f64)>,
        y: Option<(f64, f64)>,
        time: Option<(f64, f64)>,
    ) -> Result<()> {
        for (name, range) in [("x", x), ("y", y), ("time", time)] {
            if let Some((lo, hi)) = range {
                if !(lo <= hi) {
                    return Err(TopologyError::InvalidConfig(format!(
                        "crop range for {name} must satisfy min <= max, got ({lo}, {hi})"
                    )));
                }
            }
        }
        let inside = |range: Option<(f64, f64)>, v: f64| range.map_or(true, |(lo, hi)| v >= lo && v <= hi);
        self.frames.retain(|f| inside(time, f.time));
        for frame in &mut self.frames {
            frame.retain(|p| inside(x, p.x) && inside(y, p.y));
        }
        self.invalidate();
        Ok(())
    }

    /// Copy with every frame simplified by [`simplify_frame`].
    pub fn simplify(&self, dist_min: f64, mode: SimplifyMode) -> Result<CriticalPointCollection> {
        let frames = self
            .frames
            .iter()
            .map(|frame| simplify_frame(frame, dist_min, mode))
            .collect::<Result<Vec<_>>>()?;
        Self::from_frames(frames)
    }

    /// Links the points of every type into trajectories and caches them.
    pub fn compute_trajectories(&mut self, epsilon: f64) -> Result<&TrajectorySet> {
        let set = self.link(epsilon)?;
        let cached = self.cache.insert(CachedTrajectories {
            version: self.version,
            set,
        });
        Ok(&cached.set)
    }

    /// Cached trajectories, if computed since the last mutation.
    pub fn trajectories(&self) -> Option<&TrajectorySet> {
        self.cache
            .as_ref()
            .filter(|c| c.version == self.version)
            .map(|c| &c.set)
    }

    /// Cached trajectories when they were built with the same epsilon,
    /// otherwise freshly computed ones.
    pub fn trajectories_or_compute(&mut self, epsilon: f64) -> Result<&TrajectorySet> {
        let fresh = self
            .trajectories()
            .is_some_and(|set| set.epsilon() == epsilon);
        if !fresh {
            self.compute_trajectories(epsilon)?;
        }
        self.trajectories()
            .ok_or(TopologyError::TrajectoriesNotComputed("reading them"))
    }

    /// Epsilon of the current trajectories, if any.
    pub fn current_epsilon(&self) -> Option<f64> {
        self.trajectories().map(TrajectorySet::epsilon)
    }

    /// Drops trajectories shorter than `min_len` together with their points,
    /// then relinks the surviving points with the same epsilon.
    pub fn clean_trajectories(&mut self, min_len: usize) -> Result<()> {
        let set = self
            .trajectories()
            .ok_or(TopologyError::TrajectoriesNotComputed("cleaning"))?;
        let epsilon = set.epsilon();
        let keep: HashSet<(usize, CpKind, usize)> = set
            .iter()
            .filter(|t| t.len() >= min_len)
            .flat_map(|t| t.samples.iter().map(move |s| (s.frame, t.kind, s.slot)))
            .collect();
        let before = self.point_count();

        for (frame_idx, frame) in self.frames.iter_mut().enumerate() {
            let mut slots: BTreeMap<CpKind, usize> = BTreeMap::new();
            frame.retain(|p| {
                let slot = slots.entry(p.kind).or_insert(0);
                let kept = keep.contains(&(frame_idx, p.kind, *slot));
                *slot += 1;
                kept
            });
        }
        debug!(
            min_len,
            removed = before - self.point_count(),
            "cleaned trajectories"
        );
        self.invalidate();
        self.compute_trajectories(epsilon)?;
        Ok(())
    }

    fn link(&self, epsilon: f64) -> Result<TrajectorySet> {
        validate_epsilon(epsilon)?;
        let mut by_kind = BTreeMap::new();
        for kind in CpKind::ALL {
            let frames: Vec<PointFrame> = self
                .frames
                .iter()
                .map(|f| PointFrame {
                    time: f.time,
                    positions: f.by_kind(kind).map(|p| [p.x, p.y]).collect(),
                })
                .collect();
            by_kind.insert(kind, link_points(kind, &frames, epsilon)?);
        }
        Ok(TrajectorySet::new(epsilon, self.version, by_kind))
    }
}
