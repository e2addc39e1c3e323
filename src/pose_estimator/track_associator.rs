//! 跨帧点关联与尺度校正
//!
//! The cloud of pair `(k-1, k)` and the cloud of pair `(k, k+1)` share the
//! keypoints detected in frame `k`. Moving the older cloud into frame `k` and
//! fitting an affine map onto the newer one measures how much the unit-norm
//! translation of the newer pair inflated or shrank the scene. Applying the
//! inverse map keeps every pair at the scale of the first one.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use nalgebra::{DMatrix, Matrix3, Point3, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

use super::sfm::PointCloud;
use super::{ransac_iterations, RelativePose};
use crate::config::{AssociatorSettings, AFFINE_SAMPLE_SIZE};
use crate::feature_tracker::Match;

/// State handed from one frame pair to the next. `cloud.points[i]` belongs to `matches[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSnapshot {
    pub matches: Vec<Match>,
    pub cloud: PointCloud,
    pub motion: RelativePose,
}

impl TrackSnapshot {
    pub fn new(matches: Vec<Match>, cloud: PointCloud, motion: RelativePose) -> Self {
        debug_assert_eq!(matches.len(), cloud.len());
        Self {
            matches,
            cloud,
            motion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationFailure {
    Disabled,
    TooFewCorrespondences { found: usize },
    /// A snapshot whose cloud does not line up with its matches.
    UnequalCardinality { matches: usize, points: usize },
    NoModel,
    TooFewInliers { found: usize },
    /// Linear part singular or mirroring.
    Degenerate,
}

impl Display for AssociationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "association disabled"),
            Self::TooFewCorrespondences { found } => {
                write!(f, "too few shared points ({})", found)
            }
            Self::UnequalCardinality { matches, points } => {
                write!(f, "{} matches but {} points", matches, points)
            }
            Self::NoModel => write!(f, "no affine model found"),
            Self::TooFewInliers { found } => write!(f, "too few affine inliers ({})", found),
            Self::Degenerate => write!(f, "degenerate affine model"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Association {
    Corrected {
        snapshot: TrackSnapshot,
        scale: f64,
        inliers: usize,
    },
    /// 原样转发当前帧的点云、匹配和位姿
    Uncorrected {
        snapshot: TrackSnapshot,
        reason: AssociationFailure,
    },
}

impl Association {
    pub fn snapshot(&self) -> &TrackSnapshot {
        match self {
            Self::Corrected { snapshot, .. } | Self::Uncorrected { snapshot, .. } => snapshot,
        }
    }

    pub fn into_snapshot(self) -> TrackSnapshot {
        match self {
            Self::Corrected { snapshot, .. } | Self::Uncorrected { snapshot, .. } => snapshot,
        }
    }
}

/// `q = linear * p + translation`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine3 {
    pub linear: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Affine3 {
    #[inline]
    pub fn apply(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.linear * p.coords + self.translation)
    }

    pub fn inverse(&self) -> Option<Self> {
        let linear = self.linear.try_inverse()?;
        Some(Self {
            linear,
            translation: -(linear * self.translation),
        })
    }

    /// Least-squares fit over at least 4 non-coplanar pairs.
    pub fn fit(source: &[Point3<f64>], target: &[Point3<f64>]) -> Option<Self> {
        let n = source.len();
        if n < AFFINE_SAMPLE_SIZE || n != target.len() {
            return None;
        }
        let a = DMatrix::from_fn(n, 4, |i, j| if j < 3 { source[i][j] } else { 1.0 });
        let b = DMatrix::from_fn(n, 3, |i, j| target[i][j]);
        let svd = a.svd(true, true);
        let max_sv = svd.singular_values.max();
        if svd.singular_values.min() <= 1e-9 * max_sv {
            return None;
        }
        let x = svd.solve(&b, 1e-12).ok()?;
        // x 为 4x3：前三行是线性部分的转置，最后一行是平移
        let linear = Matrix3::from_fn(|i, j| x[(j, i)]);
        let translation = Vector3::new(x[(3, 0)], x[(3, 1)], x[(3, 2)]);
        let model = Self {
            linear,
            translation,
        };
        model
            .linear
            .iter()
            .chain(model.translation.iter())
            .all(|v| v.is_finite())
            .then_some(model)
    }
}

/// Median distance of the points to their centroid.
fn median_spread(points: &[Point3<f64>]) -> f64 {
    let centroid = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords)
        / points.len() as f64;
    let mut distances: Vec<f64> = points.iter().map(|p| (p.coords - centroid).norm()).collect();
    distances.sort_by(f64::total_cmp);
    distances[distances.len() / 2]
}

fn affine_inliers(
    model: &Affine3,
    source: &[Point3<f64>],
    target: &[Point3<f64>],
    threshold: f64,
) -> Vec<usize> {
    source
        .iter()
        .zip(target)
        .enumerate()
        .filter(|(_, (p, q))| (model.apply(p) - *q).norm() < threshold)
        .map(|(i, _)| i)
        .collect()
}

#[derive(Debug)]
pub struct TrackAssociator {
    settings: AssociatorSettings,
    rng: StdRng,
}

impl TrackAssociator {
    pub fn new(settings: AssociatorSettings, seed: u64) -> Self {
        Self {
            settings,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Relates `current` to `previous` and rescales it to the accumulated scale.
    pub fn associate(&mut self, previous: &TrackSnapshot, current: TrackSnapshot) -> Association {
        if !self.settings.enabled {
            return Association::Uncorrected {
                snapshot: current,
                reason: AssociationFailure::Disabled,
            };
        }
        match self.correct(previous, &current) {
            Ok((snapshot, scale, inliers)) => Association::Corrected {
                snapshot,
                scale,
                inliers,
            },
            Err(reason) => Association::Uncorrected {
                snapshot: current,
                reason,
            },
        }
    }

    fn correct(
        &mut self,
        previous: &TrackSnapshot,
        current: &TrackSnapshot,
    ) -> Result<(TrackSnapshot, f64, usize), AssociationFailure> {
        // 点云与匹配必须一一对应，否则关联会错位
        for snapshot in [previous, current] {
            if snapshot.matches.len() != snapshot.cloud.len() {
                return Err(AssociationFailure::UnequalCardinality {
                    matches: snapshot.matches.len(),
                    points: snapshot.cloud.len(),
                });
            }
        }

        // 上一对的 train 与当前对的 query 都在第 k 帧，按 KeypointId 关联，保留首次出现
        let mut previous_by_id = HashMap::new();
        for (m, point) in previous.matches.iter().zip(&previous.cloud.points) {
            previous_by_id.entry(m.train).or_insert(*point);
        }
        let mut seen = HashSet::new();
        let mut current_indices = Vec::new();
        let mut source = Vec::new();
        let mut target = Vec::new();
        for (ci, (m, point)) in current
            .matches
            .iter()
            .zip(&current.cloud.points)
            .enumerate()
        {
            if !seen.insert(m.query) {
                continue;
            }
            let (Some(Some(p)), Some(q)) = (previous_by_id.get(&m.query), point) else {
                continue;
            };
            source.push(previous.motion.transform_point(p));
            target.push(*q);
            current_indices.push(ci);
        }

        if source.len() < AFFINE_SAMPLE_SIZE {
            return Err(AssociationFailure::TooFewCorrespondences {
                found: source.len(),
            });
        }

        let (model, inliers) = self
            .fit_affine_ransac(&source, &target)
            .ok_or(AssociationFailure::NoModel)?;
        if inliers.len() <= self.settings.min_inliers {
            return Err(AssociationFailure::TooFewInliers {
                found: inliers.len(),
            });
        }
        let det = model.linear.determinant();
        if !(det > f64::EPSILON) {
            return Err(AssociationFailure::Degenerate);
        }
        let inverse = model.inverse().ok_or(AssociationFailure::Degenerate)?;
        let scale = det.cbrt();

        let matches = inliers
            .iter()
            .map(|&i| current.matches[current_indices[i]].clone())
            .collect();
        let points = inliers
            .iter()
            .map(|&i| Some(inverse.apply(&target[i])))
            .collect();
        let motion = current
            .motion
            .with_translation(current.motion.translation / scale);
        let snapshot = TrackSnapshot::new(matches, PointCloud { points }, motion);
        Ok((snapshot, scale, inliers.len()))
    }

    fn fit_affine_ransac(
        &mut self,
        source: &[Point3<f64>],
        target: &[Point3<f64>],
    ) -> Option<(Affine3, Vec<usize>)> {
        let n = source.len();
        let threshold = self.settings.threshold * median_spread(target);
        let max_iterations = self.settings.max_iterations.max(1);
        let mut adaptive_max = max_iterations;
        let mut best: Option<(Affine3, Vec<usize>)> = None;
        let mut iteration = 0;
        while iteration < adaptive_max {
            iteration += 1;
            let indices = sample(&mut self.rng, n, AFFINE_SAMPLE_SIZE);
            let sample_source: Vec<_> = indices.iter().map(|i| source[i]).collect();
            let sample_target: Vec<_> = indices.iter().map(|i| target[i]).collect();
            let Some(model) = Affine3::fit(&sample_source, &sample_target) else {
                continue;
            };
            let inliers = affine_inliers(&model, source, target, threshold);
            if best
                .as_ref()
                .map_or(true, |(_, best_inliers)| inliers.len() > best_inliers.len())
            {
                adaptive_max = ransac_iterations(
                    self.settings.confidence,
                    inliers.len() as f64 / n as f64,
                    AFFINE_SAMPLE_SIZE,
                    max_iterations,
                );
                best = Some((model, inliers));
            }
        }
        let (model, inliers) = best?;
        log::debug!(
            "affine ransac: {} iterations, {}/{} inliers",
            iteration,
            inliers.len(),
            n
        );

        // 内点重新拟合
        let inlier_source: Vec<_> = inliers.iter().map(|&i| source[i]).collect();
        let inlier_target: Vec<_> = inliers.iter().map(|&i| target[i]).collect();
        match Affine3::fit(&inlier_source, &inlier_target) {
            Some(refined) => {
                let refined_inliers = affine_inliers(&refined, source, target, threshold);
                if refined_inliers.len() >= inliers.len() {
                    Some((refined, refined_inliers))
                } else {
                    Some((model, inliers))
                }
            }
            None => Some((model, inliers)),
        }
    }
}
