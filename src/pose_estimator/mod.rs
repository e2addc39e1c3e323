//! 相对位姿估计
//! 通过两帧之间的匹配点估计本质矩阵，并恢复旋转和平移方向

pub mod sfm;
pub mod track_associator;

use std::fmt::Display;

use nalgebra::{DMatrix, Isometry3, Matrix3, Point2, Point3, Rotation3, Translation3, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

use crate::config::*;
use sfm::triangulate_point;

/// Normalised image coordinates of one match: (first image, second image).
pub type NormalizedPair = (Point2<f64>, Point2<f64>);

/// Maps points of the first camera into the second: `x2 = R * x1 + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelativePose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl RelativePose {
    pub fn identity() -> Self {
        Self {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
        }
    }

    #[inline]
    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.rotation * point + self.translation
    }

    /// Point transform as an isometry.
    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            self.rotation.into(),
        )
    }

    /// 相机运动，即点变换的逆，表示在第一帧相机坐标系中
    pub fn motion(&self) -> Isometry3<f64> {
        self.isometry().inverse()
    }

    pub fn with_translation(&self, translation: Vector3<f64>) -> Self {
        Self {
            rotation: self.rotation,
            translation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeReason {
    InsufficientMatches { found: usize },
    NoModel,
    CheiralityFailed,
}

impl Display for DegradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientMatches { found } => {
                write!(f, "insufficient matches ({} < {})", found, MIN_POSE_MATCHES)
            }
            Self::NoModel => write!(f, "no essential matrix found"),
            Self::CheiralityFailed => write!(f, "no pose places points in front of both cameras"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoseEstimate {
    /// `inliers` are indices into the input matches.
    Estimated {
        pose: RelativePose,
        inliers: Vec<usize>,
    },
    /// 视为无运动
    Degraded(DegradeReason),
}

impl PoseEstimate {
    pub fn pose(&self) -> RelativePose {
        match self {
            Self::Estimated { pose, .. } => *pose,
            Self::Degraded(_) => RelativePose::identity(),
        }
    }

    pub fn inlier_count(&self) -> usize {
        match self {
            Self::Estimated { inliers, .. } => inliers.len(),
            Self::Degraded(_) => 0,
        }
    }
}

/// Number of RANSAC iterations needed to draw one all-inlier sample with the given confidence.
pub(crate) fn ransac_iterations(
    confidence: f64,
    inlier_ratio: f64,
    sample_size: usize,
    max_iterations: usize,
) -> usize {
    let p_fail = 1.0 - inlier_ratio.powi(sample_size as i32);
    if p_fail <= f64::EPSILON {
        return 1;
    }
    if p_fail >= 1.0 {
        return max_iterations;
    }
    let k = (1.0 - confidence).ln() / p_fail.ln();
    if k.is_finite() {
        (k.ceil() as usize).clamp(1, max_iterations)
    } else {
        max_iterations
    }
}

/// Hartley 归一化：平移到质心，平均距离缩放到 sqrt(2)
fn hartley_normalize(points: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| {
        acc + Vector3::new(p.x, p.y, 0.0)
    }) / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - centroid.x).powi(2) + (p.y - centroid.y).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let transform = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );
    let normalized = points
        .iter()
        .map(|p| Point2::new(scale * (p.x - centroid.x), scale * (p.y - centroid.y)))
        .collect();
    (normalized, transform)
}

/// Linear essential matrix from at least 4 pairs, rank 2 enforced.
///
/// With fewer than 8 pairs the solution is the least-squares one of an underdetermined system.
fn fit_essential(pairs: &[NormalizedPair]) -> Option<Matrix3<f64>> {
    let (points_a, t_a) = hartley_normalize(&pairs.iter().map(|p| p.0).collect::<Vec<_>>());
    let (points_b, t_b) = hartley_normalize(&pairs.iter().map(|p| p.1).collect::<Vec<_>>());

    // x2^T E x1 = 0，不足 9 行时补零使 V^T 为 9x9
    let mut a = DMatrix::<f64>::zeros(pairs.len().max(9), 9);
    for (row, (pa, pb)) in points_a.iter().zip(&points_b).enumerate() {
        let (x1, y1, x2, y2) = (pa.x, pa.y, pb.x, pb.y);
        let constraint = [x2 * x1, x2 * y1, x2, y2 * x1, y2 * y1, y2, x1, y1, 1.0];
        for (col, value) in constraint.into_iter().enumerate() {
            a[(row, col)] = value;
        }
    }
    let v_t = nalgebra::SVD::new(a, false, true).v_t?;
    let e_vec = v_t.row(v_t.nrows() - 1);
    let e = Matrix3::from_row_slice(e_vec.transpose().as_slice());

    let e = t_b.transpose() * e * t_a;
    let svd = nalgebra::SVD::new(e, true, true);
    let mut singular = svd.singular_values;
    singular[2] = 0.0;
    let e = svd.u? * Matrix3::from_diagonal(&singular) * svd.v_t?;
    let norm = e.norm();
    if norm < f64::EPSILON || !norm.is_finite() {
        return None;
    }
    Some(e / norm)
}

/// Sampson distance in normalised coordinates, squared.
pub fn sampson_error(e: &Matrix3<f64>, pair: &NormalizedPair) -> f64 {
    let x1 = Vector3::new(pair.0.x, pair.0.y, 1.0);
    let x2 = Vector3::new(pair.1.x, pair.1.y, 1.0);
    let ex1 = e * x1;
    let etx2 = e.transpose() * x2;
    let denom = ex1.x.powi(2) + ex1.y.powi(2) + etx2.x.powi(2) + etx2.y.powi(2);
    if denom < 1e-30 {
        return f64::MAX;
    }
    let num = x2.dot(&ex1);
    num * num / denom
}

fn score_inliers(e: &Matrix3<f64>, pairs: &[NormalizedPair], threshold: f64) -> Vec<usize> {
    pairs
        .iter()
        .enumerate()
        .filter(|(_, pair)| sampson_error(e, pair) < threshold)
        .map(|(i, _)| i)
        .collect()
}

/// Two rotations and the translation direction encoded in an essential matrix.
pub fn decompose_essential(
    e: &Matrix3<f64>,
) -> Option<(Rotation3<f64>, Rotation3<f64>, Vector3<f64>)> {
    let svd = nalgebra::SVD::new(*e, true, true);
    let mut u = svd.u?;
    let mut v_t = svd.v_t?;
    if u.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    if v_t.determinant() < 0.0 {
        v_t.row_mut(2).neg_mut();
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let mut r1 = Rotation3::from_matrix_unchecked(u * w * v_t);
    let mut r2 = Rotation3::from_matrix_unchecked(u * w.transpose() * v_t);
    r1.renormalize();
    r2.renormalize();
    let t = u.column(2).into_owned();
    Some((r1, r2, t))
}

/// Number of pairs whose rays are aligned by `rotation` alone within `angle` radians.
fn rotation_support(rotation: &Rotation3<f64>, pairs: &[NormalizedPair], angle: f64) -> usize {
    let cos_threshold = angle.cos();
    pairs
        .iter()
        .filter(|(p1, p2)| {
            let ray1 = rotation * Vector3::new(p1.x, p1.y, 1.0).normalize();
            let ray2 = Vector3::new(p2.x, p2.y, 1.0).normalize();
            ray1.dot(&ray2) >= cos_threshold
        })
        .count()
}

/// 三角化后在两个相机前方的点数
fn cheirality_support(pose: &RelativePose, pairs: &[NormalizedPair]) -> usize {
    let pose_i = nalgebra::Matrix3x4::identity();
    let pose_j = crate::rotation::projection(&crate::rotation::homogeneous(
        &pose.rotation,
        &pose.translation,
    ));
    pairs
        .iter()
        .filter_map(|(p1, p2)| triangulate_point(p1, p2, &pose_i, &pose_j))
        .filter(|point| point.z > 0.0 && pose.transform_point(point).z > 0.0)
        .count()
}

/// RANSAC 本质矩阵估计与位姿恢复
#[derive(Debug)]
pub struct RelativePoseEstimator {
    settings: EstimatorSettings,
    rng: StdRng,
}

impl RelativePoseEstimator {
    pub fn new(settings: EstimatorSettings) -> Self {
        let rng = StdRng::seed_from_u64(settings.seed);
        Self { settings, rng }
    }

    pub fn estimate(&mut self, pairs: &[NormalizedPair], focal_length: f64) -> PoseEstimate {
        if pairs.len() < MIN_POSE_MATCHES {
            return PoseEstimate::Degraded(DegradeReason::InsufficientMatches {
                found: pairs.len(),
            });
        }
        let pixel_angle = self.settings.ransac_threshold / focal_length;
        let Some((essential, inliers)) = self.find_essential(pairs, pixel_angle * pixel_angle)
        else {
            return PoseEstimate::Degraded(DegradeReason::NoModel);
        };
        let Some((r1, r2, t)) = decompose_essential(&essential) else {
            return PoseEstimate::Degraded(DegradeReason::NoModel);
        };
        let inlier_pairs: Vec<NormalizedPair> = inliers.iter().map(|&i| pairs[i]).collect();

        // 纯旋转：一个旋转即可解释绝大部分内点
        let required = (ROTATION_ONLY_RATIO * inlier_pairs.len() as f64).ceil() as usize;
        let rotation_only = [r1, r2]
            .into_iter()
            .map(|r| (rotation_support(&r, &inlier_pairs, pixel_angle), r))
            .filter(|(support, _)| *support >= required)
            .max_by_key(|(support, _)| *support);
        if let Some((support, rotation)) = rotation_only {
            log::debug!(
                "rotation-only motion: {}/{} inliers explained",
                support,
                inlier_pairs.len()
            );
            return PoseEstimate::Estimated {
                pose: RelativePose {
                    rotation,
                    translation: Vector3::zeros(),
                },
                inliers,
            };
        }

        let candidates = [(r1, t), (r1, -t), (r2, t), (r2, -t)];
        let best = candidates
            .into_iter()
            .map(|(rotation, translation)| {
                let pose = RelativePose {
                    rotation,
                    translation,
                };
                (cheirality_support(&pose, &inlier_pairs), pose)
            })
            .max_by_key(|(support, _)| *support);
        match best {
            Some((support, pose)) if support > 0 => {
                log::debug!(
                    "cheirality: {}/{} inliers in front of both cameras",
                    support,
                    inlier_pairs.len()
                );
                PoseEstimate::Estimated { pose, inliers }
            }
            _ => PoseEstimate::Degraded(DegradeReason::CheiralityFailed),
        }
    }

    /// Best essential matrix and its inlier indices.
    fn find_essential(
        &mut self,
        pairs: &[NormalizedPair],
        threshold: f64,
    ) -> Option<(Matrix3<f64>, Vec<usize>)> {
        let n = pairs.len();
        if n < ESSENTIAL_SAMPLE_SIZE {
            let e = fit_essential(pairs)?;
            let inliers = score_inliers(&e, pairs, threshold);
            return (!inliers.is_empty()).then_some((e, inliers));
        }

        let max_iterations = self.settings.ransac_max_iterations.max(1);
        let mut adaptive_max = max_iterations;
        let mut best: Option<(Matrix3<f64>, Vec<usize>)> = None;
        let mut iteration = 0;
        while iteration < adaptive_max {
            iteration += 1;
            let subset: Vec<NormalizedPair> = sample(&mut self.rng, n, ESSENTIAL_SAMPLE_SIZE)
                .iter()
                .map(|i| pairs[i])
                .collect();
            let Some(e) = fit_essential(&subset) else {
                continue;
            };
            let inliers = score_inliers(&e, pairs, threshold);
            if best
                .as_ref()
                .map_or(true, |(_, best_inliers)| inliers.len() > best_inliers.len())
            {
                log::trace!("ransac iteration {}: {} inliers", iteration, inliers.len());
                adaptive_max = ransac_iterations(
                    self.settings.ransac_confidence,
                    inliers.len() as f64 / n as f64,
                    ESSENTIAL_SAMPLE_SIZE,
                    max_iterations,
                );
                best = Some((e, inliers));
            }
        }
        let (e, inliers) = best?;
        if inliers.len() < ESSENTIAL_SAMPLE_SIZE {
            return (!inliers.is_empty()).then_some((e, inliers));
        }

        // 在内点上重新拟合，内点不减少时采用
        let inlier_pairs: Vec<NormalizedPair> = inliers.iter().map(|&i| pairs[i]).collect();
        if let Some(refined) = fit_essential(&inlier_pairs) {
            let refined_inliers = score_inliers(&refined, pairs, threshold);
            if refined_inliers.len() >= inliers.len() {
                log::debug!(
                    "essential matrix: {} iterations, {}/{} inliers",
                    iteration,
                    refined_inliers.len(),
                    n
                );
                return Some((refined, refined_inliers));
            }
        }
        log::debug!(
            "essential matrix: {} iterations, {}/{} inliers",
            iteration,
            inliers.len(),
            n
        );
        Some((e, inliers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::skew;
    use crate::test_helpers::*;
    use approx::assert_relative_eq;

    fn estimator() -> RelativePoseEstimator {
        RelativePoseEstimator::new(EstimatorSettings::default())
    }

    #[test]
    fn test_insufficient_matches_identity() {
        let pose = RelativePose {
            rotation: Rotation3::from_euler_angles(0.0, 0.1, 0.0),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let pairs = normalized_pairs(&random_landmarks(3, 2), &pose);
        let estimate = estimator().estimate(&pairs, FOCAL_LENGTH);
        assert_eq!(
            estimate,
            PoseEstimate::Degraded(DegradeReason::InsufficientMatches { found: 3 })
        );
        let identity = estimate.pose();
        assert_eq!(*identity.rotation.matrix(), Matrix3::identity());
        assert_eq!(identity.translation, Vector3::zeros());
        assert_eq!(estimator().estimate(&[], FOCAL_LENGTH).pose(), identity);
    }

    #[test]
    fn test_recover_synthetic_motion() {
        let pose = RelativePose {
            rotation: Rotation3::from_euler_angles(0.05, -0.15, 0.02),
            translation: Vector3::new(0.6, -0.1, 0.2),
        };
        let pairs = normalized_pairs(&random_landmarks(80, 3), &pose);
        let estimate = estimator().estimate(&pairs, FOCAL_LENGTH);
        let PoseEstimate::Estimated { pose: found, inliers } = estimate else {
            panic!("expected an estimate, got {:?}", estimate);
        };
        assert_eq!(inliers.len(), pairs.len());
        assert!(rotation_error(&found.rotation, &pose.rotation) < 1e-6);
        assert_relative_eq!(found.translation.norm(), 1.0, epsilon = 1e-9);
        let direction = pose.translation.normalize();
        assert!(found.translation.angle(&direction) < 1e-2);
    }

    #[test]
    fn test_outliers_rejected() {
        let pose = RelativePose {
            rotation: Rotation3::from_euler_angles(0.0, 0.1, 0.0),
            translation: Vector3::new(-0.5, 0.0, 0.1),
        };
        let mut pairs = normalized_pairs(&random_landmarks(60, 4), &pose);
        // 交换部分匹配作为外点
        for i in (0..12).step_by(2) {
            let (a, b) = (pairs[i].1, pairs[i + 1].1);
            pairs[i].1 = b;
            pairs[i + 1].1 = a;
        }
        let estimate = estimator().estimate(&pairs, FOCAL_LENGTH);
        let PoseEstimate::Estimated { pose: found, inliers } = estimate else {
            panic!("expected an estimate");
        };
        assert!((12..60).all(|i| inliers.contains(&i)));
        assert!(inliers.len() < 54);
        assert!(rotation_error(&found.rotation, &pose.rotation) < 1e-6);
        assert!(found.translation.angle(&pose.translation.normalize()) < 1e-2);
    }

    #[test]
    fn test_rotation_only() {
        let pose = RelativePose {
            rotation: Rotation3::from_euler_angles(0.0, -10f64.to_radians(), 0.0),
            translation: Vector3::zeros(),
        };
        let pairs = normalized_pairs(&random_landmarks(40, 5), &pose);
        let PoseEstimate::Estimated { pose: found, .. } = estimator().estimate(&pairs, FOCAL_LENGTH)
        else {
            panic!("expected an estimate");
        };
        assert!(rotation_error(&found.rotation, &pose.rotation) < 1e-6);
        assert_eq!(found.translation, Vector3::zeros());
    }

    #[test]
    fn test_decomposed_rotations_orthonormal() {
        let pose = RelativePose {
            rotation: Rotation3::from_euler_angles(0.05, -0.15, 0.02),
            translation: Vector3::new(0.6, -0.1, 0.2),
        };
        let e = skew(&pose.translation.normalize()) * pose.rotation.matrix();
        let (r1, r2, t) = decompose_essential(&e).unwrap();
        for r in [r1, r2] {
            let m = r.matrix();
            assert_relative_eq!(m.transpose() * m, Matrix3::identity(), epsilon = 1e-14);
            assert_relative_eq!(m.determinant(), 1.0, epsilon = 1e-14);
        }
        assert!(
            rotation_error(&r1, &pose.rotation) < 1e-9 || rotation_error(&r2, &pose.rotation) < 1e-9
        );
        assert_relative_eq!(t.cross(&pose.translation).norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_seeded_runs_repeat() {
        let pose = RelativePose {
            rotation: Rotation3::from_euler_angles(0.02, 0.05, 0.0),
            translation: Vector3::new(0.3, 0.2, 0.1),
        };
        let pairs = normalized_pairs(&random_landmarks(30, 6), &pose);
        let a = estimator().estimate(&pairs, FOCAL_LENGTH);
        let b = estimator().estimate(&pairs, FOCAL_LENGTH);
        assert_eq!(a, b);
    }

    #[test]
    fn test_motion_is_inverse() {
        let pose = RelativePose {
            rotation: Rotation3::from_euler_angles(0.1, 0.2, 0.3),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };
        let point = Point3::new(0.5, -0.5, 4.0);
        let moved = pose.transform_point(&point);
        assert_relative_eq!(pose.motion() * moved, point, epsilon = 1e-12);
    }

    #[test]
    fn test_ransac_iterations() {
        assert_eq!(ransac_iterations(0.999, 1.0, 8, 1000), 1);
        assert_eq!(ransac_iterations(0.999, 0.0, 8, 1000), 1000);
        let k = ransac_iterations(0.99, 0.5, 4, 500);
        // ln(0.01) / ln(1 - 1/16) = 71.4
        assert_eq!(k, 72);
    }
}
