//! 三角化
use nalgebra::{Matrix3x4, Matrix4, Point2, Point3};

use super::RelativePose;
use crate::config::HOMOGENEOUS_EPS;
use crate::rotation::{homogeneous, projection};

/// 3D points in the first camera of a pair, one slot per match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<Option<Point3<f64>>>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.points.iter().flatten().count()
    }
}

/// Linear triangulation of one correspondence in normalised coordinates.
///
/// Returns `None` for a point at infinity or when the rays carry no parallax.
pub fn triangulate_point(
    point_i: &Point2<f64>,
    point_j: &Point2<f64>,
    pose_i: &Matrix3x4<f64>,
    pose_j: &Matrix3x4<f64>,
) -> Option<Point3<f64>> {
    let row0 = point_i.x * pose_i.row(2) - pose_i.row(0);
    let row1 = point_i.y * pose_i.row(2) - pose_i.row(1);
    let row2 = point_j.x * pose_j.row(2) - pose_j.row(0);
    let row3 = point_j.y * pose_j.row(2) - pose_j.row(1);
    let design_matrix = Matrix4::<f64>::from_rows(&[row0, row1, row2, row3]);

    let svd = nalgebra::SVD::new(design_matrix, false, true);
    // 秩不足 3 时（无视差）解不唯一
    if svd.singular_values[2] < HOMOGENEOUS_EPS * svd.singular_values[0] {
        return None;
    }
    let tri_pt = svd.v_t?.row(3).into_owned();
    let w = tri_pt[3];
    if w.abs() < HOMOGENEOUS_EPS {
        return None;
    }
    let point = Point3::new(tri_pt[0] / w, tri_pt[1] / w, tri_pt[2] / w);
    point.coords.iter().all(|x| x.is_finite()).then_some(point)
}

/// 以第一帧相机为原点 `[I|0]`，第二帧为 `[R|t]` 三角化所有匹配点
pub fn triangulate_matches(pairs: &[(Point2<f64>, Point2<f64>)], pose: &RelativePose) -> PointCloud {
    let pose_i = Matrix3x4::identity();
    let pose_j = projection(&homogeneous(&pose.rotation, &pose.translation));
    let points = pairs
        .iter()
        .map(|(p1, p2)| triangulate_point(p1, p2, &pose_i, &pose_j))
        .collect();
    PointCloud { points }
}
