//! 旋转表示转换
//!
//! Axis-angle (rotation vector), rotation matrix and unit quaternion conversions used to emit the
//! trajectory. Quaternions are reported as `(x, y, z, w)`.

use std::f64::consts::PI;

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Quaternion, Rotation3, UnitQuaternion, Vector3};

/// Below this angle the Rodrigues coefficients are replaced by their Taylor expansion.
const SMALL_ANGLE: f64 = 1e-6;
/// Distance to π below which the axis is read from the symmetric part of the matrix.
const NEAR_PI: f64 = 1e-5;

/// 反对称矩阵 [v]×
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Exponential map (Rodrigues' formula).
pub fn rotation_vector_to_matrix(rvec: &Vector3<f64>) -> Rotation3<f64> {
    let theta_sq = rvec.norm_squared();
    if theta_sq == 0.0 {
        return Rotation3::identity();
    }
    let theta = theta_sq.sqrt();
    let (a, b) = if theta < SMALL_ANGLE {
        (1.0 - theta_sq / 6.0, 0.5 - theta_sq / 24.0)
    } else {
        (theta.sin() / theta, (1.0 - theta.cos()) / theta_sq)
    };
    let k = skew(rvec);
    Rotation3::from_matrix_unchecked(Matrix3::identity() + k * a + k * k * b)
}

/// Logarithm map, inverse of [rotation_vector_to_matrix]. The angle of the result is in `[0, π]`.
pub fn matrix_to_rotation_vector(rot: &Rotation3<f64>) -> Vector3<f64> {
    let m = rot.matrix();
    let vee = Vector3::new(m[(2, 1)] - m[(1, 2)], m[(0, 2)] - m[(2, 0)], m[(1, 0)] - m[(0, 1)]);
    let cos_theta = ((m.trace() - 1.0) / 2.0).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();

    if theta < SMALL_ANGLE {
        // R ≈ I + [v]×
        return vee * 0.5;
    }
    if PI - theta < NEAR_PI {
        // R ≈ 2nnᵀ - I, the skew part vanishes
        let sym = (m + Matrix3::identity()) * 0.5;
        let (i, _) = (0..3)
            .map(|i| (i, sym[(i, i)]))
            .fold((0, f64::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        let ni = sym[(i, i)].max(0.0).sqrt();
        let mut axis = Vector3::zeros();
        for j in 0..3 {
            axis[j] = if j == i { ni } else { sym[(i, j)] / ni };
        }
        let axis = axis.normalize();
        let axis = if axis.dot(&vee) < 0.0 { -axis } else { axis };
        return axis * theta;
    }
    vee * (theta / (2.0 * theta.sin()))
}

/// Direct exponentiation of a rotation vector into a unit quaternion.
pub fn rotation_vector_to_quaternion(rvec: &Vector3<f64>) -> UnitQuaternion<f64> {
    let theta = rvec.norm();
    if theta == 0.0 {
        return UnitQuaternion::identity();
    }
    let half = theta / 2.0;
    let s = if theta < SMALL_ANGLE {
        0.5 - theta * theta / 48.0
    } else {
        half.sin() / theta
    };
    canonical(Quaternion::new(half.cos(), rvec.x * s, rvec.y * s, rvec.z * s))
}

/// Rotation matrix to unit quaternion, branching on the largest of the trace and the diagonal so
/// the square root is always taken of a value no smaller than 1.
pub fn matrix_to_quaternion(m: &Matrix3<f64>) -> UnitQuaternion<f64> {
    let (m00, m11, m22) = (m[(0, 0)], m[(1, 1)], m[(2, 2)]);
    let trace = m00 + m11 + m22;

    let q = if trace >= m00 && trace >= m11 && trace >= m22 {
        let s = (1.0 + trace).sqrt() * 2.0;
        Quaternion::new(
            0.25 * s,
            (m[(2, 1)] - m[(1, 2)]) / s,
            (m[(0, 2)] - m[(2, 0)]) / s,
            (m[(1, 0)] - m[(0, 1)]) / s,
        )
    } else if m00 >= m11 && m00 >= m22 {
        let s = (1.0 + m00 - m11 - m22).sqrt() * 2.0;
        Quaternion::new(
            (m[(2, 1)] - m[(1, 2)]) / s,
            0.25 * s,
            (m[(0, 1)] + m[(1, 0)]) / s,
            (m[(0, 2)] + m[(2, 0)]) / s,
        )
    } else if m11 >= m22 {
        let s = (1.0 + m11 - m00 - m22).sqrt() * 2.0;
        Quaternion::new(
            (m[(0, 2)] - m[(2, 0)]) / s,
            (m[(0, 1)] + m[(1, 0)]) / s,
            0.25 * s,
            (m[(1, 2)] + m[(2, 1)]) / s,
        )
    } else {
        let s = (1.0 + m22 - m00 - m11).sqrt() * 2.0;
        Quaternion::new(
            (m[(1, 0)] - m[(0, 1)]) / s,
            (m[(0, 2)] + m[(2, 0)]) / s,
            (m[(1, 2)] + m[(2, 1)]) / s,
            0.25 * s,
        )
    };
    canonical(q)
}

pub fn quaternion_to_matrix(q: &UnitQuaternion<f64>) -> Rotation3<f64> {
    let q = q.as_ref().normalize();
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Rotation3::from_matrix_unchecked(Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - z * w),
        2.0 * (x * z + y * w),
        2.0 * (x * y + z * w),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - x * w),
        2.0 * (x * z - y * w),
        2.0 * (y * z + x * w),
        1.0 - 2.0 * (x * x + y * y),
    ))
}

/// `[x, y, z, w]`
#[inline]
pub fn to_xyzw(q: &UnitQuaternion<f64>) -> [f64; 4] {
    let c = q.as_ref().coords;
    [c[0], c[1], c[2], c[3]]
}

/// Roll, pitch, yaw (radians). Pitch is clamped to `[-π/2, π/2]`.
pub fn quaternion_to_euler(q: &UnitQuaternion<f64>) -> (f64, f64, f64) {
    let [x, y, z, w] = to_xyzw(q);
    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
    let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
    (roll, pitch, yaw)
}

/// 组合旋转和平移为 4×4 齐次矩阵
pub fn homogeneous(rot: &Rotation3<f64>, trans: &Vector3<f64>) -> Matrix4<f64> {
    let mut m4 = Matrix4::<f64>::identity();
    m4.fixed_view_mut::<3, 3>(0, 0).copy_from(rot.matrix());
    m4.fixed_view_mut::<3, 1>(0, 3).copy_from(trans);
    m4
}

/// Upper 3×4 block of a homogeneous transform, i.e. a normalised camera projection `[R|t]`.
#[inline]
pub fn projection(m4: &Matrix4<f64>) -> Matrix3x4<f64> {
    m4.fixed_view::<3, 4>(0, 0).into_owned()
}

/// Normalises and picks the `w >= 0` representative of the double cover.
fn canonical(q: Quaternion<f64>) -> UnitQuaternion<f64> {
    let q = if q.w < 0.0 { -q } else { q };
    UnitQuaternion::from_quaternion(q)
}
