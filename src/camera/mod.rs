//! 相机模型
//!
//! Only the pinhole model is needed: frames are assumed undistorted.

mod pinhole_camera;
pub use pinhole_camera::{PinholeCamera, PinholeParameters};

use nalgebra::{Point2, Vector3};

/// 相机的trait
pub trait CameraTrait {
    /// Lifts a pixel onto the normalised image plane `z = 1`.
    fn lift_projective(&self, p: &Point2<f64>) -> Vector3<f64>;
    /// Projects a point in camera coordinates to pixels. `None` behind the camera.
    fn space_to_plane(&self, p: &Vector3<f64>) -> Option<Point2<f64>>;
    /// Focal length used to convert pixel thresholds into normalised units.
    fn focal_length(&self) -> f64;

    /// Normalised `(x, y)` of a pixel.
    #[inline]
    fn normalize(&self, p: &Point2<f64>) -> Point2<f64> {
        let v = self.lift_projective(p);
        Point2::new(v.x / v.z, v.y / v.z)
    }
}

/// 相机参数的trait
pub trait CameraParametersTrait: Sized {
    const CAMERA_TYPE: &'static str;
    #[cfg(feature = "vision")]
    fn read_from_yaml(path: &std::path::Path) -> anyhow::Result<Self>;
    #[cfg(feature = "vision")]
    fn write_to_yaml(&self, path: &std::path::Path) -> anyhow::Result<()>;
}
