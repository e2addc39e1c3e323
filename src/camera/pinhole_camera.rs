use nalgebra::{Point2, Vector3};

#[cfg(feature = "vision")]
use opencv::core::{FileNodeTraitConst, FileStorageTrait, FileStorageTraitConst};

use super::{CameraParametersTrait, CameraTrait};
use crate::config::CameraSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct PinholeParameters {
    pub camera_name: String,
    // size
    pub image_width: i32,
    pub image_height: i32,
    // intrinsic
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl PinholeParameters {
    pub fn from_focal(focal_length: f64, principal_point: (f64, f64)) -> Self {
        Self {
            camera_name: "camera".to_string(),
            image_width: 0,
            image_height: 0,
            fx: focal_length,
            fy: focal_length,
            cx: principal_point.0,
            cy: principal_point.1,
        }
    }
}

impl CameraParametersTrait for PinholeParameters {
    const CAMERA_TYPE: &'static str = "PINHOLE";

    #[cfg(feature = "vision")]
    fn read_from_yaml(path: &std::path::Path) -> anyhow::Result<Self> {
        let path_str = path.to_string_lossy();
        let fs = opencv::core::FileStorage::new(
            &path_str,
            opencv::core::FileStorage_Mode::READ as i32,
            "utf-8",
        )?;
        anyhow::ensure!(fs.is_opened()?, "cannot open camera file {}", path_str);

        let model_type = fs.get("model_type")?;
        if !model_type.empty()? {
            let model_type = model_type.to_string()?;
            anyhow::ensure!(
                model_type == Self::CAMERA_TYPE,
                "model type {} is not pinhole",
                model_type
            );
        }
        // image
        let camera_name = fs.get("camera_name")?.to_string()?;
        let image_width = fs.get("image_width")?.to_i32()?;
        let image_height = fs.get("image_height")?.to_i32()?;
        // intrinsic
        let projection_parameters = fs.get("projection_parameters")?;
        let fx = projection_parameters.get("fx")?.to_f64()?;
        let fy = projection_parameters.get("fy")?.to_f64()?;
        let cx = projection_parameters.get("cx")?.to_f64()?;
        let cy = projection_parameters.get("cy")?.to_f64()?;
        anyhow::ensure!(fx > 0.0 && fy > 0.0, "focal length must be positive");

        Ok(Self {
            camera_name,
            image_width,
            image_height,
            fx,
            fy,
            cx,
            cy,
        })
    }

    #[cfg(feature = "vision")]
    fn write_to_yaml(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let mut fs = opencv::core::FileStorage::new(
            &path.to_string_lossy(),
            opencv::core::FileStorage_Mode::WRITE as i32,
            "utf-8",
        )?;

        fs.write_str("model_type", Self::CAMERA_TYPE)?;
        fs.write_str("camera_name", &self.camera_name)?;
        fs.write_i32("image_width", self.image_width)?;
        fs.write_i32("image_height", self.image_height)?;
        fs.start_write_struct("projection_parameters", opencv::core::FileNode_MAP, "")?;
        fs.write_f64("fx", self.fx)?;
        fs.write_f64("fy", self.fy)?;
        fs.write_f64("cx", self.cx)?;
        fs.write_f64("cy", self.cy)?;
        fs.end_write_struct()?;
        fs.release()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PinholeCamera {
    pub parameters: PinholeParameters,
    inv_k11: f64,
    inv_k13: f64,
    inv_k22: f64,
    inv_k23: f64,
}

impl PinholeCamera {
    pub fn new(parameters: PinholeParameters) -> Self {
        let inv_k11 = 1.0 / parameters.fx;
        let inv_k13 = -parameters.cx / parameters.fx;
        let inv_k22 = 1.0 / parameters.fy;
        let inv_k23 = -parameters.cy / parameters.fy;
        Self {
            parameters,
            inv_k11,
            inv_k13,
            inv_k22,
            inv_k23,
        }
    }

    pub fn from_focal(focal_length: f64, principal_point: (f64, f64)) -> Self {
        Self::new(PinholeParameters::from_focal(focal_length, principal_point))
    }

    /// 相机文件优先于配置中的焦距和主点
    pub fn from_settings(settings: &CameraSettings) -> anyhow::Result<Self> {
        match &settings.camera_file {
            Some(camera_file) => Self::from_camera_file(camera_file),
            None => Ok(Self::from_focal(
                settings.focal_length,
                settings.principal_point,
            )),
        }
    }

    #[cfg(feature = "vision")]
    fn from_camera_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let parameters = PinholeParameters::read_from_yaml(path)?;
        log::info!("camera parameters: {:?}", parameters);
        Ok(Self::new(parameters))
    }

    #[cfg(not(feature = "vision"))]
    fn from_camera_file(path: &std::path::Path) -> anyhow::Result<Self> {
        anyhow::bail!(
            "reading camera file {} needs the vision feature",
            path.display()
        )
    }
}

impl CameraTrait for PinholeCamera {
    fn lift_projective(&self, p: &Point2<f64>) -> Vector3<f64> {
        Vector3::new(
            self.inv_k11 * p.x + self.inv_k13,
            self.inv_k22 * p.y + self.inv_k23,
            1.0,
        )
    }

    fn space_to_plane(&self, p: &Vector3<f64>) -> Option<Point2<f64>> {
        if p.z <= 0.0 {
            return None;
        }
        Some(Point2::new(
            self.parameters.fx * p.x / p.z + self.parameters.cx,
            self.parameters.fy * p.y / p.z + self.parameters.cy,
        ))
    }

    fn focal_length(&self) -> f64 {
        0.5 * (self.parameters.fx + self.parameters.fy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_lift_inverts_projection() {
        let camera = PinholeCamera::from_focal(525.0, (319.5, 239.5));
        let point = Vector3::new(0.3, -0.2, 4.0);
        let pixel = camera.space_to_plane(&point).unwrap();
        let ray = camera.lift_projective(&pixel);
        assert_relative_eq!(ray, point / point.z, epsilon = 1e-12);
        assert!(camera.space_to_plane(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_principal_point_is_optical_axis() {
        let camera = PinholeCamera::from_focal(500.0, (320.0, 240.0));
        let ray = camera.lift_projective(&Point2::new(320.0, 240.0));
        assert_eq!(ray, Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(camera.focal_length(), 500.0);
    }

    #[cfg(feature = "vision")]
    #[test]
    fn test_yaml_round_trip() {
        let path = std::env::temp_dir().join("vo_rs_pinhole_round_trip.yaml");
        let parameters = PinholeParameters {
            camera_name: "cam0".to_string(),
            image_width: 640,
            image_height: 480,
            fx: 458.654,
            fy: 457.296,
            cx: 367.215,
            cy: 248.375,
        };
        parameters.write_to_yaml(&path).unwrap();
        let read = PinholeParameters::read_from_yaml(&path).unwrap();
        assert_eq!(read.camera_name, parameters.camera_name);
        assert_eq!(read.image_width, 640);
        assert_relative_eq!(read.fx, parameters.fx, epsilon = 1e-9);
        assert_relative_eq!(read.cy, parameters.cy, epsilon = 1e-9);
        let _ = std::fs::remove_file(path);
    }
}
