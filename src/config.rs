use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Lowe ratio between best and second best descriptor distance.
pub const RATIO_TEST: f32 = 0.75;
/// 少于该匹配数量时不估计位姿，返回单位位姿。
pub const MIN_POSE_MATCHES: usize = 4;
/// Minimal sample of the linear essential matrix solver.
pub const ESSENTIAL_SAMPLE_SIZE: usize = 8;
pub const RANSAC_CONFIDENCE: f64 = 0.999;
/// Epipolar inlier threshold in pixels.
pub const RANSAC_THRESHOLD: f64 = 1.0;
pub const RANSAC_MAX_ITERATIONS: usize = 1000;
/// Fraction of inliers a single rotation has to explain to be treated as rotation-only motion.
pub const ROTATION_ONLY_RATIO: f64 = 0.9;
/// Homogeneous coordinate below which a triangulated point is at infinity.
pub const HOMOGENEOUS_EPS: f64 = 1e-10;

/// Minimal sample of the 3D affine solver.
pub const AFFINE_SAMPLE_SIZE: usize = 4;
/// Association is only applied with strictly more inliers than this.
pub const MIN_ASSOCIATION_INLIERS: usize = 6;
pub const AFFINE_CONFIDENCE: f64 = 0.99;
/// Affine inlier threshold, relative to the median spread of the target points.
pub const AFFINE_THRESHOLD: f64 = 0.05;
pub const AFFINE_MAX_ITERATIONS: usize = 500;

pub const FOCAL_LENGTH: f64 = 525.0;
pub const PRINCIPAL_POINT: (f64, f64) = (319.5, 239.5);

/// 每隔几帧处理一次
pub const SKIP_FRAMES: usize = 5;
/// 开始时跳过的帧数
pub const SKIP_START: usize = 5;

/// Camera intrinsics, either inline or read from a pinhole YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub focal_length: f64,
    pub principal_point: (f64, f64),
    /// Takes precedence over the inline values when set.
    pub camera_file: Option<PathBuf>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            focal_length: FOCAL_LENGTH,
            principal_point: PRINCIPAL_POINT,
            camera_file: None,
        }
    }
}

/// Pose of the tracked object relative to the camera at frame 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialPose {
    /// Axis-angle, radians.
    pub rotation: [f64; 3],
    pub position: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// 0 keeps every detected keypoint.
    pub max_features: usize,
    /// CLAHE 图像均衡化
    pub equalize: bool,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            max_features: 2000,
            equalize: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorSettings {
    pub ratio_test: f32,
    pub ransac_confidence: f64,
    pub ransac_threshold: f64,
    pub ransac_max_iterations: usize,
    pub seed: u64,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            ratio_test: RATIO_TEST,
            ransac_confidence: RANSAC_CONFIDENCE,
            ransac_threshold: RANSAC_THRESHOLD,
            ransac_max_iterations: RANSAC_MAX_ITERATIONS,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociatorSettings {
    pub enabled: bool,
    pub min_inliers: usize,
    pub threshold: f64,
    pub confidence: f64,
    pub max_iterations: usize,
}

impl Default for AssociatorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_inliers: MIN_ASSOCIATION_INLIERS,
            threshold: AFFINE_THRESHOLD,
            confidence: AFFINE_CONFIDENCE,
            max_iterations: AFFINE_MAX_ITERATIONS,
        }
    }
}

/// Run settings, read from a JSON file. Missing fields fall back to the defaults above.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub images_folder: PathBuf,
    pub image_prefix: String,
    pub image_extension: String,
    /// Frames are read as `<images_folder>/<image_prefix><index>.<image_extension>`.
    pub skip_start: usize,
    pub skip_frames: usize,
    pub groundtruth_file: Option<PathBuf>,
    pub predicted_file: PathBuf,
    pub camera: CameraSettings,
    pub initial_pose: InitialPose,
    pub detector: DetectorSettings,
    pub estimator: EstimatorSettings,
    pub associator: AssociatorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            images_folder: PathBuf::from("images"),
            image_prefix: "image".to_string(),
            image_extension: "png".to_string(),
            skip_start: SKIP_START,
            skip_frames: SKIP_FRAMES,
            groundtruth_file: None,
            predicted_file: PathBuf::from("predicted.txt"),
            camera: CameraSettings::default(),
            initial_pose: InitialPose {
                rotation: [0.0, 0.0, 0.0],
                position: [20.0, 20.0, 20.0],
            },
            detector: DetectorSettings::default(),
            estimator: EstimatorSettings::default(),
            associator: AssociatorSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid settings {}", path.display()))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let settings: Settings = serde_json::from_str(text)?;
        anyhow::ensure!(settings.skip_frames > 0, "skip_frames must be positive");
        anyhow::ensure!(
            settings.camera.focal_length > 0.0,
            "focal_length must be positive"
        );
        Ok(settings)
    }

    /// Frame indices processed after the base frame 0.
    pub fn frame_indices(&self, frame_count: usize) -> impl Iterator<Item = usize> {
        (self.skip_start.max(1)..frame_count).step_by(self.skip_frames.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings() {
        let settings = Settings::from_json(
            r#"{ "skip_frames": 2, "camera": { "focal_length": 300.0 }, "estimator": { "seed": 7 } }"#,
        )
        .unwrap();
        assert_eq!(settings.skip_frames, 2);
        assert_eq!(settings.skip_start, SKIP_START);
        assert_eq!(settings.camera.focal_length, 300.0);
        assert_eq!(settings.camera.principal_point, PRINCIPAL_POINT);
        assert_eq!(settings.estimator.seed, 7);
        assert_eq!(settings.estimator.ratio_test, RATIO_TEST);
        assert_eq!(settings.initial_pose.position, [20.0, 20.0, 20.0]);
    }

    #[test]
    fn test_reject_zero_step() {
        assert!(Settings::from_json(r#"{ "skip_frames": 0 }"#).is_err());
    }

    #[test]
    fn test_frame_indices() {
        let settings = Settings::default();
        let indices: Vec<_> = settings.frame_indices(21).collect();
        assert_eq!(indices, vec![5, 10, 15, 20]);

        let settings = Settings {
            skip_start: 0,
            skip_frames: 1,
            ..Default::default()
        };
        let indices: Vec<_> = settings.frame_indices(3).collect();
        assert_eq!(indices, vec![1, 2]);
    }
}
