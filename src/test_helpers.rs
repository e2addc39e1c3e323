use nalgebra::{Isometry3, Point2, Point3, Rotation3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::camera::{CameraTrait, PinholeCamera};
use crate::config::{FOCAL_LENGTH, PRINCIPAL_POINT};
use crate::dataset::{Frame, FrameSource};
use crate::feature_tracker::{FeatureDetector, FrameFeatures, Keypoint, KeypointId};
use crate::pose_estimator::{NormalizedPair, RelativePose};
use crate::rotation::matrix_to_rotation_vector;

/// Points in front of a camera at the origin: `|x|, |y| <= 3`, `4 <= z <= 10`.
pub(crate) fn random_landmarks(n: usize, seed: u64) -> Vec<Point3<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Point3::new(
                rng.gen_range(-3.0..3.0),
                rng.gen_range(-3.0..3.0),
                rng.gen_range(4.0..10.0),
            )
        })
        .collect()
}

/// Noise-free normalised observations of `landmarks` (given in the first camera).
pub(crate) fn normalized_pairs(
    landmarks: &[Point3<f64>],
    pose: &RelativePose,
) -> Vec<NormalizedPair> {
    landmarks
        .iter()
        .map(|p| {
            let q = pose.transform_point(p);
            (Point2::new(p.x / p.z, p.y / p.z), Point2::new(q.x / q.z, q.y / q.z))
        })
        .collect()
}

/// Angle of the rotation between `a` and `b`, through the clamped logarithm map.
pub(crate) fn rotation_error(a: &Rotation3<f64>, b: &Rotation3<f64>) -> f64 {
    matrix_to_rotation_vector(&(a.inverse() * b)).norm()
}

/// Landmarks seen by a moving camera. `cameras[k]` is the camera-to-world pose of frame `k`.
#[derive(Debug, Clone)]
pub(crate) struct SyntheticScene {
    pub landmarks: Vec<Point3<f64>>,
    pub cameras: Vec<Isometry3<f64>>,
    pub camera: PinholeCamera,
}

impl SyntheticScene {
    pub fn new(landmarks: Vec<Point3<f64>>, cameras: Vec<Isometry3<f64>>) -> Self {
        Self {
            landmarks,
            cameras,
            camera: PinholeCamera::from_focal(FOCAL_LENGTH, PRINCIPAL_POINT),
        }
    }

    pub fn detector(&self) -> SyntheticDetector {
        SyntheticDetector {
            scene: self.clone(),
        }
    }
}

impl FrameSource for SyntheticScene {
    fn frame(&self, index: usize) -> Option<Frame> {
        (index < self.cameras.len()).then(|| Frame {
            index,
            width: 1,
            height: 1,
            pixels: vec![0],
        })
    }

    fn len(&self) -> usize {
        self.cameras.len()
    }
}

/// Projects every landmark; the descriptor is the one-hot landmark number.
pub(crate) struct SyntheticDetector {
    scene: SyntheticScene,
}

impl FeatureDetector for SyntheticDetector {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<FrameFeatures> {
        let world_to_camera = self
            .scene
            .cameras
            .get(frame.index)
            .ok_or_else(|| anyhow::anyhow!("no camera for frame {}", frame.index))?
            .inverse();
        let n = self.scene.landmarks.len();
        let keypoints = self
            .scene
            .landmarks
            .iter()
            .enumerate()
            .filter_map(|(landmark, p)| {
                let p = world_to_camera * p;
                let uv = self.scene.camera.space_to_plane(&p.coords)?;
                let mut descriptor = vec![0.0; n];
                descriptor[landmark] = 1.0;
                Some((uv, descriptor))
            })
            .enumerate()
            .map(|(index, (uv, descriptor))| Keypoint {
                id: KeypointId {
                    frame: frame.index,
                    index,
                },
                uv,
                size: 1.0,
                angle: 0.0,
                descriptor,
            })
            .collect();
        Ok(FrameFeatures {
            frame: frame.index,
            keypoints,
        })
    }
}
