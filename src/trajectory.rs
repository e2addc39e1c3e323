//! 全局位姿累积
use nalgebra::{Isometry3, Translation3, Vector3};

use crate::config::InitialPose;
use crate::pose_estimator::RelativePose;
use crate::rotation::rotation_vector_to_quaternion;

/// Receives the global pose of every processed frame.
pub trait PoseSink {
    fn emit(&mut self, frame: usize, pose: &Isometry3<f64>) -> anyhow::Result<()>;
}

impl PoseSink for Vec<(usize, Isometry3<f64>)> {
    fn emit(&mut self, frame: usize, pose: &Isometry3<f64>) -> anyhow::Result<()> {
        self.push((frame, *pose));
        Ok(())
    }
}

/// `global * motion`: the camera motion is expressed in the previous camera frame.
#[inline]
pub fn accumulate(global: &Isometry3<f64>, pose: &RelativePose) -> Isometry3<f64> {
    global * pose.motion()
}

pub fn fold<'a>(
    initial: Isometry3<f64>,
    poses: impl IntoIterator<Item = &'a RelativePose>,
) -> Isometry3<f64> {
    poses
        .into_iter()
        .fold(initial, |global, pose| accumulate(&global, pose))
}

#[derive(Debug, Clone)]
pub struct Trajectory {
    global: Isometry3<f64>,
}

impl Trajectory {
    pub fn new(initial: Isometry3<f64>) -> Self {
        Self { global: initial }
    }

    pub fn from_initial_pose(initial: &InitialPose) -> Self {
        let rotation = rotation_vector_to_quaternion(&Vector3::from(initial.rotation));
        let translation = Translation3::from(Vector3::from(initial.position));
        Self::new(Isometry3::from_parts(translation, rotation))
    }

    pub fn global(&self) -> &Isometry3<f64> {
        &self.global
    }

    pub fn accumulate(&mut self, pose: &RelativePose) -> &Isometry3<f64> {
        self.global = accumulate(&self.global, pose);
        &self.global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn poses() -> [RelativePose; 3] {
        [
            RelativePose {
                rotation: Rotation3::from_euler_angles(0.1, -0.2, 0.05),
                translation: Vector3::new(0.3, 0.1, -0.4),
            },
            RelativePose {
                rotation: Rotation3::from_euler_angles(-0.05, 0.15, 0.2),
                translation: Vector3::new(-0.2, 0.6, 0.1),
            },
            RelativePose {
                rotation: Rotation3::from_euler_angles(0.3, 0.0, -0.1),
                translation: Vector3::new(0.0, -0.3, 0.9),
            },
        ]
    }

    #[test]
    fn test_fold_associative() {
        let [p1, p2, p3] = poses();
        let initial = Trajectory::from_initial_pose(&InitialPose {
            rotation: [0.1, 0.2, -0.3],
            position: [20.0, 20.0, 20.0],
        });
        // 点变换依次作用: x3 = P3(P2(P1(x)))
        let then = |a: &RelativePose, b: &RelativePose| RelativePose {
            rotation: b.rotation * a.rotation,
            translation: b.rotation * a.translation + b.translation,
        };
        let sequential = fold(*initial.global(), &[p1, p2, p3]);
        let grouped = fold(*initial.global(), &[then(&p1, &p2), p3]);
        let composed = fold(*initial.global(), &[then(&then(&p1, &p2), &p3)]);
        assert_relative_eq!(sequential, grouped, epsilon = 1e-12);
        assert_relative_eq!(sequential, composed, epsilon = 1e-12);
    }

    #[test]
    fn test_identity_keeps_pose() {
        let mut trajectory = Trajectory::from_initial_pose(&InitialPose {
            rotation: [0.0, 0.0, 0.0],
            position: [1.0, 2.0, 3.0],
        });
        let before = *trajectory.global();
        trajectory.accumulate(&RelativePose::identity());
        assert_eq!(*trajectory.global(), before);
        assert_eq!(before.translation.vector, Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_translation_in_camera_frame() {
        // 先绕 y 轴转 90 度，再沿相机前方移动
        let turn = RelativePose {
            rotation: Rotation3::from_euler_angles(0.0, -std::f64::consts::FRAC_PI_2, 0.0),
            translation: Vector3::zeros(),
        };
        let forward = RelativePose {
            rotation: Rotation3::identity(),
            translation: Vector3::new(0.0, 0.0, -1.0),
        };
        let global = fold(Isometry3::identity(), &[turn, forward]);
        assert_relative_eq!(
            global.translation.vector,
            Vector3::new(1.0, 0.0, 0.0),
            epsilon = 1e-12
        );
    }
}
