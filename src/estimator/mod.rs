//! 估计器
//! 逐帧处理：特征匹配、相对位姿、三角化、尺度校正、全局位姿累积

use nalgebra::Isometry3;

use crate::camera::CameraTrait;
use crate::config::Settings;
use crate::dataset::{Frame, FrameSource};
use crate::feature_tracker::{match_features, FeatureDetector, FrameFeatures};
use crate::pose_estimator::sfm::triangulate_matches;
use crate::pose_estimator::track_associator::{Association, TrackAssociator, TrackSnapshot};
use crate::pose_estimator::{NormalizedPair, PoseEstimate, RelativePose, RelativePoseEstimator};
use crate::rotation::{matrix_to_rotation_vector, quaternion_to_euler};
use crate::trajectory::{PoseSink, Trajectory};

/// Summary of one processed frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame: usize,
    pub matches: usize,
    pub estimate: PoseEstimate,
    /// Set when the association rescaled the translation.
    pub scale: Option<f64>,
    /// The relative pose folded into the trajectory.
    pub motion: RelativePose,
    pub global: Isometry3<f64>,
}

#[derive(Debug)]
pub struct Estimator<Camera, Detector>
where
    Camera: CameraTrait,
    Detector: FeatureDetector,
{
    camera: Camera,
    detector: Detector,
    ratio_test: f32,
    pose_estimator: RelativePoseEstimator,
    associator: TrackAssociator,
    trajectory: Trajectory,
    /// 上一帧的特征
    prev_features: Option<FrameFeatures>,
    /// 上一对帧的匹配、点云和运动
    prev_snapshot: Option<TrackSnapshot>,
}

impl<Camera, Detector> Estimator<Camera, Detector>
where
    Camera: CameraTrait,
    Detector: FeatureDetector,
{
    pub fn new(camera: Camera, detector: Detector, settings: &Settings) -> Self {
        Self {
            camera,
            detector,
            ratio_test: settings.estimator.ratio_test,
            pose_estimator: RelativePoseEstimator::new(settings.estimator.clone()),
            associator: TrackAssociator::new(settings.associator.clone(), settings.estimator.seed),
            trajectory: Trajectory::from_initial_pose(&settings.initial_pose),
            prev_features: None,
            prev_snapshot: None,
        }
    }

    pub fn global_pose(&self) -> &Isometry3<f64> {
        self.trajectory.global()
    }

    /// The first frame only provides features; it returns `None`.
    pub fn process_frame(&mut self, frame: &Frame) -> anyhow::Result<Option<FrameReport>> {
        let features = self.detector.detect(frame)?;
        let Some(prev_features) = self.prev_features.take() else {
            log::info!("frame {}: base frame, {} keypoints", frame.index, features.len());
            self.prev_features = Some(features);
            return Ok(None);
        };
        let matches = match_features(&prev_features, &features, self.ratio_test);
        // 当前帧特征作为下一对的第一帧
        self.prev_features = Some(features);
        let pairs: Vec<NormalizedPair> = matches
            .iter()
            .map(|m| {
                (
                    self.camera.normalize(&m.query_uv),
                    self.camera.normalize(&m.train_uv),
                )
            })
            .collect();

        let estimate = self
            .pose_estimator
            .estimate(&pairs, self.camera.focal_length());
        if let PoseEstimate::Degraded(reason) = &estimate {
            log::warn!("frame {}: {}, assuming no motion", frame.index, reason);
        }
        let pose = estimate.pose();
        let cloud = triangulate_matches(&pairs, &pose);
        log::debug!(
            "frame {}: {}/{} points triangulated",
            frame.index,
            cloud.valid_count(),
            cloud.len()
        );
        let match_count = matches.len();
        let current = TrackSnapshot::new(matches, cloud, pose);

        let (snapshot, scale) = match self.prev_snapshot.take() {
            Some(previous) => match self.associator.associate(&previous, current) {
                Association::Corrected {
                    snapshot,
                    scale,
                    inliers,
                } => {
                    log::info!(
                        "frame {}: scale corrected by {:.4} ({} shared points)",
                        frame.index,
                        scale,
                        inliers
                    );
                    (snapshot, Some(scale))
                }
                Association::Uncorrected { snapshot, reason } => {
                    log::warn!("frame {}: association skipped, {}", frame.index, reason);
                    (snapshot, None)
                }
            },
            None => (current, None),
        };

        let motion = snapshot.motion;
        let global = *self.trajectory.accumulate(&motion);
        self.prev_snapshot = Some(snapshot);

        let (roll, pitch, yaw) = quaternion_to_euler(&global.rotation);
        log::info!(
            "frame {}: {} matches, {} inliers, rotation {:.4?} (rpy {:.3} {:.3} {:.3}), translation {:.4?}",
            frame.index,
            match_count,
            estimate.inlier_count(),
            matrix_to_rotation_vector(&global.rotation.to_rotation_matrix()).as_slice(),
            roll,
            pitch,
            yaw,
            global.translation.vector.as_slice(),
        );

        Ok(Some(FrameReport {
            frame: frame.index,
            matches: match_count,
            estimate,
            scale,
            motion,
            global,
        }))
    }

    /// Processes frame 0 and then `frame_indices` until the source runs dry.
    ///
    /// Every processed frame, the base frame included, is emitted to `sink`.
    pub fn run<Source, Sink>(
        &mut self,
        source: &Source,
        frame_indices: impl IntoIterator<Item = usize>,
        sink: &mut Sink,
    ) -> anyhow::Result<Vec<FrameReport>>
    where
        Source: FrameSource,
        Sink: PoseSink,
    {
        let base = source
            .frame(0)
            .ok_or_else(|| anyhow::anyhow!("cannot read the first frame"))?;
        self.process_frame(&base)?;
        sink.emit(base.index, self.trajectory.global())?;

        let mut reports = Vec::new();
        for index in frame_indices {
            let Some(frame) = source.frame(index) else {
                log::info!("no frame {}, stopping", index);
                break;
            };
            if let Some(report) = self.process_frame(&frame)? {
                sink.emit(report.frame, &report.global)?;
                reports.push(report);
            }
        }
        log::info!("processed {} frames", reports.len() + 1);
        Ok(reports)
    }
}
