//! 特征检测与匹配
//!
//! Each frame is detected once. Its [FrameFeatures] are matched against the
//! next frame with a brute-force L2 search and Lowe's ratio test.

use nalgebra::Point2;

use crate::dataset::Frame;

/// Stable identity of a keypoint: the frame it was detected in and its detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeypointId {
    pub frame: usize,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct Keypoint {
    pub id: KeypointId,
    /// 像素坐标
    pub uv: Point2<f64>,
    pub size: f32,
    pub angle: f32,
    pub descriptor: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct FrameFeatures {
    pub frame: usize,
    pub keypoints: Vec<Keypoint>,
}

impl FrameFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn get(&self, id: KeypointId) -> Option<&Keypoint> {
        if id.frame != self.frame {
            return None;
        }
        self.keypoints.get(id.index)
    }
}

/// A ratio-test survivor. `query` lives in the first image, `train` in the second.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub query: KeypointId,
    pub train: KeypointId,
    pub query_uv: Point2<f64>,
    pub train_uv: Point2<f64>,
    pub distance: f32,
}

pub trait FeatureDetector {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<FrameFeatures>;
}

#[inline]
fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// 对 a 中每个描述子在 b 中找最近的两个，通过比值测试的保留。
///
/// Train ids are not required to be unique.
pub fn match_features(a: &FrameFeatures, b: &FrameFeatures, ratio: f32) -> Vec<Match> {
    if b.len() < 2 {
        return Vec::new();
    }
    a.keypoints
        .iter()
        .filter_map(|query| {
            let mut best = (f32::INFINITY, 0);
            let mut second = f32::INFINITY;
            for (j, train) in b.keypoints.iter().enumerate() {
                let d = squared_distance(&query.descriptor, &train.descriptor);
                if d < best.0 {
                    second = best.0;
                    best = (d, j);
                } else if d < second {
                    second = d;
                }
            }
            let (best_distance, second_distance) = (best.0.sqrt(), second.sqrt());
            if best_distance < ratio * second_distance {
                let train = &b.keypoints[best.1];
                Some(Match {
                    query: query.id,
                    train: train.id,
                    query_uv: query.uv,
                    train_uv: train.uv,
                    distance: best_distance,
                })
            } else {
                None
            }
        })
        .collect()
}

#[cfg(feature = "vision")]
pub use sift::SiftDetector;

#[cfg(feature = "vision")]
mod sift {
    use opencv::core::{KeyPoint, Mat, Ptr, Size, Vector};
    use opencv::features2d::SIFT;
    use opencv::prelude::*;

    use super::{FeatureDetector, FrameFeatures};
    use crate::config::DetectorSettings;
    use crate::dataset::Frame;
    use crate::global_cast::features_from_cv;

    pub struct SiftDetector {
        sift: Ptr<SIFT>,
        settings: DetectorSettings,
    }

    impl SiftDetector {
        pub fn new(settings: DetectorSettings) -> anyhow::Result<Self> {
            Ok(Self {
                sift: SIFT::create_def()?,
                settings,
            })
        }

        /// 按响应值保留最强的 max_features 个，保持检测顺序
        fn strongest(&self, keypoints: &Vector<KeyPoint>) -> Vec<usize> {
            let mut indices: Vec<usize> = (0..keypoints.len()).collect();
            let max_features = self.settings.max_features;
            if max_features == 0 || indices.len() <= max_features {
                return indices;
            }
            let response = |i: usize| keypoints.get(i).map(|kp| kp.response()).unwrap_or(0.0);
            indices.sort_by(|&a, &b| response(b).total_cmp(&response(a)));
            indices.truncate(max_features);
            indices.sort_unstable();
            indices
        }
    }

    impl FeatureDetector for SiftDetector {
        fn detect(&mut self, frame: &Frame) -> anyhow::Result<FrameFeatures> {
            let mut img = Mat::try_from(frame)?;
            if self.settings.equalize {
                // CLAHE 图像均衡化
                let mut clahe = opencv::imgproc::create_clahe(3.0, Size::new(8, 8))?;
                let mut equalized = Mat::default();
                clahe.apply(&img, &mut equalized)?;
                img = equalized;
            }
            let mut keypoints = Vector::<KeyPoint>::new();
            let mut descriptors = Mat::default();
            self.sift
                .detect_and_compute(&img, &Mat::default(), &mut keypoints, &mut descriptors, false)?;
            let selected = self.strongest(&keypoints);
            log::debug!(
                "frame {}: {} keypoints, kept {}",
                frame.index,
                keypoints.len(),
                selected.len()
            );
            features_from_cv(frame.index, &keypoints, &descriptors, &selected)
        }
    }
}
