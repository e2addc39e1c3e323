//! 全局类型转换
//!
//! 用于在 OpenCV 的 [Mat] 与本地类型之间转换

use nalgebra::Point2;
use opencv::core::{KeyPoint, Mat, Scalar, Vector, CV_32F, CV_8UC1};
use opencv::prelude::*;

use crate::dataset::Frame;
use crate::feature_tracker::{FrameFeatures, Keypoint, KeypointId};

/// 将 [Mat] 转换为 [Frame]，index 由调用者设置
impl TryFrom<&Mat> for Frame {
    type Error = anyhow::Error;

    fn try_from(mat: &Mat) -> Result<Self, Self::Error> {
        anyhow::ensure!(mat.typ() == CV_8UC1, "expected a grayscale 8-bit image");
        let pixels = if mat.is_continuous() {
            mat.data_bytes()?.to_vec()
        } else {
            mat.try_clone()?.data_bytes()?.to_vec()
        };
        Frame::new(0, mat.cols() as usize, mat.rows() as usize, pixels)
    }
}

/// 将 [Frame] 转换为 [Mat]
impl TryFrom<&Frame> for Mat {
    type Error = anyhow::Error;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let mut mat = Mat::new_rows_cols_with_default(
            frame.height as i32,
            frame.width as i32,
            CV_8UC1,
            Scalar::all(0.0),
        )?;
        mat.data_bytes_mut()?.copy_from_slice(&frame.pixels);
        Ok(mat)
    }
}

/// 由 OpenCV 检测结果构造 [FrameFeatures]，`selected` 为保留的关键点下标
pub fn features_from_cv(
    frame: usize,
    keypoints: &Vector<KeyPoint>,
    descriptors: &Mat,
    selected: &[usize],
) -> anyhow::Result<FrameFeatures> {
    anyhow::ensure!(
        keypoints.is_empty() || descriptors.typ() == CV_32F,
        "expected f32 descriptors"
    );
    let keypoints = selected
        .iter()
        .enumerate()
        .map(|(index, &i)| {
            let kp = keypoints.get(i)?;
            let descriptor = descriptors.at_row::<f32>(i as i32)?.to_vec();
            Ok(Keypoint {
                id: KeypointId { frame, index },
                uv: Point2::new(kp.pt().x as f64, kp.pt().y as f64),
                size: kp.size(),
                angle: kp.angle(),
                descriptor,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(FrameFeatures { frame, keypoints })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_mat_round_trip() {
        let frame = Frame::new(0, 3, 2, vec![0, 1, 2, 3, 4, 5]).unwrap();
        let mat = Mat::try_from(&frame).unwrap();
        assert_eq!(mat.rows(), 2);
        assert_eq!(mat.cols(), 3);
        assert_eq!(*mat.at_2d::<u8>(1, 0).unwrap(), 3);
        let back = Frame::try_from(&mat).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_reject_color_image() {
        let mat = Mat::new_rows_cols_with_default(2, 2, opencv::core::CV_8UC3, Scalar::all(0.0))
            .unwrap();
        assert!(Frame::try_from(&mat).is_err());
    }
}
