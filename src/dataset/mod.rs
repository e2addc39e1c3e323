//! 数据集处理
//!
//! Frames are read on demand by index. A missing frame ends the sequence.
mod groundtruth;
#[cfg(feature = "vision")]
mod image_sequence;

pub use groundtruth::{GroundTruth, GroundTruthEntry};
#[cfg(feature = "vision")]
pub use image_sequence::ImageSequence;

/// Grayscale image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: usize,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(index: usize, width: usize, height: usize, pixels: Vec<u8>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            pixels.len() == width * height,
            "frame {} has {} pixels, expected {}x{}",
            index,
            pixels.len(),
            width,
            height
        );
        Ok(Self {
            index,
            width,
            height,
            pixels,
        })
    }
}

pub trait FrameSource {
    /// 读取第 index 帧，读取失败返回 None
    fn frame(&self, index: usize) -> Option<Frame>;
    /// Number of frames the source claims to have.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
