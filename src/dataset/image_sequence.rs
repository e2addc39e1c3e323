use std::path::{Path, PathBuf};

use opencv::imgcodecs;
use opencv::prelude::*;

use super::{Frame, FrameSource};

/// Numbered image files `<folder>/<prefix><index>.<extension>`, starting at 0.
#[derive(Debug)]
pub struct ImageSequence {
    folder: PathBuf,
    prefix: String,
    extension: String,
    len: usize,
}

impl ImageSequence {
    pub fn new(folder: &Path, prefix: &str, extension: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(
            folder.is_dir(),
            "image folder {} does not exist",
            folder.display()
        );
        let mut sequence = Self {
            folder: folder.to_path_buf(),
            prefix: prefix.to_string(),
            extension: extension.to_string(),
            len: 0,
        };
        // 连续编号的图像数量
        while sequence.path(sequence.len).is_file() {
            sequence.len += 1;
        }
        log::info!(
            "found {} images in {}",
            sequence.len,
            sequence.folder.display()
        );
        Ok(sequence)
    }

    pub fn path(&self, index: usize) -> PathBuf {
        self.folder
            .join(format!("{}{}.{}", self.prefix, index, self.extension))
    }

    fn read(&self, index: usize) -> anyhow::Result<Frame> {
        let path = self.path(index);
        let img = imgcodecs::imread(&path.to_string_lossy(), imgcodecs::IMREAD_GRAYSCALE)?;
        anyhow::ensure!(!img.empty(), "cannot read image {}", path.display());
        let mut frame = Frame::try_from(&img)?;
        frame.index = index;
        Ok(frame)
    }
}

impl FrameSource for ImageSequence {
    fn frame(&self, index: usize) -> Option<Frame> {
        match self.read(index) {
            Ok(frame) => Some(frame),
            Err(err) => {
                log::warn!("{:#}", err);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Mat, Scalar, Vector, CV_8UC1};

    #[test]
    fn test_read_numbered_images() {
        let folder = std::env::temp_dir().join("vo_rs_image_sequence");
        std::fs::create_dir_all(&folder).unwrap();
        for index in 0..2 {
            let img = Mat::new_rows_cols_with_default(4, 6, CV_8UC1, Scalar::all(index as f64 * 100.0))
                .unwrap();
            let path = folder.join(format!("image{}.png", index));
            imgcodecs::imwrite(&path.to_string_lossy(), &img, &Vector::new()).unwrap();
        }
        let _ = std::fs::remove_file(folder.join("image2.png"));

        let sequence = ImageSequence::new(&folder, "image", "png").unwrap();
        assert_eq!(sequence.len(), 2);
        let frame = sequence.frame(1).unwrap();
        assert_eq!(frame.index, 1);
        assert_eq!((frame.width, frame.height), (6, 4));
        assert!(frame.pixels.iter().all(|&p| p == 100));
        assert!(sequence.frame(2).is_none());
    }

    #[test]
    fn test_missing_folder() {
        assert!(ImageSequence::new(Path::new("/nonexistent/vo_rs"), "image", "png").is_err());
    }
}
