//! TUM 格式真值: `timestamp tx ty tz qx qy qz qw`
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GroundTruthEntry {
    pub timestamp: f64,
    pub tx: f64,
    pub ty: f64,
    pub tz: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
    pub qw: f64,
}

/// One entry per video frame, indexed by frame number.
#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    pub entries: Vec<GroundTruthEntry>,
}

impl GroundTruth {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open ground truth {}", path.display()))?;
        Self::from_reader(file)
            .with_context(|| format!("failed to parse ground truth {}", path.display()))
    }

    pub fn from_reader<R: Read>(reader: R) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(reader);
        let entries = reader
            .deserialize()
            .collect::<Result<Vec<GroundTruthEntry>, _>>()?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 超出范围时取最后一个时间戳
    pub fn timestamp_for(&self, index: usize) -> Option<f64> {
        let last = self.entries.len().checked_sub(1)?;
        Some(self.entries[index.min(last)].timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# ground truth trajectory
# timestamp tx ty tz qx qy qz qw
1305031452.7916 1.2334 -0.0113 1.6941 0.7907 0.4393 -0.1770 -0.3879
1305031452.8316 1.2544 -0.0213 1.6941 0.7907 0.4393 -0.1770 -0.3879
1305031452.8716 1.2744 -0.0313 1.7041 0.7907 0.4393 -0.1770 -0.3879
";

    #[test]
    fn test_parse_tum() {
        let groundtruth = GroundTruth::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(groundtruth.len(), 3);
        assert_eq!(groundtruth.entries[1].tx, 1.2544);
        assert_eq!(groundtruth.entries[2].qw, -0.3879);
    }

    #[test]
    fn test_timestamp_clamped() {
        let groundtruth = GroundTruth::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(groundtruth.timestamp_for(1), Some(1305031452.8316));
        assert_eq!(groundtruth.timestamp_for(100), Some(1305031452.8716));
        assert_eq!(GroundTruth::default().timestamp_for(0), None);
    }

    #[test]
    fn test_reject_short_line() {
        assert!(GroundTruth::from_reader("1.0 2.0 3.0\n".as_bytes()).is_err());
    }
}
