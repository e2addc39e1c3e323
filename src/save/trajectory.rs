use std::io::Write;
use std::path::Path;

use anyhow::Context;
use nalgebra::{Isometry3, Matrix3};
use serde::Serialize;

use crate::dataset::GroundTruth;
use crate::rotation::{matrix_to_quaternion, to_xyzw};
use crate::trajectory::PoseSink;

/// 一行 TUM 轨迹: `timestamp tx ty tz qx qy qz qw`
#[derive(Debug, Serialize)]
struct TumRecord {
    timestamp: f64,
    tx: f64,
    ty: f64,
    tz: f64,
    qx: f64,
    qy: f64,
    qz: f64,
    qw: f64,
}

impl TumRecord {
    /// 坐标轴转换到真值坐标系 (x, -y, -z)
    fn new(timestamp: f64, pose: &Isometry3<f64>) -> Self {
        let flip = Matrix3::from_diagonal(&nalgebra::Vector3::new(1.0, -1.0, -1.0));
        let t = flip * pose.translation.vector;
        let rotation = flip * pose.rotation.to_rotation_matrix().matrix() * flip;
        let [qx, qy, qz, qw] = to_xyzw(&matrix_to_quaternion(&rotation));
        Self {
            timestamp,
            tx: t.x,
            ty: t.y,
            tz: t.z,
            qx,
            qy,
            qz,
            qw,
        }
    }
}

/// Writes the predicted trajectory in the TUM format, one line per processed frame.
pub struct TrajectoryWriter<W: Write> {
    writer: csv::Writer<W>,
    groundtruth: Option<GroundTruth>,
}

impl TrajectoryWriter<std::fs::File> {
    pub fn create(path: &Path, groundtruth: Option<GroundTruth>) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self::new(file, groundtruth))
    }
}

impl<W: Write> TrajectoryWriter<W> {
    pub fn new(writer: W, groundtruth: Option<GroundTruth>) -> Self {
        let writer = csv::WriterBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .from_writer(writer);
        Self {
            writer,
            groundtruth,
        }
    }

    /// 真值时间戳，超出范围取最后一个；没有真值时用帧号
    fn timestamp(&self, frame: usize) -> f64 {
        self.groundtruth
            .as_ref()
            .and_then(|gt| gt.timestamp_for(frame))
            .unwrap_or(frame as f64)
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> anyhow::Result<W> {
        self.writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("failed to flush trajectory: {}", err.error()))
    }
}

impl<W: Write> PoseSink for TrajectoryWriter<W> {
    fn emit(&mut self, frame: usize, pose: &Isometry3<f64>) -> anyhow::Result<()> {
        let record = TumRecord::new(self.timestamp(frame), pose);
        self.writer.serialize(record)?;
        Ok(())
    }
}
