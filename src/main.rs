use std::path::PathBuf;

use anyhow::Context;

use vo_rs::camera::PinholeCamera;
use vo_rs::config::Settings;
use vo_rs::dataset::{GroundTruth, ImageSequence};
use vo_rs::estimator::Estimator;
use vo_rs::feature_tracker::SiftDetector;
use vo_rs::save::TrajectoryWriter;

const DEFAULT_SETTINGS: &str = "configs/settings.json";

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_nanos()
        .init();

    let settings_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS));
    let settings = if settings_path.exists() {
        Settings::load(&settings_path)?
    } else {
        log::warn!(
            "settings {} not found, using defaults",
            settings_path.display()
        );
        Settings::default()
    };
    log::info!("settings: {:?}", settings);

    let source = ImageSequence::new(
        &settings.images_folder,
        &settings.image_prefix,
        &settings.image_extension,
    )?;
    let groundtruth = settings
        .groundtruth_file
        .as_deref()
        .map(GroundTruth::load)
        .transpose()?;
    if let Some(groundtruth) = &groundtruth {
        log::info!("ground truth: {} entries", groundtruth.len());
    }

    let camera = PinholeCamera::from_settings(&settings.camera)?;
    let detector = SiftDetector::new(settings.detector.clone())
        .context("failed to create the SIFT detector")?;
    let mut writer = TrajectoryWriter::create(&settings.predicted_file, groundtruth)?;

    let mut estimator = Estimator::new(camera, detector, &settings);
    estimator.run(&source, settings.frame_indices(source.len()), &mut writer)?;
    writer.flush()?;

    let global = estimator.global_pose();
    log::info!(
        "final pose: translation {:?}, rotation {:?}",
        global.translation.vector.as_slice(),
        global.rotation.scaled_axis().as_slice()
    );
    log::info!("trajectory written to {}", settings.predicted_file.display());
    Ok(())
}
