//! 单目视觉里程计
//!
//! nalgebra
//! https://docs.rs/nalgebra/latest/nalgebra/
//!
//! opencv (feature `vision`)
//! https://docs.rs/opencv/latest/opencv/all.html

pub mod camera;
pub mod config;
pub mod dataset;
pub mod estimator;
pub mod feature_tracker; // 特征检测与匹配
#[cfg(feature = "vision")]
pub mod global_cast;
pub mod pose_estimator;
pub mod rotation;
pub mod save;
pub mod trajectory;

#[cfg(test)]
pub(crate) mod test_helpers;
