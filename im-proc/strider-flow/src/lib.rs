//! Sparse optical flow and corner detection for the strider visual-odometry
//! system.
//!
//! The tracking frontend needs exactly two image-processing primitives:
//!
//! - [`detect`]: a good-features-to-track style corner detector with a
//!   spatial exclusion [`Mask`], used to seed new features on the left image.
//! - [`track`]: a pyramidal sparse Lucas–Kanade tracker that propagates
//!   features from one image to another, honoring per-point initial guesses
//!   (used both for stereo left→right correspondence and for temporal
//!   frame-to-frame correspondence).
//!
//! Both operate on the [`Pyramid`] representation, an `f32` multi-scale copy
//! of a grayscale input image.
#![deny(rust_2018_idioms)]

use serde::{Deserialize, Serialize};

mod detect;
mod lk;
mod pyramid;

pub use crate::detect::{detect, Mask};
pub use crate::lk::track;
pub use crate::pyramid::{GrayImageF32, Pyramid};

fn default_flow_window() -> u32 {
    11
}
fn default_flow_levels() -> usize {
    3
}
fn default_flow_iterations() -> u32 {
    30
}
fn default_flow_epsilon() -> f64 {
    0.01
}
fn default_flow_min_eigenvalue() -> f64 {
    1e-4
}

/// Parameters of the pyramidal Lucas–Kanade tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowConfig {
    /// Side length of the square correlation window, in pixels.
    #[serde(default = "default_flow_window")]
    pub window: u32,
    /// Number of pyramid levels (including the full-resolution level).
    #[serde(default = "default_flow_levels")]
    pub levels: usize,
    /// Maximum refinement iterations per pyramid level.
    #[serde(default = "default_flow_iterations")]
    pub iterations: u32,
    /// Terminate a level once the update step is below this, in pixels.
    #[serde(default = "default_flow_epsilon")]
    pub epsilon: f64,
    /// Reject points whose normalized spatial gradient matrix has a smaller
    /// minimum eigenvalue than this.
    #[serde(default = "default_flow_min_eigenvalue")]
    pub min_eigenvalue: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            window: default_flow_window(),
            levels: default_flow_levels(),
            iterations: default_flow_iterations(),
            epsilon: default_flow_epsilon(),
            min_eigenvalue: default_flow_min_eigenvalue(),
        }
    }
}

fn default_detect_quality() -> f64 {
    0.01
}
fn default_detect_min_distance() -> f64 {
    20.0
}

/// Parameters of the corner detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectConfig {
    /// Accept corners whose response is at least this fraction of the
    /// strongest response in the image.
    #[serde(default = "default_detect_quality")]
    pub quality_level: f64,
    /// Minimum distance between two accepted corners, in pixels.
    #[serde(default = "default_detect_min_distance")]
    pub min_distance: f64,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            quality_level: default_detect_quality(),
            min_distance: default_detect_min_distance(),
        }
    }
}
