//! Camera geometry and multi-view geometry types and algorithms for the
//! [strider](../strider/index.html) stereo visual-odometry system.
//!
//! This crate provides the geometric substrate of the tracking frontend:
//!
//! - Rigid transforms are [`nalgebra::Isometry3`]; [`se3`] adds the SE(3)
//!   exponential used for Lie-algebra pose updates.
//! - [`Camera`]: a pinhole camera with a fixed rig extrinsic and stereo
//!   baseline, mapping between pixel, normalized-camera and world frames.
//! - [`triangulate`]: linear triangulation of a world point from two or more
//!   calibrated views.
//!
//! ## Coordinate systems
//!
//! - **World frame**: global 3D coordinates.
//! - **Rig frame**: the moving stereo rig; a frame pose is the world→rig
//!   transform.
//! - **Camera frame**: X→right, Y→down, Z→forward; each camera holds the
//!   fixed rig→camera extrinsic (identity for the left camera).
//! - **Pixel coordinates**: origin at top-left, X→right, Y→down.
#![deny(rust_2018_idioms)]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeomError {
    #[error("not enough points")]
    NotEnoughPoints,
    #[error("SVD failed")]
    SvdFailed,
    #[error("degenerate geometry")]
    DegenerateGeometry,
    #[error("invalid camera parameters: {0}")]
    InvalidCameraParameters(&'static str),
}

pub type Result<T> = std::result::Result<T, GeomError>;

pub mod se3;

mod camera;
pub use crate::camera::Camera;

mod triangulate;
pub use crate::triangulate::triangulate;
