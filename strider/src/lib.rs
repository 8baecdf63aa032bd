//! Stereo visual-odometry tracking frontend.
//!
//! Given a stream of rectified stereo pairs from a calibrated rig, the
//! [`Frontend`] estimates the 6-DoF rig pose at every frame, promotes
//! informative frames to keyframes, triangulates new landmarks from stereo
//! correspondence and hands keyframes and landmarks to the shared [`Map`].
//! A [`Backend`] thread refines the active keyframe window by local bundle
//! adjustment whenever the map changes.
//!
//! The per-frame pipeline is: corner detection on the left image
//! ([`strider_flow::detect`]), sparse optical flow for stereo and temporal
//! correspondence ([`strider_flow::track`]), linear triangulation
//! ([`strider_mvg::triangulate`]) and a robust motion-only pose refinement
//! ([`optimizer::estimate_pose`]).
//!
//! See [`System`] for the assembled pipeline.
#![deny(rust_2018_idioms)]

mod error;
pub use crate::error::{Error, Result};

mod config;
pub use crate::config::TrackingConfig;

mod frame;
pub use crate::frame::{Feature, Frame, FrameId, KeyframeId};

mod map_point;
pub use crate::map_point::{ImageSide, MapPoint, MapPointId, Observation};

mod map;
pub use crate::map::{Map, MapSnapshot};

pub mod optimizer;

mod backend;
pub use crate::backend::Backend;

mod viewer;
pub use crate::viewer::{TraceViewer, Viewer};

mod frontend;
pub use crate::frontend::{Frontend, TrackingStatus};

mod system;
pub use crate::system::System;
