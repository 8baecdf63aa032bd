use std::sync::Arc;

use image::GrayImage;
use nalgebra::{Isometry3, Point2};
use serde::{Deserialize, Serialize};

use crate::map_point::MapPointId;
use crate::{Error, Result};

/// Identifies one stereo capture. Assigned monotonically by the ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u64);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a keyframe. Assigned monotonically by the [`Map`](crate::Map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyframeId(pub u64);

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 2D observation in one image of one frame.
///
/// The landmark link is weak: it stores an id that the map may no longer
/// resolve, in which case the feature simply reports no landmark.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub position: Point2<f64>,
    pub on_left_image: bool,
    pub map_point: Option<MapPointId>,
    /// Scratch flag used by the pose optimizer; always false outside of it.
    pub is_outlier: bool,
}

impl Feature {
    pub fn new_left(position: Point2<f64>) -> Self {
        Self {
            position,
            on_left_image: true,
            map_point: None,
            is_outlier: false,
        }
    }

    pub fn new_right(position: Point2<f64>) -> Self {
        Self {
            position,
            on_left_image: false,
            map_point: None,
            is_outlier: false,
        }
    }
}

/// One stereo capture with its features and (mutable) pose estimate.
///
/// The images live behind `Arc` so that promoting a frame to keyframe (which
/// clones it into the map) does not copy pixel data. `features_left` and
/// `features_right` are parallel after stereo matching: entry *i* of both
/// refers to the same candidate correspondence, with `None` on the right
/// meaning the stereo match failed for that feature.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub left: Arc<GrayImage>,
    pub right: Arc<GrayImage>,
    /// world→rig transform.
    pub pose: Isometry3<f64>,
    pub features_left: Vec<Feature>,
    pub features_right: Vec<Option<Feature>>,
    pub keyframe_id: Option<KeyframeId>,
}

impl Frame {
    pub fn new(id: FrameId, left: GrayImage, right: GrayImage) -> Result<Self> {
        if left.dimensions() != right.dimensions() {
            return Err(Error::MismatchedImages(format!(
                "left is {:?}, right is {:?}",
                left.dimensions(),
                right.dimensions()
            )));
        }
        if left.width() == 0 || left.height() == 0 {
            return Err(Error::MismatchedImages("empty image".into()));
        }
        Ok(Self {
            id,
            left: Arc::new(left),
            right: Arc::new(right),
            pose: Isometry3::identity(),
            features_left: Vec::new(),
            features_right: Vec::new(),
            keyframe_id: None,
        })
    }

    #[inline]
    pub fn is_keyframe(&self) -> bool {
        self.keyframe_id.is_some()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.left.dimensions()
    }
}
