use std::sync::Arc;

use nalgebra::Isometry3;

use strider_flow::{detect, track, Mask, Pyramid};
use strider_mvg::{triangulate, Camera};

use crate::backend::Backend;
use crate::config::TrackingConfig;
use crate::frame::{Feature, Frame, FrameId, KeyframeId};
use crate::map::Map;
use crate::map_point::{ImageSide, Observation};
use crate::optimizer::{self, PoseEdge};
use crate::viewer::Viewer;
use crate::{Error, Result};

/// State of the tracking automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    Initing,
    TrackingGood,
    TrackingBad,
    Lost,
}

impl std::fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrackingStatus::Initing => "INITING",
            TrackingStatus::TrackingGood => "TRACKING_GOOD",
            TrackingStatus::TrackingBad => "TRACKING_BAD",
            TrackingStatus::Lost => "LOST",
        };
        f.write_str(s)
    }
}

fn classify(inliers: usize, config: &TrackingConfig) -> TrackingStatus {
    if inliers > config.num_features_tracking {
        TrackingStatus::TrackingGood
    } else if inliers > config.num_features_tracking_bad {
        TrackingStatus::TrackingBad
    } else {
        TrackingStatus::Lost
    }
}

fn needs_new_keyframe(inliers: usize, config: &TrackingConfig) -> bool {
    inliers < config.num_features_needed_for_keyframe
}

/// A processed frame retained for temporal correspondence.
struct TrackedFrame {
    frame: Frame,
    pyramid: Pyramid,
}

/// The tracking frontend: estimates the rig pose for every incoming stereo
/// pair and feeds keyframes and landmarks to the map.
///
/// [`Frontend::add_frame`] is synchronous; it returns once the state
/// transition for the frame is complete. The only cross-thread interactions
/// are the map calls and the backend notification.
pub struct Frontend {
    config: TrackingConfig,
    camera_left: Camera,
    camera_right: Camera,
    map: Arc<Map>,
    backend: Arc<Backend>,
    viewer: Arc<dyn Viewer>,
    status: TrackingStatus,
    last: Option<TrackedFrame>,
    /// Constant-velocity prior: pose delta observed between the two most
    /// recent frames. Identity at construction and after reset.
    relative_motion: Isometry3<f64>,
    tracking_inliers: usize,
    newest_frame_id: Option<FrameId>,
}

impl Frontend {
    pub fn new(
        config: TrackingConfig,
        camera_left: Camera,
        camera_right: Camera,
        map: Arc<Map>,
        backend: Arc<Backend>,
        viewer: Arc<dyn Viewer>,
    ) -> Result<Self> {
        config.validate()?;
        let baseline = (camera_left.pose().translation.vector
            - camera_right.pose().translation.vector)
            .norm();
        if baseline <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "stereo rig has no baseline between the cameras".into(),
            ));
        }
        Ok(Self {
            config,
            camera_left,
            camera_right,
            map,
            backend,
            viewer,
            status: TrackingStatus::Initing,
            last: None,
            relative_motion: Isometry3::identity(),
            tracking_inliers: 0,
            newest_frame_id: None,
        })
    }

    #[inline]
    pub fn status(&self) -> TrackingStatus {
        self.status
    }

    #[inline]
    pub fn tracking_inliers(&self) -> usize {
        self.tracking_inliers
    }

    /// Pose of the most recently processed frame (world→rig).
    pub fn last_pose(&self) -> Option<Isometry3<f64>> {
        self.last.as_ref().map(|t| t.frame.pose)
    }

    /// The constant-velocity prior currently in effect.
    pub fn relative_motion(&self) -> &Isometry3<f64> {
        &self.relative_motion
    }

    /// Process one stereo capture and return the tracking status after it.
    pub fn add_frame(&mut self, frame: Frame) -> Result<TrackingStatus> {
        if let Some(newest) = self.newest_frame_id {
            if frame.id <= newest {
                return Err(Error::OutOfOrderFrame {
                    got: frame.id,
                    newest,
                });
            }
        }
        if let Some(last) = &self.last {
            if last.frame.dimensions() != frame.dimensions() {
                return Err(Error::MismatchedImages(format!(
                    "frame {} is {:?} but the previous frame was {:?}",
                    frame.id,
                    frame.dimensions(),
                    last.frame.dimensions()
                )));
            }
        }
        self.newest_frame_id = Some(frame.id);

        let pyramid = Pyramid::build(&frame.left, self.config.flow.levels);
        match self.status {
            TrackingStatus::Initing => self.stereo_init(frame, pyramid)?,
            TrackingStatus::TrackingGood | TrackingStatus::TrackingBad => {
                self.track(frame, pyramid)?
            }
            TrackingStatus::Lost => self.reset(),
        }
        Ok(self.status)
    }

    /// Soft reset: drop the temporal state, keep the map.
    fn reset(&mut self) {
        tracing::info!("tracking lost, resetting to initialization");
        self.last = None;
        self.relative_motion = Isometry3::identity();
        self.tracking_inliers = 0;
        self.status = TrackingStatus::Initing;
    }

    fn stereo_init(&mut self, mut frame: Frame, pyramid: Pyramid) -> Result<()> {
        let detected = self.detect_features(&mut frame, &pyramid);
        let right_pyramid = Pyramid::build(&frame.right, self.config.flow.levels);
        let matched = self.find_features_in_right(&mut frame, &pyramid, &right_pyramid);
        tracing::debug!(
            "stereo init on frame {}: {detected} corners, {matched} matched in right image",
            frame.id
        );
        if matched >= self.config.num_features_init {
            self.build_initial_map(&mut frame);
            self.status = TrackingStatus::TrackingGood;
            self.viewer.add_current_frame(&frame);
            self.viewer.update_map(&self.map.snapshot());
        }
        self.last = Some(TrackedFrame { frame, pyramid });
        Ok(())
    }

    fn build_initial_map(&mut self, frame: &mut Frame) {
        let kf_id = self.map.insert_keyframe(frame.clone());
        frame.keyframe_id = Some(kf_id);
        let created = self.triangulate_stereo_matches(frame, kf_id);
        self.map.update_keyframe(frame.clone());
        self.backend.update_map();
        tracing::info!(
            "initial map built from keyframe {kf_id} with {created} landmarks"
        );
    }

    fn track(&mut self, mut frame: Frame, pyramid: Pyramid) -> Result<()> {
        let Some(last) = self.last.take() else {
            // no temporal state to track against; fall back to initialization
            return self.stereo_init(frame, pyramid);
        };

        frame.pose = self.relative_motion * last.frame.pose;
        let tracked = self.track_last_frame(&last, &mut frame, &pyramid);
        self.tracking_inliers = self.estimate_current_pose(&mut frame);
        tracing::debug!(
            "frame {}: {tracked} features tracked, {} pose inliers",
            frame.id,
            self.tracking_inliers
        );

        self.status = classify(self.tracking_inliers, &self.config);
        if self.status == TrackingStatus::Lost {
            tracing::warn!(
                "frame {}: only {} inliers, tracking lost",
                frame.id,
                self.tracking_inliers
            );
        }

        self.insert_keyframe_if_needed(&mut frame, &pyramid);

        self.relative_motion = frame.pose * last.frame.pose.inverse();
        self.viewer.add_current_frame(&frame);
        self.last = Some(TrackedFrame { frame, pyramid });
        Ok(())
    }

    /// Detect corners on the left image, masking out current features.
    fn detect_features(&self, frame: &mut Frame, pyramid: &Pyramid) -> usize {
        let (w, h) = frame.dimensions();
        let mut mask = Mask::new(w, h);
        for feature in &frame.features_left {
            mask.block_box(&feature.position, self.config.mask_half_size);
        }
        let corners = detect(
            pyramid.level(0),
            &mask,
            self.config.num_features,
            &self.config.detect,
        );
        let before = frame.features_left.len();
        frame
            .features_left
            .extend(corners.into_iter().map(Feature::new_left));
        frame.features_left.len() - before
    }

    /// Propagate every left feature to the right image by optical flow.
    ///
    /// Features with a live landmark are seeded by projecting it through the
    /// right camera; the rest start at the left position (rectification puts
    /// the match on the same row).
    fn find_features_in_right(
        &self,
        frame: &mut Frame,
        left_pyramid: &Pyramid,
        right_pyramid: &Pyramid,
    ) -> usize {
        let mut sources = Vec::with_capacity(frame.features_left.len());
        let mut guesses = Vec::with_capacity(frame.features_left.len());
        for feature in &frame.features_left {
            sources.push(feature.position);
            let guess = feature
                .map_point
                .and_then(|id| self.map.point_position(id))
                .map(|p| self.camera_right.world_to_pixel(&p, &frame.pose))
                .unwrap_or(feature.position);
            guesses.push(guess);
        }
        let results = track(
            left_pyramid,
            right_pyramid,
            &sources,
            &guesses,
            &self.config.flow,
        );
        frame.features_right = results
            .into_iter()
            .map(|r| r.map(Feature::new_right))
            .collect();
        frame.features_right.iter().flatten().count()
    }

    /// Propagate the previous frame's left features into the current left
    /// image, carrying their landmark links.
    fn track_last_frame(
        &self,
        last: &TrackedFrame,
        frame: &mut Frame,
        pyramid: &Pyramid,
    ) -> usize {
        let mut sources = Vec::with_capacity(last.frame.features_left.len());
        let mut guesses = Vec::with_capacity(last.frame.features_left.len());
        for feature in &last.frame.features_left {
            sources.push(feature.position);
            let guess = feature
                .map_point
                .and_then(|id| self.map.point_position(id))
                .map(|p| self.camera_left.world_to_pixel(&p, &frame.pose))
                .unwrap_or(feature.position);
            guesses.push(guess);
        }
        let results = track(&last.pyramid, pyramid, &sources, &guesses, &self.config.flow);
        let mut good = 0;
        for (feature, result) in last.frame.features_left.iter().zip(results) {
            if let Some(position) = result {
                let mut tracked = Feature::new_left(position);
                tracked.map_point = feature.map_point;
                frame.features_left.push(tracked);
                good += 1;
            }
        }
        good
    }

    /// Motion-only pose refinement against the landmarks currently linked to
    /// the frame's features. Outlier features lose their landmark link but
    /// stay available for later re-association.
    fn estimate_current_pose(&self, frame: &mut Frame) -> usize {
        let mut indices = Vec::new();
        let mut edges = Vec::new();
        for (i, feature) in frame.features_left.iter().enumerate() {
            let Some(id) = feature.map_point else { continue };
            let Some(world) = self.map.point_position(id) else {
                continue;
            };
            indices.push(i);
            edges.push(PoseEdge {
                world,
                pixel: feature.position,
            });
        }

        let estimate = optimizer::estimate_pose(
            &self.camera_left,
            &frame.pose,
            &edges,
            &self.config.optimizer,
        );
        frame.pose = estimate.pose;

        let mut outliers = 0;
        for (k, &i) in indices.iter().enumerate() {
            let feature = &mut frame.features_left[i];
            feature.is_outlier = estimate.outliers[k];
            if feature.is_outlier {
                feature.map_point = None;
                feature.is_outlier = false;
                outliers += 1;
            }
        }
        tracing::debug!(
            "pose estimation: {outliers} outliers / {} inliers",
            estimate.inliers
        );
        estimate.inliers
    }

    /// Promote the current frame to keyframe when tracking got thin, and
    /// replenish the map from its stereo pair.
    fn insert_keyframe_if_needed(&mut self, frame: &mut Frame, pyramid: &Pyramid) -> bool {
        if !needs_new_keyframe(self.tracking_inliers, &self.config) {
            return false;
        }
        let kf_id = self.map.insert_keyframe(frame.clone());
        frame.keyframe_id = Some(kf_id);

        for (i, feature) in frame.features_left.iter().enumerate() {
            if let Some(id) = feature.map_point {
                self.map.add_observation(
                    id,
                    Observation {
                        keyframe_id: kf_id,
                        feature_index: i,
                        side: ImageSide::Left,
                    },
                );
            }
        }

        let detected = self.detect_features(frame, pyramid);
        let right_pyramid = Pyramid::build(&frame.right, self.config.flow.levels);
        let matched = self.find_features_in_right(frame, pyramid, &right_pyramid);
        let created = self.triangulate_stereo_matches(frame, kf_id);

        self.map.update_keyframe(frame.clone());
        self.backend.update_map();
        self.viewer.update_map(&self.map.snapshot());
        tracing::info!(
            "keyframe {kf_id} from frame {}: {detected} new corners, {matched} stereo matches, {created} new landmarks",
            frame.id
        );
        true
    }

    /// Lift every stereo correspondence without a landmark into a new world
    /// point. Degenerate triangulations and points behind either camera are
    /// skipped silently.
    fn triangulate_stereo_matches(&self, frame: &mut Frame, kf_id: KeyframeId) -> usize {
        let poses = [*self.camera_left.pose(), *self.camera_right.pose()];
        let mut created = 0;
        for i in 0..frame.features_left.len() {
            if frame.features_left[i].map_point.is_some() {
                continue;
            }
            let Some(right_position) = frame
                .features_right
                .get(i)
                .and_then(|r| r.as_ref())
                .map(|f| f.position)
            else {
                continue;
            };
            let observations = [
                self.camera_left
                    .pixel_to_camera(&frame.features_left[i].position)
                    .coords,
                self.camera_right.pixel_to_camera(&right_position).coords,
            ];
            let Ok(p_rig) = triangulate(&poses, &observations) else {
                continue;
            };
            let depth_left = (self.camera_left.pose() * p_rig).z;
            let depth_right = (self.camera_right.pose() * p_rig).z;
            if depth_left <= 0.0 || depth_right <= 0.0 {
                continue;
            }
            let p_world = frame.pose.inverse() * p_rig;
            let id = self.map.insert_map_point(
                p_world,
                vec![
                    Observation {
                        keyframe_id: kf_id,
                        feature_index: i,
                        side: ImageSide::Left,
                    },
                    Observation {
                        keyframe_id: kf_id,
                        feature_index: i,
                        side: ImageSide::Right,
                    },
                ],
            );
            frame.features_left[i].map_point = Some(id);
            if let Some(right) = frame.features_right[i].as_mut() {
                right.map_point = Some(id);
            }
            created += 1;
        }
        created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::TraceViewer;

    #[test]
    fn classification_boundaries() {
        let cfg = TrackingConfig::default();
        assert_eq!(classify(51, &cfg), TrackingStatus::TrackingGood);
        assert_eq!(classify(50, &cfg), TrackingStatus::TrackingBad);
        assert_eq!(classify(21, &cfg), TrackingStatus::TrackingBad);
        assert_eq!(classify(20, &cfg), TrackingStatus::Lost);
        assert_eq!(classify(0, &cfg), TrackingStatus::Lost);
    }

    #[test]
    fn keyframe_admission_boundary() {
        let cfg = TrackingConfig::default();
        assert!(!needs_new_keyframe(80, &cfg));
        assert!(!needs_new_keyframe(81, &cfg));
        assert!(needs_new_keyframe(79, &cfg));
    }

    #[test]
    fn construction_rejects_zero_baseline() {
        let cam = Camera::new(400.0, 400.0, 320.0, 240.0, 0.0, Isometry3::identity()).unwrap();
        let map = Arc::new(Map::new(7));
        let backend = Arc::new(Backend::new(
            cam.clone(),
            map.clone(),
            Default::default(),
        ));
        let got = Frontend::new(
            TrackingConfig::default(),
            cam.clone(),
            cam,
            map,
            backend,
            Arc::new(TraceViewer),
        );
        assert!(matches!(got, Err(Error::InvalidConfiguration(_))));
    }
}
