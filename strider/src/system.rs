use std::sync::Arc;

use nalgebra::Isometry3;

use strider_mvg::Camera;

use crate::backend::Backend;
use crate::config::TrackingConfig;
use crate::frame::Frame;
use crate::frontend::{Frontend, TrackingStatus};
use crate::map::Map;
use crate::viewer::Viewer;
use crate::Result;

/// The assembled pipeline: map, backend thread and tracking frontend.
pub struct System {
    map: Arc<Map>,
    backend: Arc<Backend>,
    frontend: Frontend,
}

impl System {
    pub fn new(
        config: TrackingConfig,
        camera_left: Camera,
        camera_right: Camera,
        viewer: Arc<dyn Viewer>,
    ) -> Result<Self> {
        config.validate()?;
        let map = Arc::new(Map::new(config.num_active_keyframes));
        let backend = Arc::new(Backend::new(
            camera_left.clone(),
            map.clone(),
            config.optimizer.clone(),
        ));
        let frontend = Frontend::new(
            config,
            camera_left,
            camera_right,
            map.clone(),
            backend.clone(),
            viewer,
        )?;
        Ok(Self {
            map,
            backend,
            frontend,
        })
    }

    /// Process one stereo capture.
    pub fn track(&mut self, frame: Frame) -> Result<TrackingStatus> {
        self.frontend.add_frame(frame)
    }

    #[inline]
    pub fn status(&self) -> TrackingStatus {
        self.frontend.status()
    }

    #[inline]
    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    /// Pose of the most recently processed frame (world→rig).
    pub fn current_pose(&self) -> Option<Isometry3<f64>> {
        self.frontend.last_pose()
    }

    #[inline]
    pub fn frontend(&self) -> &Frontend {
        &self.frontend
    }

    /// Stop the backend thread and tear the pipeline down.
    pub fn shutdown(self) {
        self.backend.stop();
    }
}
