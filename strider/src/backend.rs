use std::sync::Arc;
use std::thread::JoinHandle;

use levenberg_marquardt::LevenbergMarquardt;
use parking_lot::{Condvar, Mutex};

use strider_mvg::Camera;

use crate::map::Map;
use crate::map_point::{ImageSide, Observation};
use crate::optimizer::{BaProblem, OptimizerConfig};

/// Background bundle-adjustment worker.
///
/// Runs local bundle adjustment over the map's active keyframe window
/// whenever [`Backend::update_map`] signals that the map changed. The window
/// is copied out under the map lock; the optimization itself runs unlocked
/// and the results are written back afterwards. Observations whose χ²
/// exceeds the configured threshold are detached from their landmark.
pub struct Backend {
    shared: Arc<BackendShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct BackendShared {
    map: Arc<Map>,
    camera: Camera,
    config: OptimizerConfig,
    state: Mutex<SignalState>,
    condvar: Condvar,
}

#[derive(Default)]
struct SignalState {
    dirty: bool,
    shutdown: bool,
}

impl Backend {
    /// Spawn the worker thread. `camera` is the left camera of the rig (the
    /// one whose observations enter bundle adjustment).
    pub fn new(camera: Camera, map: Arc<Map>, config: OptimizerConfig) -> Self {
        let shared = Arc::new(BackendShared {
            map,
            camera,
            config,
            state: Mutex::new(SignalState::default()),
            condvar: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name("strider-backend".into())
            .spawn(move || worker.run())
            .ok();
        Self {
            shared,
            handle: Mutex::new(handle),
        }
    }

    /// Non-blocking notification that map contents changed.
    pub fn update_map(&self) {
        let mut state = self.shared.state.lock();
        state.dirty = true;
        self.shared.condvar.notify_one();
    }

    /// Cooperative shutdown: finish the current optimization and exit.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.condvar.notify_one();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.stop();
    }
}

impl BackendShared {
    fn run(&self) {
        tracing::debug!("backend started");
        loop {
            {
                let mut state = self.state.lock();
                while !state.dirty && !state.shutdown {
                    self.condvar.wait(&mut state);
                }
                if state.shutdown {
                    break;
                }
                state.dirty = false;
            }
            self.optimize_active_window();
        }
        tracing::debug!("backend stopped");
    }

    fn optimize_active_window(&self) {
        let window = self.map.ba_window();
        let delta = self.config.chi2_threshold.sqrt();
        let Some(problem) = BaProblem::new(self.camera.clone(), &window, Some(delta)) else {
            return;
        };
        let (solved, report) = LevenbergMarquardt::new()
            .with_patience(self.config.inner_patience)
            .minimize(problem);
        if !report.termination.was_successful() {
            tracing::warn!(
                "local bundle adjustment did not converge: {:?}",
                report.termination
            );
            return;
        }

        for (id, pose) in solved.poses() {
            self.map.set_keyframe_pose(id, pose);
        }
        for (id, position) in solved.points() {
            self.map.set_point_position(id, position);
        }
        let mut detached = 0usize;
        for (keyframe_id, feature_index, map_point, chi2) in solved.observation_chi2() {
            if chi2 > self.config.chi2_threshold {
                self.map.detach_observation(
                    map_point,
                    &Observation {
                        keyframe_id,
                        feature_index,
                        side: ImageSide::Left,
                    },
                );
                detached += 1;
            }
        }
        tracing::debug!(
            "local bundle adjustment over {} keyframes / {} landmarks, {detached} outlier observations detached",
            window.keyframes.len(),
            window.landmarks.len(),
        );
    }
}
