//! Nonlinear least-squares estimation of poses and landmarks.
//!
//! Two problems are posed to the [`levenberg_marquardt`] driver:
//!
//! - [`estimate_pose`]: motion-only refinement of a single rig pose against
//!   2D–3D correspondences, with iterative robust outlier rejection. This is
//!   what the frontend runs on every tracked frame.
//! - [`BaProblem`]: local bundle adjustment over the active keyframe window
//!   and the landmarks it observes. This is what the backend runs whenever
//!   the map changes.
//!
//! Both parameterize pose updates as se(3) twists about a base pose
//! ([`strider_mvg::se3::exp`]) and robustify with a Huber kernel by residual
//! whitening; outlier classification always uses the raw χ².

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{
    DVector, Dyn, Isometry3, Matrix2x3, Matrix2x6, Matrix3, OMatrix, Point2, Point3, Vector2,
    Vector6, U6,
};
use serde::{Deserialize, Serialize};

use strider_mvg::{se3, Camera};

use crate::frame::KeyframeId;
use crate::map::BaWindow;
use crate::map_point::MapPointId;

fn default_chi2_threshold() -> f64 {
    5.991
}
fn default_outer_iterations() -> usize {
    4
}
fn default_inner_patience() -> usize {
    10
}

/// Parameters shared by the pose-only and bundle-adjustment solvers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerConfig {
    /// χ² cut for a 2-DoF reprojection residual (95th percentile: 5.991).
    /// Its square root doubles as the Huber threshold δ.
    #[serde(default = "default_chi2_threshold")]
    pub chi2_threshold: f64,
    /// Outer rounds of optimize-then-reclassify in pose estimation.
    #[serde(default = "default_outer_iterations")]
    pub outer_iterations: usize,
    /// Iteration budget handed to the inner Levenberg-Marquardt driver.
    #[serde(default = "default_inner_patience")]
    pub inner_patience: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            chi2_threshold: default_chi2_threshold(),
            outer_iterations: default_outer_iterations(),
            inner_patience: default_inner_patience(),
        }
    }
}

/// One 2D–3D correspondence for pose estimation.
#[derive(Debug, Clone)]
pub struct PoseEdge {
    pub world: Point3<f64>,
    pub pixel: Point2<f64>,
}

/// Result of [`estimate_pose`]. `outliers[i]` refers to `edges[i]`.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    pub pose: Isometry3<f64>,
    pub outliers: Vec<bool>,
    pub inliers: usize,
}

/// Depth is clamped away from zero so that a step through the camera plane
/// produces a huge but finite residual instead of a NaN.
const MIN_DEPTH: f64 = 1e-6;

fn project(camera: &Camera, p_cam: &Point3<f64>) -> Point2<f64> {
    let z = p_cam.z.max(MIN_DEPTH);
    Point2::new(
        camera.fx() * p_cam.x / z + camera.cx(),
        camera.fy() * p_cam.y / z + camera.cy(),
    )
}

/// ∂π/∂p_cam for the pinhole projection.
fn projection_jacobian(camera: &Camera, p_cam: &Point3<f64>) -> Matrix2x3<f64> {
    let z = p_cam.z.max(MIN_DEPTH);
    let z2 = z * z;
    Matrix2x3::new(
        camera.fx() / z,
        0.0,
        -camera.fx() * p_cam.x / z2,
        0.0,
        camera.fy() / z,
        -camera.fy() * p_cam.y / z2,
    )
}

/// Raw (unweighted) reprojection residual of a world point seen at `pixel`
/// through `camera` mounted on a rig at `pose`.
fn raw_residual(
    camera: &Camera,
    pose: &Isometry3<f64>,
    world: &Point3<f64>,
    pixel: &Point2<f64>,
) -> Vector2<f64> {
    let p_cam = camera.world_to_camera(world, pose);
    pixel - project(camera, &p_cam)
}

/// Whitening factor implementing the Huber kernel: residual and Jacobian
/// rows are scaled so that the squared norm of the whitened residual equals
/// the robustified cost.
fn huber_weight(residual_norm: f64, delta: Option<f64>) -> f64 {
    match delta {
        Some(delta) if residual_norm > delta => (delta / residual_norm).sqrt(),
        _ => 1.0,
    }
}

/// 2×6 Jacobian of the residual with respect to a left twist perturbation of
/// the rig pose, evaluated at the current estimate.
fn pose_jacobian(
    camera: &Camera,
    pose: &Isometry3<f64>,
    world: &Point3<f64>,
) -> Matrix2x6<f64> {
    let q = pose * world; // rig-frame point
    let p_cam = camera.pose() * q;
    let j_pi = projection_jacobian(camera, &p_cam);
    let r_ext = camera.pose().rotation.to_rotation_matrix();
    let mut dq = nalgebra::Matrix3x6::<f64>::zeros();
    dq.fixed_view_mut::<3, 3>(0, 0).copy_from(&Matrix3::identity());
    dq.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&(-se3::hat(&q.coords)));
    -j_pi * r_ext.matrix() * dq
}

/// Motion-only pose problem: parameters are a twist about the prior pose.
#[derive(Debug, Clone)]
struct PoseProblem {
    camera: Camera,
    base: Isometry3<f64>,
    edges: Vec<PoseEdge>,
    huber_delta: Option<f64>,
    xi: Vector6<f64>,
    pose: Isometry3<f64>,
}

impl PoseProblem {
    fn new(
        camera: Camera,
        base: Isometry3<f64>,
        edges: Vec<PoseEdge>,
        huber_delta: Option<f64>,
    ) -> Self {
        Self {
            camera,
            base,
            edges,
            huber_delta,
            xi: Vector6::zeros(),
            pose: base,
        }
    }
}

impl LeastSquaresProblem<f64, Dyn, U6> for PoseProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, x: &Vector6<f64>) {
        self.xi = *x;
        self.pose = se3::exp(x) * self.base;
    }

    fn params(&self) -> Vector6<f64> {
        self.xi
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(2 * self.edges.len());
        for (i, edge) in self.edges.iter().enumerate() {
            let res = raw_residual(&self.camera, &self.pose, &edge.world, &edge.pixel);
            let w = huber_weight(res.norm(), self.huber_delta);
            r[2 * i] = w * res.x;
            r[2 * i + 1] = w * res.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U6>> {
        let mut j = OMatrix::<f64, Dyn, U6>::zeros(2 * self.edges.len());
        for (i, edge) in self.edges.iter().enumerate() {
            let res = raw_residual(&self.camera, &self.pose, &edge.world, &edge.pixel);
            let w = huber_weight(res.norm(), self.huber_delta);
            let block = pose_jacobian(&self.camera, &self.pose, &edge.world) * w;
            j.view_mut((2 * i, 0), (2, 6)).copy_from(&block);
        }
        Some(j)
    }
}

/// Minimize the total robustified reprojection error over one rig pose.
///
/// Runs `outer_iterations` rounds; each round re-seeds the estimate with the
/// prior, runs the inner Levenberg-Marquardt driver over the edges currently
/// considered inliers, then reclassifies every edge by its raw χ² against
/// `chi2_threshold`. The Huber kernel is active in every round but the last,
/// so the final round optimizes the pure quadratic cost on inliers.
///
/// The caller applies the outlier flags to its features; this function only
/// reports them.
pub fn estimate_pose(
    camera: &Camera,
    prior: &Isometry3<f64>,
    edges: &[PoseEdge],
    config: &OptimizerConfig,
) -> PoseEstimate {
    let mut outliers = vec![false; edges.len()];
    let mut pose = *prior;
    if edges.is_empty() {
        return PoseEstimate {
            pose,
            outliers,
            inliers: 0,
        };
    }
    let delta = config.chi2_threshold.sqrt();

    for iteration in 0..config.outer_iterations {
        let kernel = if iteration + 1 < config.outer_iterations {
            Some(delta)
        } else {
            None
        };
        let active: Vec<PoseEdge> = edges
            .iter()
            .zip(outliers.iter())
            .filter(|(_, outlier)| !**outlier)
            .map(|(edge, _)| edge.clone())
            .collect();
        if active.is_empty() {
            break;
        }
        let problem = PoseProblem::new(camera.clone(), *prior, active, kernel);
        let (solved, _report) = LevenbergMarquardt::new()
            .with_patience(config.inner_patience)
            .minimize(problem);
        pose = solved.pose;

        for (i, edge) in edges.iter().enumerate() {
            let chi2 = raw_residual(camera, &pose, &edge.world, &edge.pixel).norm_squared();
            outliers[i] = chi2 > config.chi2_threshold;
        }
    }

    let inliers = outliers.iter().filter(|outlier| !**outlier).count();
    PoseEstimate {
        pose,
        outliers,
        inliers,
    }
}

/// Local bundle adjustment over the active keyframe window.
///
/// Parameters are one twist per keyframe except the oldest (held fixed for
/// gauge) followed by the landmark positions. Observations are the left-image
/// features of the window's keyframes.
#[derive(Debug, Clone)]
pub struct BaProblem {
    camera: Camera,
    huber_delta: Option<f64>,
    keyframe_ids: Vec<KeyframeId>,
    base_poses: Vec<Isometry3<f64>>,
    landmark_ids: Vec<MapPointId>,
    /// per observation: (keyframe index, landmark index, feature index, pixel)
    observations: Vec<(usize, usize, usize, Point2<f64>)>,
    params_cache: DVector<f64>,
    poses: Vec<Isometry3<f64>>,
    points: Vec<Point3<f64>>,
}

impl BaProblem {
    /// Build the problem from a window copy. Returns `None` when the window
    /// is too small to constrain anything (fewer than two keyframes or no
    /// observations).
    pub fn new(camera: Camera, window: &BaWindow, huber_delta: Option<f64>) -> Option<Self> {
        if window.keyframes.len() < 2 || window.landmarks.is_empty() {
            return None;
        }
        let landmark_ids: Vec<MapPointId> = window.landmarks.keys().copied().collect();
        let landmark_index: std::collections::BTreeMap<MapPointId, usize> = landmark_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        let points: Vec<Point3<f64>> = landmark_ids
            .iter()
            .map(|id| window.landmarks[id])
            .collect();

        let mut keyframe_ids = Vec::with_capacity(window.keyframes.len());
        let mut base_poses = Vec::with_capacity(window.keyframes.len());
        let mut observations = Vec::new();
        for (k, kf) in window.keyframes.iter().enumerate() {
            keyframe_ids.push(kf.id);
            base_poses.push(kf.pose);
            for obs in &kf.observations {
                let Some(lm) = landmark_index.get(&obs.map_point) else {
                    continue;
                };
                observations.push((k, *lm, obs.feature_index, obs.pixel));
            }
        }
        if observations.is_empty() {
            return None;
        }

        let n_params = 6 * (keyframe_ids.len() - 1) + 3 * points.len();
        let mut params = DVector::zeros(n_params);
        for (i, p) in points.iter().enumerate() {
            let off = 6 * (keyframe_ids.len() - 1) + 3 * i;
            params[off] = p.x;
            params[off + 1] = p.y;
            params[off + 2] = p.z;
        }

        let mut problem = Self {
            camera,
            huber_delta,
            keyframe_ids,
            poses: base_poses.clone(),
            base_poses,
            landmark_ids,
            observations,
            params_cache: DVector::zeros(n_params),
            points,
        };
        problem.set_params(&params);
        Some(problem)
    }

    /// Refined keyframe poses, including the fixed one.
    pub fn poses(&self) -> impl Iterator<Item = (KeyframeId, Isometry3<f64>)> + '_ {
        self.keyframe_ids.iter().copied().zip(self.poses.iter().copied())
    }

    /// Refined landmark positions.
    pub fn points(&self) -> impl Iterator<Item = (MapPointId, Point3<f64>)> + '_ {
        self.landmark_ids.iter().copied().zip(self.points.iter().copied())
    }

    /// Raw χ² of every observation at the current estimate, with enough
    /// context to detach the observation from the map.
    pub fn observation_chi2(
        &self,
    ) -> impl Iterator<Item = (KeyframeId, usize, MapPointId, f64)> + '_ {
        self.observations.iter().map(|(k, lm, fidx, pixel)| {
            let chi2 = raw_residual(&self.camera, &self.poses[*k], &self.points[*lm], pixel)
                .norm_squared();
            (self.keyframe_ids[*k], *fidx, self.landmark_ids[*lm], chi2)
        })
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for BaProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params_cache = x.clone();
        let n_free = self.keyframe_ids.len() - 1;
        for k in 0..n_free {
            let xi = Vector6::from_iterator(x.as_slice()[6 * k..6 * (k + 1)].iter().copied());
            self.poses[k + 1] = se3::exp(&xi) * self.base_poses[k + 1];
        }
        let off = 6 * n_free;
        for i in 0..self.points.len() {
            self.points[i] = Point3::new(x[off + 3 * i], x[off + 3 * i + 1], x[off + 3 * i + 2]);
        }
    }

    fn params(&self) -> DVector<f64> {
        self.params_cache.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(2 * self.observations.len());
        for (i, (k, lm, _fidx, pixel)) in self.observations.iter().enumerate() {
            let res = raw_residual(&self.camera, &self.poses[*k], &self.points[*lm], pixel);
            let w = huber_weight(res.norm(), self.huber_delta);
            r[2 * i] = w * res.x;
            r[2 * i + 1] = w * res.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, Dyn>> {
        let n_free = self.keyframe_ids.len() - 1;
        let mut j =
            OMatrix::<f64, Dyn, Dyn>::zeros(2 * self.observations.len(), self.params_cache.len());
        for (i, (k, lm, _fidx, pixel)) in self.observations.iter().enumerate() {
            let pose = &self.poses[*k];
            let world = &self.points[*lm];
            let res = raw_residual(&self.camera, pose, world, pixel);
            let w = huber_weight(res.norm(), self.huber_delta);

            if *k > 0 {
                let block = pose_jacobian(&self.camera, pose, world) * w;
                j.view_mut((2 * i, 6 * (k - 1)), (2, 6)).copy_from(&block);
            }

            let p_cam = self.camera.world_to_camera(world, pose);
            let j_pi = projection_jacobian(&self.camera, &p_cam);
            let r_ext = self.camera.pose().rotation.to_rotation_matrix();
            let r_kf = pose.rotation.to_rotation_matrix();
            let block_pt = -j_pi * r_ext.matrix() * r_kf.matrix() * w;
            j.view_mut((2 * i, 6 * n_free + 3 * lm), (2, 3))
                .copy_from(&block_pt);
        }
        Some(j)
    }
}
