use nalgebra::{Isometry3, Matrix3, Matrix3x4, Point2, Point3, Translation3, Vector3};

use crate::{GeomError, Result};

/// A calibrated pinhole camera of a stereo rig.
///
/// This structure holds the intrinsic parameters (focal lengths and principal
/// point; the rig is rectified, so there is no distortion model), the fixed
/// extrinsic transform from the rig frame to this camera frame (identity for
/// the left camera, the baseline translation for the right camera), and the
/// stereo baseline in world units.
///
/// The camera implements the projective model `s [u v 1]ᵀ = K · T_cam_rig ·
/// T_rig_world · [X Y Z 1]ᵀ` where `T_rig_world` is the pose of the frame
/// currently being tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    baseline: f64,
    pose: Isometry3<f64>,
    pose_inv: Isometry3<f64>,
}

impl Camera {
    /// Create a camera from pinhole intrinsics, the stereo baseline and the
    /// rig→camera extrinsic.
    ///
    /// Fails fast on non-positive focal lengths or a negative baseline so
    /// that misconfiguration is caught at construction, not during tracking.
    pub fn new(
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        baseline: f64,
        pose: Isometry3<f64>,
    ) -> Result<Self> {
        if !(fx > 0.0) || !(fy > 0.0) {
            return Err(GeomError::InvalidCameraParameters(
                "focal length must be positive",
            ));
        }
        if !(baseline >= 0.0) {
            return Err(GeomError::InvalidCameraParameters(
                "baseline must be non-negative",
            ));
        }
        let pose_inv = pose.inverse();
        Ok(Self {
            fx,
            fy,
            cx,
            cy,
            baseline,
            pose,
            pose_inv,
        })
    }

    /// Create a camera from a KITTI-style 3×4 projection matrix `P = K [I|t']`
    /// with `t' = K t`.
    ///
    /// The recovered extrinsic is a pure translation, which is what a
    /// rectified stereo rig provides. The baseline is `‖t‖`.
    pub fn from_projection(p: &Matrix3x4<f64>) -> Result<Self> {
        let fx = p[(0, 0)];
        let fy = p[(1, 1)];
        let cx = p[(0, 2)];
        let cy = p[(1, 2)];
        if !(fx > 0.0) || !(fy > 0.0) {
            return Err(GeomError::InvalidCameraParameters(
                "projection matrix has non-positive focal length",
            ));
        }
        let k = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);
        let k_inv = k
            .try_inverse()
            .ok_or(GeomError::InvalidCameraParameters("singular intrinsics"))?;
        let t: Vector3<f64> = k_inv * p.column(3);
        let baseline = t.norm();
        let pose = Isometry3::from_parts(Translation3::from(t), nalgebra::UnitQuaternion::identity());
        Self::new(fx, fy, cx, cy, baseline, pose)
    }

    /// The 3×3 intrinsic matrix `K`.
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    #[inline]
    pub fn fx(&self) -> f64 {
        self.fx
    }

    #[inline]
    pub fn fy(&self) -> f64 {
        self.fy
    }

    #[inline]
    pub fn cx(&self) -> f64 {
        self.cx
    }

    #[inline]
    pub fn cy(&self) -> f64 {
        self.cy
    }

    /// Stereo baseline in world units.
    #[inline]
    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    /// The fixed rig→camera extrinsic.
    #[inline]
    pub fn pose(&self) -> &Isometry3<f64> {
        &self.pose
    }

    pub fn world_to_camera(&self, p_w: &Point3<f64>, t_rig_world: &Isometry3<f64>) -> Point3<f64> {
        self.pose * (t_rig_world * p_w)
    }

    pub fn camera_to_world(&self, p_c: &Point3<f64>, t_rig_world: &Isometry3<f64>) -> Point3<f64> {
        t_rig_world.inverse() * (self.pose_inv * p_c)
    }

    /// Project a camera-frame point to pixel coordinates.
    pub fn camera_to_pixel(&self, p_c: &Point3<f64>) -> Point2<f64> {
        Point2::new(
            self.fx * p_c.x / p_c.z + self.cx,
            self.fy * p_c.y / p_c.z + self.cy,
        )
    }

    /// Back-project a pixel onto the normalized image plane (`z = 1`).
    pub fn pixel_to_camera(&self, px: &Point2<f64>) -> Point3<f64> {
        Point3::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy, 1.0)
    }

    pub fn world_to_pixel(&self, p_w: &Point3<f64>, t_rig_world: &Isometry3<f64>) -> Point2<f64> {
        self.camera_to_pixel(&self.world_to_camera(p_w, t_rig_world))
    }

    pub fn pixel_to_world(
        &self,
        px: &Point2<f64>,
        t_rig_world: &Isometry3<f64>,
        depth: f64,
    ) -> Point3<f64> {
        let ray = self.pixel_to_camera(px).coords * depth;
        self.camera_to_world(&Point3::from(ray), t_rig_world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_camera() -> Camera {
        Camera::new(400.0, 400.0, 320.0, 240.0, 0.0, Isometry3::identity()).unwrap()
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(Camera::new(0.0, 400.0, 320.0, 240.0, 0.0, Isometry3::identity()).is_err());
        assert!(Camera::new(400.0, 400.0, 320.0, 240.0, -0.5, Isometry3::identity()).is_err());
    }

    #[test]
    fn pixel_camera_roundtrip() {
        let cam = test_camera();
        let px = Point2::new(123.4, 321.0);
        let p_c = cam.pixel_to_camera(&px);
        assert_relative_eq!(p_c.z, 1.0);
        assert_relative_eq!(cam.camera_to_pixel(&p_c), px, epsilon = 1e-12);
    }

    #[test]
    fn world_projection_through_rig_pose() {
        let cam = test_camera();
        // rig translated one unit along x
        let t_rig_world = Isometry3::translation(-1.0, 0.0, 0.0);
        let p_w = Point3::new(1.0, 0.0, 5.0);
        let px = cam.world_to_pixel(&p_w, &t_rig_world);
        assert_relative_eq!(px, Point2::new(320.0, 240.0), epsilon = 1e-12);
        let back = cam.pixel_to_world(&px, &t_rig_world, 5.0);
        assert_relative_eq!(back, p_w, epsilon = 1e-12);
    }

    #[test]
    fn from_projection_recovers_baseline() {
        // right camera of a rig with fx=400, baseline 0.5: P[0,3] = -fx*b
        let p = Matrix3x4::new(
            400.0, 0.0, 320.0, -200.0, //
            0.0, 400.0, 240.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        );
        let cam = Camera::from_projection(&p).unwrap();
        assert_relative_eq!(cam.baseline(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(
            cam.pose().translation.vector,
            Vector3::new(-0.5, 0.0, 0.0),
            epsilon = 1e-12
        );
    }
}
