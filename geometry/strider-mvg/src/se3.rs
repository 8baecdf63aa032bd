//! Exponential map of SE(3).
//!
//! Twists are 6-vectors ordered translation-first: `ξ = (ρ, φ)` with `ρ` the
//! translational part and `φ` the rotational part (axis times angle). The
//! optimizers apply pose increments as `exp(ξ) · T`.

use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3, Vector6};

/// Angle below which the Taylor expansion of the left Jacobian is used.
const SMALL_ANGLE: f64 = 1e-8;

/// The skew-symmetric matrix `v̂` such that `v̂ w = v × w`.
pub fn hat(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Map a twist to a rigid transform.
///
/// The rotational part goes through the SO(3) exponential; the translation is
/// coupled through the SO(3) left Jacobian so that `exp` is the true matrix
/// exponential of the twist, not a decoupled rotation/translation pair.
pub fn exp(xi: &Vector6<f64>) -> Isometry3<f64> {
    let rho = Vector3::new(xi[0], xi[1], xi[2]);
    let phi = Vector3::new(xi[3], xi[4], xi[5]);

    let rotation = UnitQuaternion::from_scaled_axis(phi);
    let translation = left_jacobian(&phi) * rho;

    Isometry3::from_parts(Translation3::from(translation), rotation)
}

fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let phi_hat = hat(phi);
    if theta < SMALL_ANGLE {
        Matrix3::identity() + phi_hat / 2.0 + phi_hat * phi_hat / 6.0
    } else {
        let theta2 = theta * theta;
        Matrix3::identity()
            + phi_hat * ((1.0 - theta.cos()) / theta2)
            + phi_hat * phi_hat * ((theta - theta.sin()) / (theta2 * theta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    #[test]
    fn exp_of_zero_is_identity() {
        let t = exp(&Vector6::zeros());
        assert_relative_eq!(
            t.to_homogeneous(),
            Isometry3::identity().to_homogeneous(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn pure_translation() {
        let xi = Vector6::new(1.0, -2.0, 3.0, 0.0, 0.0, 0.0);
        let t = exp(&xi);
        assert_relative_eq!(t.translation.vector, Vector3::new(1.0, -2.0, 3.0));
        assert_relative_eq!(t.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn pure_rotation_about_z() {
        let half_pi = std::f64::consts::FRAC_PI_2;
        let xi = Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, half_pi);
        let t = exp(&xi);
        let p = t * Point3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(p, Point3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn exp_of_negated_twist_is_inverse() {
        let xi = Vector6::new(0.1, -0.2, 0.3, 0.04, 0.05, -0.06);
        let t = exp(&xi) * exp(&(-xi));
        assert_relative_eq!(
            t.to_homogeneous(),
            Isometry3::identity().to_homogeneous(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn translation_couples_with_rotation() {
        // For a quarter turn about z with unit x translation in the twist,
        // the resulting translation is the left Jacobian applied to rho, not
        // rho itself.
        let half_pi = std::f64::consts::FRAC_PI_2;
        let xi = Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, half_pi);
        let t = exp(&xi);
        let expected = Vector3::new(2.0 / std::f64::consts::PI, 2.0 / std::f64::consts::PI, 0.0);
        assert_relative_eq!(t.translation.vector, expected, epsilon = 1e-10);
    }
}
