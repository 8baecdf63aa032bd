use nalgebra::{Dyn, Isometry3, OMatrix, Point3, Vector3, U4};

use crate::{GeomError, Result};

const SVD_MAX_ITERATIONS: usize = 1_000_000;

/// A solution is accepted only when the smallest singular value is well
/// separated from the next one; otherwise the view configuration does not
/// constrain the point.
const SINGULAR_VALUE_RATIO: f64 = 1e-2;

/// Triangulate a world point from two or more calibrated views.
///
/// `poses` are world→camera transforms and `points` the matching
/// observations on the normalized image plane (`z = 1`). The returned point
/// minimizes the algebraic reprojection error of the stacked linear system
/// via SVD.
///
/// # Errors
///
/// - [`GeomError::NotEnoughPoints`] for fewer than two views.
/// - [`GeomError::SvdFailed`] when the decomposition does not converge.
/// - [`GeomError::DegenerateGeometry`] when the views do not constrain the
///   point (singular-value gate) or the homogeneous scale vanishes.
///
/// Cheirality is not checked here; callers decide what to do with points
/// behind a camera.
pub fn triangulate(poses: &[Isometry3<f64>], points: &[Vector3<f64>]) -> Result<Point3<f64>> {
    if poses.len() < 2 || poses.len() != points.len() {
        return Err(GeomError::NotEnoughPoints);
    }

    let mut a = OMatrix::<f64, Dyn, U4>::zeros(2 * poses.len());
    for (i, (pose, pt)) in poses.iter().zip(points.iter()).enumerate() {
        let m = pose.to_homogeneous();
        let m = m.fixed_view::<3, 4>(0, 0);
        a.row_mut(2 * i).copy_from(&(pt.x * m.row(2) - m.row(0)));
        a.row_mut(2 * i + 1).copy_from(&(pt.y * m.row(2) - m.row(1)));
    }

    let svd = nalgebra::linalg::SVD::try_new(a, false, true, 1e-12, SVD_MAX_ITERATIONS)
        .ok_or(GeomError::SvdFailed)?;
    let sv = &svd.singular_values;
    // singular values are sorted in decreasing order
    if !(sv[3] / sv[2] < SINGULAR_VALUE_RATIO) {
        return Err(GeomError::DegenerateGeometry);
    }
    let v_t = svd.v_t.as_ref().ok_or(GeomError::SvdFailed)?;
    let h = v_t.row(3);
    if h[3].abs() < f64::EPSILON {
        return Err(GeomError::DegenerateGeometry);
    }
    Ok(Point3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Isometry3;

    fn normalized(p_c: &Point3<f64>) -> Vector3<f64> {
        Vector3::new(p_c.x / p_c.z, p_c.y / p_c.z, 1.0)
    }

    #[test]
    fn two_view_exact() {
        let p_w = Point3::new(0.3, -0.2, 6.0);
        let left = Isometry3::identity();
        let right = Isometry3::translation(-0.5, 0.0, 0.0);
        let obs = vec![normalized(&(left * p_w)), normalized(&(right * p_w))];
        let got = triangulate(&[left, right], &obs).unwrap();
        assert_relative_eq!(got, p_w, epsilon = 1e-9);
    }

    #[test]
    fn three_views() {
        let p_w = Point3::new(-1.0, 0.5, 8.0);
        let poses = vec![
            Isometry3::identity(),
            Isometry3::translation(-0.5, 0.0, 0.0),
            Isometry3::translation(0.2, -0.3, 0.1),
        ];
        let obs: Vec<_> = poses.iter().map(|t| normalized(&(t * p_w))).collect();
        let got = triangulate(&poses, &obs).unwrap();
        assert_relative_eq!(got, p_w, epsilon = 1e-9);
    }

    #[test]
    fn identical_views_are_degenerate() {
        let p_w = Point3::new(0.0, 0.0, 4.0);
        let pose = Isometry3::identity();
        let obs = vec![normalized(&(pose * p_w)), normalized(&(pose * p_w))];
        match triangulate(&[pose, pose], &obs) {
            Err(GeomError::DegenerateGeometry) => {}
            other => panic!("expected degenerate geometry, got {other:?}"),
        }
    }

    #[test]
    fn one_view_is_not_enough() {
        let obs = vec![Vector3::new(0.0, 0.0, 1.0)];
        assert!(matches!(
            triangulate(&[Isometry3::identity()], &obs),
            Err(GeomError::NotEnoughPoints)
        ));
    }
}
